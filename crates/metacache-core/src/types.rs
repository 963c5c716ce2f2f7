//! Core data types for metacache.
//!
//! This module defines the fundamental data structures shared by the decoder,
//! the cache builder and the search executor. These types are designed to be:
//!
//! - **Serializable**: Search results are handed to display and export code
//! - **Store-agnostic**: No git (or any other log store) details leak into them
//! - **Cheap to compare**: Keys and revisions are plain string newtypes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Stable, content-addressed identifier of a tracked item.
///
/// Keys never change for the lifetime of an item, even when the file is
/// renamed or dropped from the local checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub String);

impl Key {
    /// Create a new key
    pub fn new(key: impl Into<String>) -> Self {
        Key(key.into())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

/// Point-in-time identifier for the whole log store (a commit id for git).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionId(pub String);

impl RevisionId {
    /// Create a new revision id
    pub fn new(id: impl Into<String>) -> Self {
        RevisionId(id.into())
    }

    /// Get the revision as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The raw metadata log recorded for one item, as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlob {
    pub key: Key,
    pub content: String,
}

impl LogBlob {
    pub fn new(key: impl Into<Key>, content: impl Into<String>) -> Self {
        LogBlob {
            key: key.into(),
            content: content.into(),
        }
    }
}

/// Where an item currently lives in the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLocation {
    /// Path relative to the working tree root
    pub path: String,

    /// Whether the file content is available locally
    pub present: bool,
}

impl ItemLocation {
    pub fn new(path: impl Into<String>, present: bool) -> Self {
        ItemLocation {
            path: path.into(),
            present,
        }
    }
}

/// How a field's values are stored and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text, stored in a TEXT column
    Text,
    /// Floating point number (bpm)
    Real,
    /// Integer number (rating, year, track number)
    Integer,
    /// Multi-value group membership, always stored in the join table
    Group,
    /// The item's relative path
    Path,
    /// The local presence flag
    Presence,
}

/// Every field the cache knows how to store and filter on.
///
/// Metadata fields are decoded from the log; `Path` and `Present` come from
/// the key-to-path mapping and can only be used in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Artist,
    Title,
    Album,
    Genre,
    Comment,
    MusicalKey,
    Color,
    Bpm,
    Rating,
    Year,
    TrackNumber,
    Crate,
    Path,
    Present,
}

impl Field {
    /// Fields that are decoded from metadata logs
    pub const METADATA: [Field; 12] = [
        Field::Artist,
        Field::Title,
        Field::Album,
        Field::Genre,
        Field::Comment,
        Field::MusicalKey,
        Field::Color,
        Field::Bpm,
        Field::Rating,
        Field::Year,
        Field::TrackNumber,
        Field::Crate,
    ];

    /// Fields covered by the full-text index (besides the path)
    pub const TEXT_INDEXED: [Field; 4] = [Field::Artist, Field::Title, Field::Album, Field::Genre];

    /// Look up a field by log or query name (case-insensitive, with aliases).
    pub fn from_name(name: &str) -> Option<Field> {
        let field = match name.to_ascii_lowercase().as_str() {
            "artist" => Field::Artist,
            "title" => Field::Title,
            "album" => Field::Album,
            "genre" => Field::Genre,
            "comment" => Field::Comment,
            "key" | "initialkey" => Field::MusicalKey,
            "color" | "colour" => Field::Color,
            "bpm" => Field::Bpm,
            "rating" => Field::Rating,
            "year" => Field::Year,
            "track" | "tracknumber" => Field::TrackNumber,
            "crate" | "crates" => Field::Crate,
            "path" | "file" => Field::Path,
            "present" => Field::Present,
            _ => return None,
        };
        Some(field)
    }

    /// Canonical name, used in the join table and when rendering queries
    pub fn name(&self) -> &'static str {
        match self {
            Field::Artist => "artist",
            Field::Title => "title",
            Field::Album => "album",
            Field::Genre => "genre",
            Field::Comment => "comment",
            Field::MusicalKey => "key",
            Field::Color => "color",
            Field::Bpm => "bpm",
            Field::Rating => "rating",
            Field::Year => "year",
            Field::TrackNumber => "track",
            Field::Crate => "crate",
            Field::Path => "path",
            Field::Present => "present",
        }
    }

    /// Column in the `items` table, if the field has one
    pub fn column(&self) -> Option<&'static str> {
        match self {
            Field::Artist => Some("artist"),
            Field::Title => Some("title"),
            Field::Album => Some("album"),
            Field::Genre => Some("genre"),
            Field::Comment => Some("comment"),
            Field::MusicalKey => Some("musical_key"),
            Field::Color => Some("color"),
            Field::Bpm => Some("bpm"),
            Field::Rating => Some("rating"),
            Field::Year => Some("year"),
            Field::TrackNumber => Some("track_number"),
            Field::Path => Some("path"),
            Field::Present => Some("present"),
            Field::Crate => None,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Artist
            | Field::Title
            | Field::Album
            | Field::Genre
            | Field::Comment
            | Field::MusicalKey
            | Field::Color => FieldKind::Text,
            Field::Bpm => FieldKind::Real,
            Field::Rating | Field::Year | Field::TrackNumber => FieldKind::Integer,
            Field::Crate => FieldKind::Group,
            Field::Path => FieldKind::Path,
            Field::Present => FieldKind::Presence,
        }
    }

    /// True for fields compared numerically
    pub fn is_numeric(&self) -> bool {
        matches!(self.kind(), FieldKind::Real | FieldKind::Integer)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One tracked item as stored in the cache and returned by searches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    /// Internal row id; stable across refreshes that don't touch this item
    pub id: i64,

    /// Stable content key
    pub key: Key,

    /// Relative path in the working tree (last known, even when absent)
    pub path: String,

    /// Whether the file content is available locally
    pub present: bool,

    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
    pub musical_key: Option<String>,
    pub color: Option<String>,
    pub bpm: Option<f64>,
    pub rating: Option<i64>,
    pub year: Option<i64>,
    pub track_number: Option<i64>,

    /// Per-value memberships: the `crate` group plus any field that decoded
    /// to more than one value, keyed by canonical field name
    pub memberships: BTreeMap<String, Vec<String>>,

    /// When this row was last written by the builder
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Crates this item belongs to
    pub fn crates(&self) -> &[String] {
        self.memberships
            .get(Field::Crate.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All values of a text field, whether stored as a scalar or per value
    pub fn values(&self, field: Field) -> Vec<String> {
        if let Some(values) = self.memberships.get(field.name()) {
            return values.clone();
        }
        let scalar = match field {
            Field::Artist => self.artist.clone(),
            Field::Title => self.title.clone(),
            Field::Album => self.album.clone(),
            Field::Genre => self.genre.clone(),
            Field::Comment => self.comment.clone(),
            Field::MusicalKey => self.musical_key.clone(),
            Field::Color => self.color.clone(),
            Field::Bpm => self.bpm.map(|v| v.to_string()),
            Field::Rating => self.rating.map(|v| v.to_string()),
            Field::Year => self.year.map(|v| v.to_string()),
            Field::TrackNumber => self.track_number.map(|v| v.to_string()),
            Field::Path => Some(self.path.clone()),
            Field::Present => Some(self.present.to_string()),
            Field::Crate => None,
        };
        scalar.into_iter().collect()
    }
}

/// The singleton row describing the last successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildState {
    /// Last log-store revision fully reflected in the cache
    pub revision: RevisionId,

    /// When the cache was last written
    pub built_at: DateTime<Utc>,

    /// Number of items in the cache after that build
    pub item_count: u64,
}

/// Result of a full build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub revision: RevisionId,
    pub item_count: u64,
    /// Number of decode warnings logged during the build
    pub warnings: u64,
    pub duration: Duration,
}

/// Result of an incremental refresh that found changes
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSummary {
    /// Revision the cache reflected before; `None` if it was never built
    pub previous: Option<RevisionId>,
    pub revision: RevisionId,
    /// Keys reported as changed by the store
    pub changed: u64,
    /// Items inserted or rewritten
    pub updated: u64,
    /// Items deleted because their log vanished
    pub removed: u64,
    pub warnings: u64,
    pub duration: Duration,
}
