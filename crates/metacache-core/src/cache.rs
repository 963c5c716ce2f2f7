//! Persistent cache storage.
//!
//! The cache is a single SQLite file that can be deleted at any time and
//! rebuilt from the log store. It holds:
//!
//! - `items`: one row per key with scalar metadata, path and presence
//! - `memberships`: per-value rows for the `crate` group field and for any
//!   field that decoded to more than one value
//! - `empty_fields`: fields that appeared in a log but have no surviving value
//! - `items_fts`: an FTS5 index over artist, title, album, genre and path
//! - `build_state`: the singleton row recording the last built revision
//!
//! ## Atomicity
//!
//! The builder stages every change of a build inside one transaction, so
//! readers see either the old cache or the new one. Schema changes are
//! detected through `PRAGMA user_version`; a mismatch or a corrupt file is
//! reported as an error for which `requires_rebuild()` is true.

use crate::error::{MetacacheError, Result};
use crate::types::{BuildState, Field, Item, Key, RevisionId};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current cache schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Default cache file name, placed next to the log store's metadata
pub const CACHE_FILE_NAME: &str = "metacache.sqlite";

/// Maximum number of bound parameters per `IN (...)` chunk
const IN_CHUNK: usize = 500;

/// SQL scalar function folding a value to lowercase across all of Unicode.
pub(crate) const FOLD_FUNCTION: &str = "mc_fold";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    id            INTEGER PRIMARY KEY,
    key           TEXT NOT NULL UNIQUE,
    path          TEXT,
    present       INTEGER NOT NULL DEFAULT 0,
    artist        TEXT,
    title         TEXT,
    album         TEXT,
    genre         TEXT,
    comment       TEXT,
    musical_key   TEXT,
    color         TEXT,
    bpm           REAL,
    rating        INTEGER,
    year          INTEGER,
    track_number  INTEGER,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memberships (
    item_id  INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    field    TEXT NOT NULL,
    value    TEXT NOT NULL,
    UNIQUE (item_id, field, value)
);

CREATE INDEX IF NOT EXISTS idx_memberships_field_value ON memberships(field, value);

CREATE TABLE IF NOT EXISTS empty_fields (
    item_id  INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    field    TEXT NOT NULL,
    PRIMARY KEY (item_id, field)
);

CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
    artist,
    title,
    album,
    genre,
    path,
    tokenize = 'unicode61 remove_diacritics 2',
    prefix = '2 3'
);

CREATE TABLE IF NOT EXISTS build_state (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    revision    TEXT NOT NULL,
    built_at    INTEGER NOT NULL,
    item_count  INTEGER NOT NULL
);
";

/// Columns selected for every `Item`, in `item_from_row` order.
pub(crate) const ITEM_COLUMNS: &str = "items.id, items.key, items.path, items.present, \
     items.artist, items.title, items.album, items.genre, items.comment, \
     items.musical_key, items.color, items.bpm, items.rating, items.year, \
     items.track_number, items.updated_at";

/// A decoded scalar value ready to be bound to its column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScalarValue {
    Text(String),
    Real(f64),
    Integer(i64),
}

/// Everything the builder writes for one item.
#[derive(Debug, Clone, Default)]
pub(crate) struct ItemRecord {
    pub key: Key,

    /// `None` keeps the last known path (or falls back to the key for new rows)
    pub path: Option<String>,

    pub present: bool,

    /// Fields with exactly one surviving value
    pub scalars: BTreeMap<Field, ScalarValue>,

    /// Per-value rows: (field, value)
    pub memberships: Vec<(Field, String)>,

    /// Fields decoded as present-but-empty
    pub empty_fields: Vec<Field>,
}

impl ItemRecord {
    fn text(&self, field: Field) -> Option<&str> {
        match self.scalars.get(&field) {
            Some(ScalarValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    fn real(&self, field: Field) -> Option<f64> {
        match self.scalars.get(&field) {
            Some(ScalarValue::Real(v)) => Some(*v),
            _ => None,
        }
    }

    fn integer(&self, field: Field) -> Option<i64> {
        match self.scalars.get(&field) {
            Some(ScalarValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// Text indexed for a field: the scalar value or all per-value rows.
    fn fts_text(&self, field: Field) -> String {
        if let Some(v) = self.text(field) {
            return v.to_string();
        }
        self.memberships
            .iter()
            .filter(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Handle to one cache database.
///
/// The builder takes it mutably for writes; searches only need `&CacheStore`.
/// Several handles (on different files, or in memory) can coexist.
pub struct CacheStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl CacheStore {
    /// Open (creating if needed) the cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        debug!(path = %path.display(), "Opening cache");

        let conn = Connection::open(&path).map_err(|e| MetacacheError::from_sqlite(&path, e))?;
        let store = CacheStore {
            conn,
            path: Some(path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open a private in-memory cache (used by tests and one-shot tools).
    pub fn open_in_memory() -> Result<Self> {
        let store = CacheStore {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open the cache, deleting and recreating it if it is corrupt or was
    /// written by a different schema version.
    ///
    /// Returns the store and whether it had to be reset.
    pub fn open_or_reset(path: impl AsRef<Path>) -> Result<(Self, bool)> {
        let path = path.as_ref();
        match Self::open(path) {
            Ok(store) => Ok((store, false)),
            Err(e) if e.requires_rebuild() => {
                warn!(path = %path.display(), error = %e, "Cache unusable, recreating");
                Self::remove_files(path)?;
                Ok((Self::open(path)?, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a cache file and its WAL side files. Returns whether anything
    /// was removed.
    pub fn remove_files(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let mut removed = false;

        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(suffix);
            let candidate = PathBuf::from(candidate);
            if candidate.exists() {
                fs::remove_file(&candidate)?;
                removed = true;
            }
        }

        if removed {
            info!(path = %path.display(), "Cache removed");
        }
        Ok(removed)
    }

    /// On-disk location, or `None` for in-memory caches
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        self.init_schema().map_err(|e| self.classify(e))
    }

    fn init_schema(&self) -> Result<()> {
        if self.path.is_some() {
            self.conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        self.conn.pragma_update(None, "foreign_keys", true)?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version != 0 && version != SCHEMA_VERSION {
            return Err(MetacacheError::CacheVersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        self.conn.execute_batch(SCHEMA)?;
        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        register_fold(&self.conn)?;
        Ok(())
    }

    /// Turn SQLite corruption into `CacheCorrupt` so callers can rebuild.
    pub(crate) fn classify(&self, err: MetacacheError) -> MetacacheError {
        match err {
            MetacacheError::Database(e) => {
                let path = self
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(":memory:"));
                MetacacheError::from_sqlite(path, e)
            }
            other => other,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// The last completed build, or `None` if the cache was never built.
    pub fn build_state(&self) -> Result<Option<BuildState>> {
        self.read_build_state(&self.conn).map_err(|e| self.classify(e))
    }

    pub(crate) fn read_build_state(&self, conn: &Connection) -> Result<Option<BuildState>> {
        let state = conn
            .query_row(
                "SELECT revision, built_at, item_count FROM build_state WHERE id = 1",
                [],
                |row| {
                    Ok(BuildState {
                        revision: RevisionId::new(row.get::<_, String>(0)?),
                        built_at: millis_to_datetime(row.get(1)?),
                        item_count: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Number of items currently cached
    pub fn item_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .map_err(|e| self.classify(e.into()))?;
        Ok(count.max(0) as u64)
    }

    /// Remove every cached row, including the build state.
    ///
    /// The next `refresh_cache` then performs a full build.
    pub fn clear(&mut self) -> Result<()> {
        let result = (|| -> Result<()> {
            let tx = self.conn.transaction()?;
            tx.execute("DELETE FROM items_fts", [])?;
            tx.execute("DELETE FROM memberships", [])?;
            tx.execute("DELETE FROM empty_fields", [])?;
            tx.execute("DELETE FROM items", [])?;
            tx.execute("DELETE FROM build_state", [])?;
            tx.commit()?;
            Ok(())
        })();
        result.map_err(|e| self.classify(e))?;
        info!("Cache cleared");
        Ok(())
    }

    /// Look up a single item by key, including its memberships.
    pub fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE items.key = ?1", ITEM_COLUMNS);
        let item = self
            .conn
            .query_row(&sql, [key.as_str()], item_from_row)
            .optional()
            .map_err(|e| self.classify(e.into()))?;

        match item {
            Some(item) => {
                let mut items = vec![item];
                self.attach_memberships(&mut items)?;
                Ok(items.pop())
            }
            None => Ok(None),
        }
    }

    /// Fill in `Item::memberships` for a batch of items.
    pub(crate) fn attach_memberships(&self, items: &mut [Item]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut by_id: BTreeMap<i64, BTreeMap<String, Vec<String>>> = BTreeMap::new();

        for chunk in items.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT item_id, field, value FROM memberships \
                 WHERE item_id IN ({}) ORDER BY item_id, field, value",
                placeholders
            );
            let mut st = self.conn.prepare(&sql).map_err(|e| self.classify(e.into()))?;
            let rows = st
                .query_map(params_from_iter(chunk.iter().map(|i| i.id)), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| self.classify(e.into()))?;

            for row in rows {
                let (id, field, value) = row.map_err(|e| self.classify(e.into()))?;
                by_id.entry(id).or_default().entry(field).or_default().push(value);
            }
        }

        for item in items.iter_mut() {
            item.memberships = by_id.remove(&item.id).unwrap_or_default();
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").field("path", &self.path).finish()
    }
}

/// Map a row selected with `ITEM_COLUMNS` to an `Item` (without memberships).
pub(crate) fn item_from_row(row: &Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        key: Key::new(row.get::<_, String>(1)?),
        path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        present: row.get(3)?,
        artist: row.get(4)?,
        title: row.get(5)?,
        album: row.get(6)?,
        genre: row.get(7)?,
        comment: row.get(8)?,
        musical_key: row.get(9)?,
        color: row.get(10)?,
        bpm: row.get(11)?,
        rating: row.get(12)?,
        year: row.get(13)?,
        track_number: row.get(14)?,
        memberships: BTreeMap::new(),
        updated_at: millis_to_datetime(row.get(15)?),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

// === Write helpers used inside builder transactions ===

/// Insert or update an item row, keeping its row id. Returns the id.
pub(crate) fn upsert_item(conn: &Connection, record: &ItemRecord, now_millis: i64) -> Result<i64> {
    let id: i64 = conn.query_row(
        "INSERT INTO items (
            key, path, present, artist, title, album, genre, comment,
            musical_key, color, bpm, rating, year, track_number, updated_at
         ) VALUES (?1, COALESCE(?2, ?1), ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(key) DO UPDATE SET
            path = COALESCE(?2, items.path),
            present = excluded.present,
            artist = excluded.artist,
            title = excluded.title,
            album = excluded.album,
            genre = excluded.genre,
            comment = excluded.comment,
            musical_key = excluded.musical_key,
            color = excluded.color,
            bpm = excluded.bpm,
            rating = excluded.rating,
            year = excluded.year,
            track_number = excluded.track_number,
            updated_at = excluded.updated_at
         RETURNING id",
        params![
            record.key.as_str(),
            record.path.as_deref(),
            record.present,
            record.text(Field::Artist),
            record.text(Field::Title),
            record.text(Field::Album),
            record.text(Field::Genre),
            record.text(Field::Comment),
            record.text(Field::MusicalKey),
            record.text(Field::Color),
            record.real(Field::Bpm),
            record.integer(Field::Rating),
            record.integer(Field::Year),
            record.integer(Field::TrackNumber),
            now_millis,
        ],
        |row| row.get(0),
    )?;

    conn.execute("DELETE FROM memberships WHERE item_id = ?1", [id])?;
    {
        let mut st = conn.prepare_cached(
            "INSERT OR IGNORE INTO memberships (item_id, field, value) VALUES (?1, ?2, ?3)",
        )?;
        for (field, value) in &record.memberships {
            st.execute(params![id, field.name(), value])?;
        }
    }

    conn.execute("DELETE FROM empty_fields WHERE item_id = ?1", [id])?;
    {
        let mut st = conn
            .prepare_cached("INSERT OR IGNORE INTO empty_fields (item_id, field) VALUES (?1, ?2)")?;
        for field in &record.empty_fields {
            st.execute(params![id, field.name()])?;
        }
    }

    conn.execute("DELETE FROM items_fts WHERE rowid = ?1", [id])?;
    conn.execute(
        "INSERT INTO items_fts (rowid, artist, title, album, genre, path)
         SELECT id, ?2, ?3, ?4, ?5, path FROM items WHERE id = ?1",
        params![
            id,
            record.fts_text(Field::Artist),
            record.fts_text(Field::Title),
            record.fts_text(Field::Album),
            record.fts_text(Field::Genre),
        ],
    )?;

    Ok(id)
}

/// Delete an item and everything attached to it. Returns whether it existed.
pub(crate) fn delete_item(conn: &Connection, key: &Key) -> Result<bool> {
    let id: Option<i64> = conn
        .query_row("SELECT id FROM items WHERE key = ?1", [key.as_str()], |row| {
            row.get(0)
        })
        .optional()?;

    let Some(id) = id else {
        return Ok(false);
    };

    conn.execute("DELETE FROM items_fts WHERE rowid = ?1", [id])?;
    conn.execute("DELETE FROM items WHERE id = ?1", [id])?;
    Ok(true)
}

/// All keys currently cached
pub(crate) fn cached_keys(conn: &Connection) -> Result<Vec<Key>> {
    let mut st = conn.prepare("SELECT key FROM items ORDER BY id")?;
    let keys = st
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys.into_iter().map(Key::new).collect())
}

/// Drop every row of the text index (before a full rebuild).
pub(crate) fn clear_text_index(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM items_fts", [])?;
    Ok(())
}

pub(crate) fn write_build_state(conn: &Connection, state: &BuildState) -> Result<()> {
    conn.execute(
        "INSERT INTO build_state (id, revision, built_at, item_count) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            revision = excluded.revision,
            built_at = excluded.built_at,
            item_count = excluded.item_count",
        params![
            state.revision.as_str(),
            state.built_at.timestamp_millis(),
            state.item_count as i64,
        ],
    )?;
    Ok(())
}

/// Case folding applied to both stored values and query needles.
pub(crate) fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

fn register_fold(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        FOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let folded = match ctx.get_raw(0) {
                ValueRef::Null => None,
                ValueRef::Integer(i) => Some(i.to_string()),
                ValueRef::Real(f) => Some(f.to_string()),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    Some(fold_case(&String::from_utf8_lossy(bytes)))
                }
            };
            Ok(folded)
        },
    )?;
    Ok(())
}
