//! Error types for metacache core operations.
//!
//! This module defines well-structured error types using `thiserror` for
//! library-level errors, while collaborator traits and higher-level code use
//! `anyhow` for convenient error handling.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using MetacacheError
pub type Result<T> = std::result::Result<T, MetacacheError>;

/// Core error types for metacache operations.
///
/// These errors represent specific failure modes that callers may want to
/// handle differently (e.g., deleting the cache file and rebuilding it when
/// it turns out to be corrupt).
#[derive(Error, Debug)]
pub enum MetacacheError {
    // === Log Store Errors ===
    /// The log store could not be read; nothing was written to the cache
    #[error("log store unavailable: {operation} failed: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    // === Cache Errors ===
    /// The cache file exists but is corrupted or unreadable
    #[error("cache at {path} is corrupted: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    /// The cache schema version doesn't match the current version
    #[error("cache schema version mismatch: found {found}, expected {expected}")]
    CacheVersionMismatch { found: i64, expected: i64 },

    /// Any other SQLite failure
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    // === Query Errors ===
    /// The query string could not be parsed
    #[error("invalid query at position {position} ({fragment:?}): {reason}")]
    QueryParse {
        position: usize,
        fragment: String,
        reason: String,
    },

    /// A field filter names a field that has no column in the cache
    #[error("unknown field {field:?} at position {position}")]
    UnknownField { field: String, position: usize },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetacacheError {
    /// Returns true if the cache file should be deleted and rebuilt from scratch
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            MetacacheError::CacheCorrupt { .. } | MetacacheError::CacheVersionMismatch { .. }
        )
    }

    /// Returns true if this error came from the query string rather than the cache
    pub fn is_query_error(&self) -> bool {
        matches!(
            self,
            MetacacheError::QueryParse { .. } | MetacacheError::UnknownField { .. }
        )
    }

    /// Create a store error from a collaborator failure
    pub fn store(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        MetacacheError::StoreUnavailable {
            operation: operation.into(),
            reason: format!("{:#}", err),
        }
    }

    /// Create a query parse error
    pub fn query(position: usize, fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        MetacacheError::QueryParse {
            position,
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    /// Classify a SQLite error raised while touching the cache at `path`.
    ///
    /// Corruption and "not a database" failures become `CacheCorrupt` so
    /// callers can recover by rebuilding; everything else stays `Database`.
    pub fn from_sqlite(path: impl Into<PathBuf>, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                MetacacheError::CacheCorrupt {
                    path: path.into(),
                    reason: err.to_string(),
                }
            }
            _ => MetacacheError::Database(err),
        }
    }
}

/// A recoverable problem found while decoding one metadata log.
///
/// Warnings never abort decoding: the offending entry is skipped and the
/// remaining entries are replayed as usual.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    #[error("line {line}: unparseable timestamp {token:?}")]
    BadTimestamp { line: usize, token: String },

    #[error("line {line}: value {token:?} has no preceding field name")]
    OrphanValue { line: usize, token: String },

    #[error("line {line}: invalid encoded value {token:?}: {reason}")]
    BadEncoding {
        line: usize,
        token: String,
        reason: String,
    },

    #[error("line {line}: empty value operation {token:?}")]
    EmptyValue { line: usize, token: String },
}

impl DecodeWarning {
    /// One-based line number of the skipped entry
    pub fn line(&self) -> usize {
        match self {
            DecodeWarning::BadTimestamp { line, .. }
            | DecodeWarning::OrphanValue { line, .. }
            | DecodeWarning::BadEncoding { line, .. }
            | DecodeWarning::EmptyValue { line, .. } => *line,
        }
    }
}
