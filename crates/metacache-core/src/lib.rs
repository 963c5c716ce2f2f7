//! # metacache Core Library
//!
//! This crate turns per-item metadata logs into a local SQLite cache and
//! answers boolean/field-filter queries against it. The log store itself is
//! abstracted behind the `LogStore` trait, so nothing here depends on git.
//!
//! ## Architecture
//!
//! - **Decoder** (`decode`): Replays one item's log into its field state
//! - **Traits** (`backend`): Interface for log-store backends
//! - **Memory** (`memory`): In-memory store for tests (`test-util` feature)
//! - **Types** (`types`): Keys, revisions, fields and cached items
//! - **Cache** (`cache`): SQLite schema, full-text index and item loading
//! - **Builder** (`builder`): Full builds and incremental refreshes
//! - **Query** (`query`): Query string grammar and AST
//! - **Search** (`search`): Compiles the AST to SQL and runs it
//! - **Config** (`config`): Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use metacache_core::{build_cache, execute_search, parse_query, CacheStore, LoggingProgress};
//!
//! let mut cache = CacheStore::open("metacache.sqlite")?;
//! build_cache(&mut cache, &store, &LoggingProgress::new("build"))?;
//!
//! let query = parse_query("genre:psy -genre:progressive bpm:140-160")?;
//! for item in execute_search(&cache, &query)? {
//!     println!("{}", item.path);
//! }
//! ```

pub mod backend;
pub mod builder;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod query;
pub mod search;
pub mod types;

// Re-export commonly used types
pub use backend::{BuildProgress, LogStore, LoggingProgress, NoProgress};
pub use builder::{build_cache, refresh_cache, with_cache};
pub use cache::CacheStore;
pub use config::Config;
pub use decode::{decode_log, DecodedLog};
pub use error::{DecodeWarning, MetacacheError, Result};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryLogStore;
pub use query::{parse_query, Clause, FieldFilter, FilterOperator, OrGroup, SearchQuery, TextTerm};
pub use search::{count_matches, execute_search, execute_search_limited};
pub use types::{
    BuildState, BuildSummary, Field, Item, ItemLocation, Key, LogBlob, RefreshSummary, RevisionId,
};
