//! Log store backend traits.
//!
//! This module defines the abstract interface that log-store backends must
//! implement. The decoder, builder and search code interact only through
//! these traits, so the core never shells out to git (or anything else)
//! itself.
//!
//! ## Implementing a New Backend
//!
//! 1. Create a new crate (e.g., `metacache-backend-git`)
//! 2. Implement `LogStore` for your store
//! 3. Make `list_items` and `resolve_paths` bulk operations; the builder
//!    calls each of them once per build
//! 4. Hand the backend to `build_cache` / `refresh_cache`

use crate::types::{ItemLocation, Key, LogBlob, RevisionId};
use std::collections::{BTreeSet, HashMap};

/// Read-only access to a versioned store of per-item metadata logs.
///
/// ## Error Handling
///
/// Every method returns `anyhow::Result`; the builder wraps failures in
/// `MetacacheError::StoreUnavailable` and aborts without writing.
pub trait LogStore {
    /// The store's current revision.
    fn current_revision(&self) -> anyhow::Result<RevisionId>;

    /// Every item's log as of `revision`, fetched in bulk.
    fn list_items(&self, revision: &RevisionId) -> anyhow::Result<Vec<LogBlob>>;

    /// Keys whose log differs between two revisions, including keys whose
    /// log was added or deleted.
    fn changed_items(&self, old: &RevisionId, new: &RevisionId) -> anyhow::Result<BTreeSet<Key>>;

    /// Logs for a subset of keys as of `revision`. Keys without a log at that
    /// revision are simply missing from the result.
    ///
    /// The default implementation filters `list_items`; backends that can
    /// address single items cheaply should override it.
    fn fetch_items(
        &self,
        revision: &RevisionId,
        keys: &BTreeSet<Key>,
    ) -> anyhow::Result<Vec<LogBlob>> {
        Ok(self
            .list_items(revision)?
            .into_iter()
            .filter(|blob| keys.contains(&blob.key))
            .collect())
    }

    /// Current relative path and local presence for each known key, resolved
    /// in one bulk query. Keys that are not in the working tree are omitted.
    fn resolve_paths(&self, keys: &BTreeSet<Key>) -> anyhow::Result<HashMap<Key, ItemLocation>>;

    /// Backend name (e.g., "git", "memory")
    fn name(&self) -> &'static str;
}

/// Progress reporting for build operations
pub trait BuildProgress {
    /// Called periodically while logs are decoded
    fn on_progress(&self, items_done: u64, items_total: u64);

    /// Called when the build or refresh has committed
    fn on_complete(&self, items_total: u64);
}

/// A simple progress reporter that logs to tracing
pub struct LoggingProgress {
    operation: String,
}

impl LoggingProgress {
    pub fn new(operation: impl Into<String>) -> Self {
        LoggingProgress {
            operation: operation.into(),
        }
    }
}

impl BuildProgress for LoggingProgress {
    fn on_progress(&self, items_done: u64, items_total: u64) {
        tracing::debug!(
            operation = %self.operation,
            done = items_done,
            total = items_total,
            "Decoding progress"
        );
    }

    fn on_complete(&self, items_total: u64) {
        tracing::info!(
            operation = %self.operation,
            items = items_total,
            "Cache write complete"
        );
    }
}

/// Progress reporter that ignores all updates
pub struct NoProgress;

impl BuildProgress for NoProgress {
    fn on_progress(&self, _items_done: u64, _items_total: u64) {}

    fn on_complete(&self, _items_total: u64) {}
}
