//! In-memory log store for exercising builds and refreshes.
//!
//! Compiled for this crate's tests and, behind the `test-util` feature, for
//! downstream crates' tests.

use crate::backend::LogStore;
use crate::types::{ItemLocation, Key, LogBlob, RevisionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    logs: BTreeMap<Key, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    revisions: Vec<Snapshot>,
    locations: HashMap<Key, ItemLocation>,
    available: bool,
}

/// An in-memory log store.
///
/// Every mutation creates a new revision (`r1`, `r2`, ...) holding
/// the full set of logs at that point, which makes it easy to exercise full
/// builds and incremental refreshes without a real repository.
pub struct MemoryLogStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    /// Create an empty store with an initial empty revision `r0`.
    pub fn new() -> Self {
        MemoryLogStore {
            state: Mutex::new(MemoryState {
                revisions: vec![Snapshot::default()],
                locations: HashMap::new(),
                available: true,
            }),
        }
    }

    /// Set an item's full log and location, committing a new revision.
    pub fn put(&self, key: &str, log: &str, path: &str, present: bool) -> RevisionId {
        self.set_location(key, path, present);
        self.commit(|logs| {
            logs.insert(Key::new(key), log.to_string());
        })
    }

    /// Append a log entry to an item, committing a new revision.
    pub fn append(&self, key: &str, entry: &str) -> RevisionId {
        self.commit(|logs| {
            let log = logs.entry(Key::new(key)).or_default();
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(entry);
            log.push('\n');
        })
    }

    /// Remove an item's log, committing a new revision.
    pub fn remove(&self, key: &str) -> RevisionId {
        self.commit(|logs| {
            logs.remove(&Key::new(key));
        })
    }

    /// Change where an item lives without touching its log.
    pub fn set_location(&self, key: &str, path: &str, present: bool) {
        self.lock()
            .locations
            .insert(Key::new(key), ItemLocation::new(path, present));
    }

    /// Drop an item from the working tree mapping.
    pub fn forget_location(&self, key: &str) {
        self.lock().locations.remove(&Key::new(key));
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock()
    }

    fn commit(&self, change: impl FnOnce(&mut BTreeMap<Key, String>)) -> RevisionId {
        let mut state = self.lock();
        let mut next = state.revisions.last().cloned().unwrap_or_default();
        change(&mut next.logs);
        state.revisions.push(next);
        RevisionId::new(format!("r{}", state.revisions.len() - 1))
    }

    fn snapshot(&self, revision: &RevisionId) -> anyhow::Result<Snapshot> {
        let state = self.lock();
        if !state.available {
            anyhow::bail!("memory store is offline");
        }
        let index = revision
            .as_str()
            .strip_prefix('r')
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| anyhow::anyhow!("malformed revision {}", revision))?;
        state
            .revisions
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown revision {}", revision))
    }
}

impl LogStore for MemoryLogStore {
    fn current_revision(&self) -> anyhow::Result<RevisionId> {
        let state = self.lock();
        if !state.available {
            anyhow::bail!("memory store is offline");
        }
        Ok(RevisionId::new(format!("r{}", state.revisions.len() - 1)))
    }

    fn list_items(&self, revision: &RevisionId) -> anyhow::Result<Vec<LogBlob>> {
        Ok(self
            .snapshot(revision)?
            .logs
            .into_iter()
            .map(|(key, content)| LogBlob { key, content })
            .collect())
    }

    fn changed_items(&self, old: &RevisionId, new: &RevisionId) -> anyhow::Result<BTreeSet<Key>> {
        let old = self.snapshot(old)?.logs;
        let new = self.snapshot(new)?.logs;

        let keys: HashSet<&Key> = old.keys().chain(new.keys()).collect();
        Ok(keys
            .into_iter()
            .filter(|key| old.get(*key) != new.get(*key))
            .cloned()
            .collect())
    }

    fn resolve_paths(&self, keys: &BTreeSet<Key>) -> anyhow::Result<HashMap<Key, ItemLocation>> {
        let state = self.lock();
        if !state.available {
            anyhow::bail!("memory store is offline");
        }
        Ok(keys
            .iter()
            .filter_map(|key| state.locations.get(key).map(|loc| (key.clone(), loc.clone())))
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
