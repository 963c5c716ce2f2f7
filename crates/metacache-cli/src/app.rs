//! Application state management.

use metacache_backend_git::GitAnnexStore;
use metacache_core::{BuildProgress, CacheStore, Config, LogStore};
use std::path::PathBuf;
use tracing::info;

/// Shared application state.
pub struct App {
    /// Configuration
    pub config: Config,

    /// Log store, present when it was needed to locate the cache
    store: Option<GitAnnexStore>,

    /// Resolved cache file
    pub cache_path: PathBuf,
}

impl App {
    /// Create a new application instance.
    ///
    /// The repository is only opened here when the cache location depends
    /// on it; with `cache.path` configured, git is not touched until
    /// [`App::store`] is called.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let (store, cache_path) = match config.cache.path {
            Some(ref path) => (None, path.clone()),
            None => {
                let store = open_store(&config)?;
                let cache_path = config.cache_path(&store.metadata_dir());
                (Some(store), cache_path)
            }
        };

        info!(
            repository = %config.store.repository.display(),
            cache = %cache_path.display(),
            "Application initialized"
        );

        Ok(App {
            config,
            store,
            cache_path,
        })
    }

    /// The configured repository's log store.
    pub fn store(&self) -> anyhow::Result<GitAnnexStore> {
        match self.store {
            Some(ref store) => Ok(store.clone()),
            None => open_store(&self.config),
        }
    }

    /// Run `op` against the cache, rebuilding it from `store` if it turns
    /// out to be corrupt.
    pub fn with_cache<T>(
        &self,
        store: Option<&GitAnnexStore>,
        progress: &dyn BuildProgress,
        op: impl FnMut(&mut CacheStore) -> metacache_core::Result<T>,
    ) -> anyhow::Result<T> {
        let store = store.map(|store| store as &dyn LogStore);
        Ok(metacache_core::with_cache(
            &self.cache_path,
            store,
            progress,
            op,
        )?)
    }
}

fn open_store(config: &Config) -> anyhow::Result<GitAnnexStore> {
    Ok(GitAnnexStore::open(
        &config.store.repository,
        config.store.branch.clone(),
        config.store.log_suffix.clone(),
    )?)
}
