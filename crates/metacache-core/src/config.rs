//! Configuration management for metacache.
//!
//! This module provides configuration loading, saving, and defaults.
//! Configuration is stored in TOML format in a platform-appropriate location.

use crate::cache::CACHE_FILE_NAME;
use crate::error::{MetacacheError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure for metacache.
///
/// ## Example Configuration File (metacache.toml)
///
/// ```toml
/// [general]
/// log_level = "info"
/// max_results = 1000
///
/// [store]
/// repository = "~/music"
/// branch = "git-annex"
/// log_suffix = ".log.met"
///
/// [cache]
/// path = "/var/cache/metacache/music.sqlite"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Where the metadata logs live
    pub store: StoreConfig,

    /// Where the cache file lives
    pub cache: CacheConfig,
}

/// General configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Default number of query results to print (0 = unlimited)
    pub max_results: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_level: "info".to_string(),
            max_results: 1000,
        }
    }
}

/// Log store location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Any path inside the repository to index
    pub repository: PathBuf,

    /// Branch holding the metadata logs
    pub branch: String,

    /// File suffix of per-item metadata logs on that branch
    pub log_suffix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            repository: PathBuf::from("."),
            branch: "git-annex".to_string(),
            log_suffix: ".log.met".to_string(),
        }
    }
}

/// Cache file location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Explicit cache file (None = next to the store's metadata)
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| MetacacheError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| MetacacheError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "metacache").ok_or_else(|| {
            MetacacheError::ConfigError {
                reason: "Could not determine config directory".to_string(),
            }
        })?;

        Ok(dirs.config_dir().join("metacache.toml"))
    }

    /// Resolve the cache file, given the store's metadata directory
    /// (for git, `<git-dir>/annex`).
    pub fn cache_path(&self, metadata_dir: &Path) -> PathBuf {
        match self.cache.path {
            Some(ref path) => path.clone(),
            None => metadata_dir.join(CACHE_FILE_NAME),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.branch.trim().is_empty() {
            return Err(MetacacheError::ConfigError {
                reason: "store.branch must not be empty".to_string(),
            });
        }
        if self.store.log_suffix.is_empty() {
            return Err(MetacacheError::ConfigError {
                reason: "store.log_suffix must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
