//! Configuration management for tillsync.
//!
//! This module handles loading and saving configuration to/from a JSON file
//! in a config directory. The config directory can be customized.
//!
//! Includes:
//! - database_file: path of the local SQLite cache
//! - collections: the fixed set of supported collection names
//! - remote: base URL and timeout of the remote document store
//! - sync: retry threshold and reconnect behaviour

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TillError, TillResult};
use crate::validation::validate_collection_name;

/// Remote document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the document store API (None = offline-only client)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Failed replays before a mutation is dead-lettered (None = retry forever)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    /// How long connectivity must hold before a reconnect triggers a drain
    #[serde(default = "default_reconnect_debounce_ms")]
    pub reconnect_debounce_ms: u64,
    /// Drain automatically when connectivity returns
    #[serde(default = "default_true")]
    pub sync_on_reconnect: bool,
    /// Stamp new records with their provisional key as a stable client identity
    #[serde(default)]
    pub stamp_client_key: bool,
}

fn default_max_attempts() -> Option<u32> {
    Some(25)
}

fn default_reconnect_debounce_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reconnect_debounce_ms: default_reconnect_debounce_ms(),
            sync_on_reconnect: true,
            stamp_client_key: false,
        }
    }
}

fn default_collections() -> Vec<String> {
    ["users", "employees", "services", "customers", "payments"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Supported collection names
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// Remote store configuration
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            collections: default_collections(),
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ConfigData {
    fn with_database_in(config_dir: &Path) -> Self {
        let mut data = ConfigData::default();
        data.database_file = config_dir.join("tillsync.db").to_string_lossy().to_string();
        data
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> TillResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("tillsync")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(TillError::Config(
                        "config_dir is required without the desktop feature".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(
                        path = %config_file.display(),
                        "Unreadable config, falling back to defaults: {}",
                        e
                    );
                    ConfigData::with_database_in(&config_dir)
                }),
                Err(_) => ConfigData::with_database_in(&config_dir),
            }
        } else {
            ConfigData::with_database_in(&config_dir)
        };

        for name in &data.collections {
            validate_collection_name(name)?;
        }

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Build a configuration that is never written to disk (for embedding
    /// and tests).
    pub fn from_data(data: ConfigData) -> TillResult<Self> {
        for name in &data.collections {
            validate_collection_name(name)?;
        }
        Ok(Self {
            config_dir: PathBuf::new(),
            config_file: PathBuf::new(),
            data,
        })
    }

    /// Save configuration to file
    pub fn save(&self) -> TillResult<()> {
        if self.config_file.as_os_str().is_empty() {
            return Ok(());
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the raw configuration data
    pub fn data(&self) -> &ConfigData {
        &self.data
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the supported collection names
    pub fn collections(&self) -> &[String] {
        &self.data.collections
    }

    /// Add a supported collection
    pub fn add_collection(&mut self, name: &str) -> TillResult<bool> {
        validate_collection_name(name)?;
        if self.data.collections.iter().any(|c| c == name) {
            return Ok(false);
        }
        self.data.collections.push(name.to_string());
        self.save()?;
        Ok(true)
    }

    /// Get remote configuration
    pub fn remote_config(&self) -> &RemoteConfig {
        &self.data.remote
    }

    /// Set the remote base URL
    pub fn set_remote_url(&mut self, url: &str) -> TillResult<()> {
        let trimmed = url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(TillError::validation("remote.base_url", "must be an http(s) URL"));
        }
        self.data.remote.base_url = Some(trimmed.to_string());
        self.save()
    }

    /// Get sync configuration
    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    /// Set the dead-letter threshold (None = retry forever)
    pub fn set_max_attempts(&mut self, max_attempts: Option<u32>) -> TillResult<()> {
        if max_attempts == Some(0) {
            return Err(TillError::validation("sync.max_attempts", "must be at least 1"));
        }
        self.data.sync.max_attempts = max_attempts;
        self.save()
    }

    /// Enable or disable draining on reconnect
    pub fn set_sync_on_reconnect(&mut self, enabled: bool) -> TillResult<()> {
        self.data.sync.sync_on_reconnect = enabled;
        self.save()
    }

    /// Enable or disable `_client_key` stamping on new records
    pub fn set_stamp_client_key(&mut self, enabled: bool) -> TillResult<()> {
        self.data.sync.stamp_client_key = enabled;
        self.save()
    }
}
