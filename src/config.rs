//! Configuration for opening an automation store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Default capacity when no limit is configured.
pub const DEFAULT_SCHEDULE_LIMIT: usize = 1000;

/// Settings used by [`crate::AutomationStore::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name. Names the database file and the worker thread.
    pub store_name: String,
    /// Maximum number of schedules the store may hold at any time.
    pub schedule_limit: usize,
    /// Use an ephemeral in-memory database instead of a file.
    pub in_memory: bool,
    /// Directory holding `{store_name}.db` when `in_memory` is false.
    pub root_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_name: "automation".to_owned(),
            schedule_limit: DEFAULT_SCHEDULE_LIMIT,
            in_memory: false,
            root_dir: default_root_dir(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("automation-store"),
        None => PathBuf::from("/tmp").join("automation-store"),
    }
}

impl StoreConfig {
    /// Config for an ephemeral store with the given name and capacity.
    pub fn in_memory(store_name: impl Into<String>, schedule_limit: usize) -> Self {
        Self {
            store_name: store_name.into(),
            schedule_limit,
            in_memory: true,
            ..Self::default()
        }
    }

    /// Config for a durable store rooted at `root_dir`.
    pub fn durable(
        store_name: impl Into<String>,
        schedule_limit: usize,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            schedule_limit,
            in_memory: false,
            root_dir: root_dir.into(),
        }
    }

    /// Path of the SQLite database file for a durable store.
    pub fn database_path(&self) -> PathBuf {
        self.root_dir.join(format!("{}.db", self.store_name))
    }

    /// Reject names that cannot be used as a file name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for an empty name or one containing
    /// characters other than ASCII alphanumerics, `-`, `_` and `.`.
    pub fn validate(&self) -> Result<()> {
        let name = self.store_name.as_str();
        if name.is_empty() {
            return Err(StoreError::Config("store_name must not be empty".to_owned()));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid || name.starts_with('.') {
            return Err(StoreError::Config(format!(
                "store_name `{}` is not a valid file name",
                self.store_name
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/automation-store/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("automation-store")
                .join("config.toml")
        } else if let Some(home) = dirs::home_dir() {
            home.join(".config")
                .join("automation-store")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/automation-store-config/config.toml")
        }
    }
}
