//! Storage paths for engine data.
//!
//! Production code uses `StorageConfig::from_home()`, which points to `~/.ruck/`.
//! Tests use `StorageConfig::with_root(temp_dir)` for isolation.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn from_home() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(Self {
            root: home.join(".ruck"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SQLite file holding the current-session snapshot slot.
    pub fn session_db(&self) -> PathBuf {
        self.root.join("session.db")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("engine.toml")
    }
}
