use crate::error::{Result, SealDbError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// When mutations reach disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Every mutation rewrites the encrypted file before returning.
    #[default]
    Immediate,
    /// Mutations only mark the store dirty; `Store::flush` writes the file.
    /// Opt-in: a crash loses everything since the last flush.
    Deferred,
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Durability::Immediate => write!(f, "immediate"),
            Durability::Deferred => write!(f, "deferred"),
        }
    }
}

/// Configuration for opening a store.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Path of the encrypted database file.
    pub path: PathBuf,
    /// Secret the file key is derived from.
    #[serde(alias = "secretKey")]
    pub secret_key: String,
    #[serde(default)]
    pub durability: Durability,
    /// Start empty (with a warning) instead of failing when the file cannot be decrypted or parsed.
    #[serde(default, alias = "resetOnCorrupt")]
    pub reset_on_corrupt: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, secret_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            secret_key: secret_key.into(),
            durability: Durability::Immediate,
            reset_on_corrupt: false,
        }
    }

    /// Load a configuration file. JSON is accepted as well as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    #[must_use]
    pub fn reset_on_corrupt(mut self, value: bool) -> Self {
        self.reset_on_corrupt = value;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(SealDbError::Config("Database path is required".into()));
        }
        if self.secret_key.is_empty() {
            return Err(SealDbError::Config("Secret key is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("path", &self.path)
            .field("secret_key", &"[REDACTED]")
            .field("durability", &self.durability)
            .field("reset_on_corrupt", &self.reset_on_corrupt)
            .finish()
    }
}
