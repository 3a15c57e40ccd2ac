//! Process-level configuration.
//!
//! Configuration is read once at startup, usually from a TOML file with
//! environment overrides applied by the caller. Invalid encryption settings
//! are reported here, before any file operation runs.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{EncryptionMethod, KeyError};

/// Default upper bound on the number of paths in one bulk request.
pub const DEFAULT_MAX_BULK_PATHS: usize = 250;

/// Default batch size above which bulk requests go to a background worker.
pub const DEFAULT_ASYNC_THRESHOLD: usize = 50;

/// Key identifier recorded on files when none is configured.
pub const DEFAULT_KEY_ID: &str = "1";

/// Fatal configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("encryption method is \"server\" but no encryption key is configured")]
    MissingKey,

    #[error("invalid encryption key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// File-content encryption settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub method: EncryptionMethod,
    /// 32-byte key, base64url encoded. Padding is optional.
    pub key: Option<String>,
    pub key_id: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            method: EncryptionMethod::None,
            key: None,
            key_id: DEFAULT_KEY_ID.to_string(),
        }
    }
}

impl EncryptionConfig {
    /// Server-side encryption with the given base64url key.
    pub fn server(key: impl Into<String>) -> Self {
        Self {
            method: EncryptionMethod::Server,
            key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }
}

/// Limits for the bulk operation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub max_paths: usize,
    pub async_threshold: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_paths: DEFAULT_MAX_BULK_PATHS,
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    /// Private storage, one directory per account.
    pub storage_root: PathBuf,
    /// Shared storage, one directory per organization.
    pub shared_root: PathBuf,
    /// SQLite database holding the metadata index.
    pub index_path: PathBuf,
    pub encryption: EncryptionConfig,
    pub bulk: BulkConfig,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data/storage"),
            shared_root: PathBuf::from("data/shared"),
            index_path: PathBuf::from("data/index.sqlite3"),
            encryption: EncryptionConfig::default(),
            bulk: BulkConfig::default(),
        }
    }
}

impl StowageConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check limits and encryption settings.
    ///
    /// Key material is decoded here so a bad key aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bulk.max_paths == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bulk.max_paths",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.encryption.key_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "encryption.key_id",
                reason: "must not be empty".to_string(),
            });
        }
        crate::crypto::EncryptionService::from_config(&self.encryption).map(|_| ())
    }

    #[must_use]
    pub fn storage_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_root = path.into();
        self
    }

    #[must_use]
    pub fn shared_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_root = path.into();
        self
    }

    #[must_use]
    pub fn index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = path.into();
        self
    }

    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    #[must_use]
    pub fn async_threshold(mut self, threshold: usize) -> Self {
        self.bulk.async_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StorageKey;

    #[test]
    fn defaults_are_plaintext() {
        let config = StowageConfig::default();
        assert_eq!(config.encryption.method, EncryptionMethod::None);
        assert_eq!(config.encryption.key_id, "1");
        assert_eq!(config.bulk.max_paths, 250);
        assert_eq!(config.bulk.async_threshold, 50);
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let key = StorageKey::generate().to_base64();
        let toml = format!(
            r#"
            storage_root = "/srv/files"

            [encryption]
            method = "server"
            key = "{}"
            "#,
            key.as_str()
        );
        let config = StowageConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/files"));
        assert_eq!(config.shared_root, PathBuf::from("data/shared"));
        assert_eq!(config.encryption.method, EncryptionMethod::Server);
        assert_eq!(config.encryption.key_id, "1");
    }

    #[test]
    fn server_without_key_is_fatal() {
        let err = StowageConfig::from_toml_str("[encryption]\nmethod = \"server\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey));
    }

    #[test]
    fn short_key_is_fatal() {
        let config = StowageConfig::default().encryption(EncryptionConfig::server("AAAA"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidKey(KeyError::InvalidLength { actual: 3 }))
        ));
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(StowageConfig::from_toml_str("[encryption]\nmethod = \"kms\"\n").is_err());
    }

    #[test]
    fn builder_setters() {
        let config = StowageConfig::default()
            .storage_root("/a")
            .shared_root("/b")
            .index_path("/c.db")
            .async_threshold(5);
        assert_eq!(config.storage_root, PathBuf::from("/a"));
        assert_eq!(config.shared_root, PathBuf::from("/b"));
        assert_eq!(config.index_path, PathBuf::from("/c.db"));
        assert_eq!(config.bulk.async_threshold, 5);
    }
}
