//! Effective configuration: TOML file, then environment and flag overrides.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::debug;

use stowage_core::{
    StorageLayout, StowageConfig,
    crypto::{EncryptionMethod, EncryptionService},
    index::FileIndex,
};

/// Global configuration flags. Every flag has a `STOWAGE_*` environment twin.
#[derive(ClapArgs, Clone, Default)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, value_name = "FILE", env = "STOWAGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Root for per-account storage
    #[arg(long, value_name = "DIR", env = "STOWAGE_STORAGE_ROOT", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Root for per-organization storage
    #[arg(long, value_name = "DIR", env = "STOWAGE_SHARED_ROOT", global = true)]
    pub shared_root: Option<PathBuf>,

    /// SQLite index database
    #[arg(long, value_name = "FILE", env = "STOWAGE_INDEX_PATH", global = true)]
    pub index_path: Option<PathBuf>,

    /// Encryption method: none or server
    #[arg(long, value_name = "METHOD", env = "STOWAGE_ENCRYPTION_METHOD", global = true)]
    pub encryption_method: Option<EncryptionMethod>,

    /// 32-byte base64url encryption key
    #[arg(long, value_name = "KEY", env = "STOWAGE_ENCRYPTION_KEY", hide_env_values = true, global = true)]
    pub encryption_key: Option<String>,

    /// Identifier recorded with encrypted files
    #[arg(long, value_name = "ID", env = "STOWAGE_ENCRYPTION_KEY_ID", global = true)]
    pub encryption_key_id: Option<String>,

    /// Batch size above which bulk requests are queued
    #[arg(long, value_name = "N", env = "STOWAGE_BULK_ASYNC_THRESHOLD", global = true)]
    pub bulk_async_threshold: Option<usize>,
}

impl ConfigArgs {
    /// Build and validate the effective configuration.
    pub fn load(&self) -> Result<StowageConfig> {
        let mut config = match &self.config {
            Some(path) => read_file(path)?,
            None => StowageConfig::default(),
        };

        if let Some(root) = &self.storage_root {
            config.storage_root.clone_from(root);
        }
        if let Some(root) = &self.shared_root {
            config.shared_root.clone_from(root);
        }
        if let Some(path) = &self.index_path {
            config.index_path.clone_from(path);
        }
        if let Some(method) = self.encryption_method {
            config.encryption.method = method;
        }
        if let Some(key) = &self.encryption_key {
            config.encryption.key = Some(key.clone());
        }
        if let Some(key_id) = &self.encryption_key_id {
            config.encryption.key_id.clone_from(key_id);
        }
        if let Some(threshold) = self.bulk_async_threshold {
            config.bulk.async_threshold = threshold;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Overrides apply after parsing, so the file alone need not be valid.
fn read_file(path: &Path) -> Result<StowageConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    debug!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Opened storage roots and index for one command run.
pub struct Store {
    pub config: StowageConfig,
    pub layout: StorageLayout,
    pub index: Arc<FileIndex>,
}

impl Store {
    pub fn open(config: StowageConfig) -> Result<Self> {
        let encryption = Arc::new(
            EncryptionService::from_config(&config.encryption).context("Invalid encryption settings")?,
        );
        let layout = StorageLayout::from_config(&config, encryption).context("Failed to open storage roots")?;

        if let Some(parent) = config.index_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index directory: {}", parent.display()))?;
        }
        let index = FileIndex::open(&config.index_path)
            .with_context(|| format!("Failed to open index: {}", config.index_path.display()))?;

        Ok(Self {
            config,
            layout,
            index: Arc::new(index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stowage.toml");
        fs::write(&file, "storage_root = \"/from/file\"\nshared_root = \"/shared\"\n").unwrap();

        let args = ConfigArgs {
            config: Some(file),
            storage_root: Some(PathBuf::from("/from/flag")),
            bulk_async_threshold: Some(7),
            ..ConfigArgs::default()
        };
        let config = args.load().unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/from/flag"));
        assert_eq!(config.shared_root, PathBuf::from("/shared"));
        assert_eq!(config.bulk.async_threshold, 7);
    }

    #[test]
    fn key_can_come_from_environment_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stowage.toml");
        fs::write(&file, "[encryption]\nmethod = \"server\"\n").unwrap();

        let without_key = ConfigArgs {
            config: Some(file.clone()),
            ..ConfigArgs::default()
        };
        assert!(without_key.load().is_err());

        let with_key = ConfigArgs {
            config: Some(file),
            encryption_key: Some("A".repeat(43)),
            ..ConfigArgs::default()
        };
        let config = with_key.load().unwrap();
        assert_eq!(config.encryption.method, EncryptionMethod::Server);
    }
}
