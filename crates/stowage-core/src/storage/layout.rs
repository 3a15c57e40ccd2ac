use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::debug;

use super::{LocalStorage, StorageContext, StorageError};
use crate::{config::StowageConfig, crypto::EncryptionService, owner::Owner};

/// Maps owners onto their storage roots.
///
/// Accounts live under `storage_root/<account-id>`, organizations under
/// `shared_root/<org-id>`. Both roots share one [`EncryptionService`].
#[derive(Debug, Clone)]
pub struct StorageLayout {
    storage_root: PathBuf,
    shared_root: PathBuf,
    encryption: Arc<EncryptionService>,
}

impl StorageLayout {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        shared_root: impl Into<PathBuf>,
        encryption: Arc<EncryptionService>,
    ) -> Result<Self, StorageError> {
        let storage_root = storage_root.into();
        let shared_root = shared_root.into();
        for root in [&storage_root, &shared_root] {
            fs::create_dir_all(root)
                .map_err(|e| StorageError::io(e, StorageContext::new().with_root(root)))?;
        }
        Ok(Self {
            storage_root,
            shared_root,
            encryption,
        })
    }

    pub fn from_config(config: &StowageConfig, encryption: Arc<EncryptionService>) -> Result<Self, StorageError> {
        Self::new(&config.storage_root, &config.shared_root, encryption)
    }

    pub fn encryption(&self) -> &Arc<EncryptionService> {
        &self.encryption
    }

    /// Directory holding `owner`'s files. It may not exist yet.
    pub fn owner_root(&self, owner: &Owner) -> PathBuf {
        let base: &Path = match owner {
            Owner::Account(_) => &self.storage_root,
            Owner::Organization(_) => &self.shared_root,
        };
        base.join(owner.id().to_string())
    }

    pub fn has_root(&self, owner: &Owner) -> bool {
        self.owner_root(owner).is_dir()
    }

    /// A backend confined to `owner`'s root, creating the root on first use.
    pub fn backend(&self, owner: &Owner) -> Result<LocalStorage, StorageError> {
        let root = self.owner_root(owner);
        debug!(%owner, root = %root.display(), "opening owner storage");
        LocalStorage::new(root, Arc::clone(&self.encryption))
    }
}
