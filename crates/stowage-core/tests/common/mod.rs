#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc};

use assert_fs::TempDir;
use stowage_core::{
    StorageBackend,
    bulk::BulkOperationService,
    crypto::{EncryptionService, StorageKey},
    index::FileIndex,
    migrate::EncryptMigration,
    owner::Owner,
    storage::{LocalStorage, StorageLayout},
    sync::IndexSync,
};
use uuid::Uuid;

pub const TEST_KEY_ID: &str = "test-key";

/// Deterministic key for tests.
pub fn test_key() -> StorageKey {
    StorageKey::from_bytes([0x5a; 32])
}

pub fn encryption_on() -> Arc<EncryptionService> {
    Arc::new(EncryptionService::with_key(test_key(), TEST_KEY_ID))
}

pub fn encryption_off() -> Arc<EncryptionService> {
    Arc::new(EncryptionService::disabled())
}

/// A scratch deployment: two storage roots, an in-memory index and one
/// registered account.
pub struct Fixture {
    pub temp: TempDir,
    pub layout: StorageLayout,
    pub index: Arc<FileIndex>,
    pub owner: Owner,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_encryption(encryption_off())
    }

    pub fn encrypted() -> Self {
        Self::with_encryption(encryption_on())
    }

    pub fn with_encryption(encryption: Arc<EncryptionService>) -> Self {
        Self::build(encryption, |_| FileIndex::open_in_memory().unwrap())
    }

    /// Index stored in `index.sqlite3` under the temp dir, so a second
    /// connection can reach it.
    pub fn with_index_file() -> Self {
        Self::build(encryption_off(), |temp| FileIndex::open(&temp.path().join("index.sqlite3")).unwrap())
    }

    pub fn index_path(&self) -> PathBuf {
        self.temp.path().join("index.sqlite3")
    }

    fn build(encryption: Arc<EncryptionService>, open_index: impl FnOnce(&TempDir) -> FileIndex) -> Self {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().join("storage"), temp.path().join("shared"), encryption).unwrap();
        let index = Arc::new(open_index(&temp));
        let owner = Owner::Account(Uuid::new_v4());
        index.register_owner(&owner, 0).unwrap();
        // Create the owner root up front so tests can plant entries in it.
        layout.backend(&owner).unwrap();
        Self {
            temp,
            layout,
            index,
            owner,
        }
    }

    /// Same directories and index, different encryption settings.
    pub fn reopen(&self, encryption: Arc<EncryptionService>) -> StorageLayout {
        StorageLayout::new(
            self.temp.path().join("storage"),
            self.temp.path().join("shared"),
            encryption,
        )
        .unwrap()
    }

    pub fn backend(&self) -> LocalStorage {
        self.layout.backend(&self.owner).unwrap()
    }

    pub fn owner_root(&self) -> PathBuf {
        self.layout.owner_root(&self.owner)
    }

    /// Write a file through the backend, creating parent directories.
    pub fn put(&self, path: &str, content: &[u8]) {
        let backend = self.backend();
        if let Some((parent, _)) = path.rsplit_once('/') {
            backend.mkdir(parent).unwrap();
        }
        backend.save(path, content).unwrap();
    }

    pub fn sync(&self) -> IndexSync {
        IndexSync::new(self.layout.clone(), Arc::clone(&self.index))
    }

    pub fn migration(&self, layout: StorageLayout) -> EncryptMigration {
        EncryptMigration::new(layout, Arc::clone(&self.index))
    }

    pub fn bulk(&self) -> BulkOperationService {
        BulkOperationService::new(Arc::new(self.backend()), Arc::clone(&self.index), self.owner)
    }
}

pub fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
