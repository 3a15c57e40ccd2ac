//! Encrypting files written before encryption was turned on.
//!
//! Walks the index rather than the disk: only indexed files are migrated.
//! Records that already say `server` are trusted. Files whose on-disk header
//! shows they are encrypted while the record says otherwise get their record
//! corrected. Everything else is plaintext and, in [`EncryptMode::Encrypt`],
//! rewritten through the storage backend.

use std::{io::Read, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    crypto::{EncryptionMethod, is_encrypted},
    index::{FileIndex, FileRecord, IndexError},
    owner::{Owner, OwnerKind},
    storage::{LocalStorage, StorageBackend, StorageContext, StorageError, StorageLayout},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptMode {
    /// Report plaintext files.
    #[default]
    Audit,
    /// Rewrite plaintext files encrypted.
    Encrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncryptRequest {
    pub mode: EncryptMode,
    pub dry_run: bool,
    pub force: bool,
    pub owner_filter: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub owners_scanned: usize,
    pub files_scanned: usize,
    pub already_encrypted: usize,
    pub unencrypted: usize,
    pub encrypted: usize,
    pub errors: usize,
    /// `owner:path` of every plaintext file found.
    pub unencrypted_files: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("encryption is not enabled; set an encryption method and key first")]
    EncryptionDisabled,

    /// **[GUARD]** Encrypt mode rewrites files and needs `force` or `dry_run`.
    #[error("mode 'encrypt' requires force (or dry run for a preview)")]
    ForceRequired,

    #[error("no owner with id {0}")]
    UnknownOwner(Uuid),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
enum FileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Brings plaintext files under the configured encryption key.
#[derive(Debug, Clone)]
pub struct EncryptMigration {
    layout: StorageLayout,
    index: Arc<FileIndex>,
}

impl EncryptMigration {
    pub fn new(layout: StorageLayout, index: Arc<FileIndex>) -> Self {
        Self { layout, index }
    }

    #[instrument(level = "info", skip(self), fields(mode = ?request.mode, dry_run = request.dry_run))]
    pub fn run(&self, request: EncryptRequest) -> Result<MigrationStats, MigrationError> {
        if !self.layout.encryption().is_enabled() {
            return Err(MigrationError::EncryptionDisabled);
        }
        if request.mode == EncryptMode::Encrypt && !request.force && !request.dry_run {
            return Err(MigrationError::ForceRequired);
        }

        let owners = self.select_owners(request.owner_filter)?;
        let mut stats = MigrationStats::default();
        for owner in owners {
            stats.owners_scanned += 1;
            if !self.layout.has_root(&owner) {
                debug!(%owner, "no storage root, nothing to migrate");
                continue;
            }
            let backend = match self.layout.backend(&owner) {
                Ok(backend) => backend,
                Err(e) => {
                    error!(%owner, error = %e, "cannot open owner storage");
                    stats.errors += 1;
                    continue;
                }
            };
            for record in self.index.list_owner(&owner)? {
                if record.is_directory {
                    continue;
                }
                stats.files_scanned += 1;
                if let Err(e) = self.process(&owner, &backend, &record, request, &mut stats) {
                    error!(%owner, path = %record.path, error = %e, "migration failed for file");
                    stats.errors += 1;
                }
            }
        }

        info!(
            owners = stats.owners_scanned,
            scanned = stats.files_scanned,
            encrypted = stats.encrypted,
            errors = stats.errors,
            "encryption migration finished"
        );
        Ok(stats)
    }

    fn select_owners(&self, filter: Option<Uuid>) -> Result<Vec<Owner>, MigrationError> {
        let mut owners = Vec::new();
        for kind in [OwnerKind::Account, OwnerKind::Organization] {
            match filter {
                Some(id) => {
                    let owner = Owner::new(kind, id);
                    if self.index.owner_exists(&owner)? {
                        owners.push(owner);
                    }
                }
                None => owners.extend(self.index.owners(kind)?),
            }
        }
        match filter {
            Some(id) if owners.is_empty() => Err(MigrationError::UnknownOwner(id)),
            _ => Ok(owners),
        }
    }

    fn process(
        &self,
        owner: &Owner,
        backend: &LocalStorage,
        record: &FileRecord,
        request: EncryptRequest,
        stats: &mut MigrationStats,
    ) -> Result<(), FileError> {
        if record.is_encrypted() {
            stats.already_encrypted += 1;
            return Ok(());
        }

        let raw = match read_raw(backend, &record.path) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                warn!(%owner, path = %record.path, "indexed file is missing on disk, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if is_encrypted(&raw) {
            stats.already_encrypted += 1;
            if !request.dry_run {
                self.reconcile(record, &raw)?;
            }
            return Ok(());
        }

        stats.unencrypted += 1;
        stats.unencrypted_files.push(format!("{owner}:{}", record.path));
        if request.mode == EncryptMode::Audit || request.dry_run {
            return Ok(());
        }

        let meta = backend.save(&record.path, &raw)?;
        let encryption = self.layout.encryption();
        self.index.update_storage(
            record.id,
            raw.len() as u64,
            EncryptionMethod::Server,
            encryption.key_id(),
            meta.encrypted_size
                .or(Some(encryption.calculate_encrypted_size(raw.len() as u64))),
        )?;
        debug!(%owner, path = %record.path, "encrypted file in place");
        stats.encrypted += 1;
        Ok(())
    }

    /// The file is encrypted on disk but the record says plaintext.
    fn reconcile(&self, record: &FileRecord, raw: &[u8]) -> Result<(), IndexError> {
        let encryption = self.layout.encryption();
        let on_disk = raw.len() as u64;
        let (size, encrypted_size) = match encryption.decrypt(raw) {
            Ok(plaintext) => (plaintext.len() as u64, Some(on_disk)),
            Err(_) => {
                warn!(path = %record.path, "cannot decrypt file, recording on-disk size");
                (on_disk, None)
            }
        };
        self.index.update_storage(
            record.id,
            size,
            EncryptionMethod::Server,
            encryption.key_id(),
            encrypted_size,
        )
    }
}

fn read_raw(backend: &LocalStorage, path: &str) -> Result<Vec<u8>, StorageError> {
    let mut raw = Vec::new();
    backend
        .open_raw(path)?
        .read_to_end(&mut raw)
        .map_err(|e| StorageError::io(e, StorageContext::new().with_path(path).with_operation("read")))?;
    Ok(raw)
}
