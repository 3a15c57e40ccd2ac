//! Filesystem/index reconciliation.
//!
//! The filesystem is authoritative. [`IndexSync`] walks each owner's storage
//! root, diffs it against the owner's index records and, depending on the
//! [`SyncMode`], creates, refreshes or deletes records. Each owner's changes
//! are planned first and committed in a single transaction.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    io::Read,
    str::FromStr,
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    crypto::EncryptionMethod,
    index::{FileIndex, FileRecord, IndexBatch, IndexError, NewRecord},
    owner::{Owner, OwnerKind},
    storage::{FileMeta, LocalStorage, StorageBackend, StorageContext, StorageError, StorageLayout},
};

/// What a sync run is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Report discrepancies only.
    Audit,
    /// Create or refresh records for entries on disk.
    Sync,
    /// Delete records whose entry is gone from disk.
    Clean,
    /// `Sync` then `Clean`.
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Audit => "audit",
            SyncMode::Sync => "sync",
            SyncMode::Clean => "clean",
            SyncMode::Full => "full",
        }
    }

    /// Modes that delete records and therefore need `force`.
    pub fn is_destructive(self) -> bool {
        matches!(self, SyncMode::Clean | SyncMode::Full)
    }

    fn adds(self) -> bool {
        matches!(self, SyncMode::Sync | SyncMode::Full)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audit" => Ok(SyncMode::Audit),
            "sync" => Ok(SyncMode::Sync),
            "clean" => Ok(SyncMode::Clean),
            "full" => Ok(SyncMode::Full),
            other => Err(SyncError::InvalidMode(other.to_string())),
        }
    }
}

/// Which owner classes a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncScope {
    Accounts,
    Organizations,
    #[default]
    All,
}

impl SyncScope {
    fn kinds(self) -> &'static [OwnerKind] {
        match self {
            SyncScope::Accounts => &[OwnerKind::Account],
            SyncScope::Organizations => &[OwnerKind::Organization],
            SyncScope::All => &[OwnerKind::Account, OwnerKind::Organization],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub dry_run: bool,
    pub force: bool,
    /// Restrict the run to the owner with this id.
    pub owner_filter: Option<Uuid>,
    pub scope: SyncScope,
}

impl SyncRequest {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            dry_run: false,
            force: false,
            owner_filter: None,
            scope: SyncScope::All,
        }
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn owner(mut self, id: Uuid) -> Self {
        self.owner_filter = Some(id);
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Counters for a sync run. Dry runs report what a real run would do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub owners_scanned: usize,
    pub files_on_disk: usize,
    pub files_in_index: usize,
    pub missing_in_index: usize,
    pub orphaned_in_index: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub records_skipped: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncStats {
    fn absorb(&mut self, other: SyncStats) {
        self.files_on_disk += other.files_on_disk;
        self.files_in_index += other.files_in_index;
        self.missing_in_index += other.missing_in_index;
        self.orphaned_in_index += other.orphaned_in_index;
        self.records_created += other.records_created;
        self.records_updated += other.records_updated;
        self.records_deleted += other.records_deleted;
        self.records_skipped += other.records_skipped;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync mode {0:?} (expected audit, sync, clean or full)")]
    InvalidMode(String),

    /// **[GUARD]** A destructive mode was requested without `force`.
    #[error("mode '{mode}' deletes index records and requires force")]
    ForceRequired { mode: SyncMode },

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Failure while reconciling a single owner; reported, never propagated.
#[derive(Debug, Error)]
enum OwnerSyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Reconciles storage roots with the metadata index.
#[derive(Debug, Clone)]
pub struct IndexSync {
    layout: StorageLayout,
    index: Arc<FileIndex>,
}

impl IndexSync {
    pub fn new(layout: StorageLayout, index: Arc<FileIndex>) -> Self {
        Self { layout, index }
    }

    /// Run one reconciliation pass.
    ///
    /// Fails up front with [`SyncError::ForceRequired`] before touching any
    /// owner. Per-owner failures are collected into [`SyncStats::errors`].
    #[instrument(level = "info", skip(self), fields(mode = %request.mode, dry_run = request.dry_run))]
    pub fn run(&self, request: SyncRequest) -> Result<SyncStats, SyncError> {
        if request.mode.is_destructive() && !request.force {
            return Err(SyncError::ForceRequired { mode: request.mode });
        }

        let owners = self.select_owners(&request)?;
        let mut stats = SyncStats {
            owners_scanned: owners.len(),
            ..SyncStats::default()
        };

        for owner in owners {
            match self.sync_owner(&owner, request.mode, request.dry_run) {
                Ok(owner_stats) => stats.absorb(owner_stats),
                Err(e) => {
                    warn!(%owner, error = %e, "owner sync failed");
                    stats.errors.push(format!("{owner}: {e}"));
                }
            }
        }

        info!(
            owners = stats.owners_scanned,
            created = stats.records_created,
            updated = stats.records_updated,
            deleted = stats.records_deleted,
            skipped = stats.records_skipped,
            errors = stats.errors.len(),
            "index sync finished"
        );
        Ok(stats)
    }

    fn select_owners(&self, request: &SyncRequest) -> Result<Vec<Owner>, IndexError> {
        let mut owners = Vec::new();
        for &kind in request.scope.kinds() {
            match request.owner_filter {
                Some(id) => {
                    let owner = Owner::new(kind, id);
                    if self.index.owner_exists(&owner)? {
                        owners.push(owner);
                    }
                }
                None => owners.extend(self.index.owners(kind)?),
            }
        }
        Ok(owners)
    }

    /// Entries on disk keyed by path. A missing owner root is empty.
    fn scan(&self, owner: &Owner) -> Result<Option<(LocalStorage, BTreeMap<String, FileMeta>)>, StorageError> {
        if !self.layout.has_root(owner) {
            debug!(%owner, "no storage root yet");
            return Ok(None);
        }
        let backend = self.layout.backend(owner)?;
        let entries = backend
            .walk("")?
            .into_iter()
            .map(|meta| (meta.path.as_str().to_string(), meta))
            .collect();
        Ok(Some((backend, entries)))
    }

    #[instrument(level = "debug", skip(self), fields(%owner))]
    fn sync_owner(&self, owner: &Owner, mode: SyncMode, dry_run: bool) -> Result<SyncStats, OwnerSyncError> {
        let mut stats = SyncStats::default();

        let (backend, on_disk) = match self.scan(owner)? {
            Some((backend, entries)) => (Some(backend), entries),
            None => (None, BTreeMap::new()),
        };
        let records: HashMap<String, FileRecord> = self
            .index
            .list_owner(owner)?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        stats.files_on_disk = on_disk.len();
        stats.files_in_index = records.len();
        stats.missing_in_index = on_disk.keys().filter(|p| !records.contains_key(*p)).count();
        let mut orphaned: Vec<&FileRecord> = records
            .values()
            .filter(|r| !on_disk.contains_key(&r.path))
            .collect();
        orphaned.sort_by(|a, b| a.path.cmp(&b.path));
        stats.orphaned_in_index = orphaned.len();

        let mut batch = IndexBatch::default();

        if mode.adds()
            && let Some(backend) = &backend
        {
            for (path, meta) in &on_disk {
                match records.get(path) {
                    None => {
                        stats.records_created += 1;
                        if !dry_run {
                            batch.creates.push(self.resolve(backend, meta, &mut stats.warnings));
                        }
                    }
                    Some(record) if is_stale(record, meta) => {
                        debug!(%path, "index record is stale");
                        stats.records_updated += 1;
                        if !dry_run {
                            let mut fresh = self.resolve(backend, meta, &mut stats.warnings);
                            fresh.sort_position = None;
                            batch.updates.push((record.id, fresh));
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        if mode.is_destructive() {
            for record in orphaned {
                let active: Vec<_> = self
                    .index
                    .dependents(record.id)?
                    .into_iter()
                    .filter(|d| d.is_active())
                    .collect();
                if let Some(first) = active.first() {
                    warn!(
                        path = %record.path,
                        active = active.len(),
                        kind = first.kind(),
                        "orphaned record has active dependents, skipping"
                    );
                    stats.records_skipped += 1;
                    continue;
                }
                stats.records_deleted += 1;
                if !dry_run {
                    batch.deletes.push(record.id);
                }
            }
        }

        if !dry_run {
            self.index.apply(owner, &batch)?;
        }
        Ok(stats)
    }

    /// Build a record from disk truth, confirming encryption by decrypting.
    ///
    /// With encryption off the backend reports every file as plaintext, so a
    /// header-bearing file is recorded at its raw size with no method.
    fn resolve(&self, backend: &impl StorageBackend, meta: &FileMeta, warnings: &mut Vec<String>) -> NewRecord {
        let mut record = NewRecord::from_meta(meta);
        if meta.is_directory || meta.encryption_method == EncryptionMethod::None {
            return record;
        }

        let path = meta.path.as_str();
        let mut raw = Vec::new();
        let read = backend.open_raw(path).and_then(|mut f| {
            f.read_to_end(&mut raw)
                .map_err(|e| StorageError::io(e, StorageContext::new().with_path(path)))
        });
        if let Err(e) = read {
            warn!(%path, error = %e, "cannot read file for encryption detection");
            warnings.push(format!("{path}: cannot read file for encryption detection"));
            return record;
        }

        let on_disk = raw.len() as u64;
        let encryption = self.layout.encryption();
        match encryption.decrypt(&raw) {
            Ok(plaintext) => {
                record.size = plaintext.len() as u64;
                record.encrypted_size = Some(on_disk);
                record.key_id = encryption.key_id().map(str::to_owned);
            }
            Err(_) => {
                warn!(%path, "cannot decrypt file for size detection");
                warnings.push(format!("{path}: cannot decrypt for size detection"));
                record.size = on_disk;
                record.encrypted_size = None;
            }
        }
        record
    }
}

/// Disk and index disagree on a field the index mirrors.
///
/// A file that could not be decrypted is recorded at its on-disk size, which
/// still counts as current.
fn is_stale(record: &FileRecord, meta: &FileMeta) -> bool {
    let size_current = record.size == meta.size
        || (record.encrypted_size.is_none() && Some(record.size) == meta.encrypted_size);
    !size_current
        || record.is_directory != meta.is_directory
        || record.content_type != meta.content_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("full".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert!(matches!(
            "nuke".parse::<SyncMode>(),
            Err(SyncError::InvalidMode(m)) if m == "nuke"
        ));
    }

    #[test]
    fn destructive_modes() {
        assert!(!SyncMode::Audit.is_destructive());
        assert!(!SyncMode::Sync.is_destructive());
        assert!(SyncMode::Clean.is_destructive());
        assert!(SyncMode::Full.is_destructive());
    }

    #[test]
    fn absorb_sums_counters() {
        let mut total = SyncStats::default();
        total.absorb(SyncStats {
            files_on_disk: 2,
            records_created: 1,
            warnings: vec!["w".into()],
            ..SyncStats::default()
        });
        total.absorb(SyncStats {
            files_on_disk: 3,
            errors: vec!["e".into()],
            ..SyncStats::default()
        });
        assert_eq!(total.files_on_disk, 5);
        assert_eq!(total.records_created, 1);
        assert_eq!(total.warnings, ["w"]);
        assert_eq!(total.errors, ["e"]);
    }
}
