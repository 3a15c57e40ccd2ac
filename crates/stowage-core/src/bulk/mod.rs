//! Batched delete, move and copy with per-item results.
//!
//! A batch never aborts on a single bad path: every input path gets one
//! [`BulkItemResult`] and the batch reports how many succeeded. Only request
//! validation and index outages fail the whole call.

mod queue;

use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::BulkConfig,
    effects::Effect,
    index::{FileIndex, FileRecord, IndexBatch, IndexError, NewRecord},
    owner::Owner,
    path::{VirtualPath, normalize},
    storage::{FileMeta, StorageBackend, StorageError},
};

pub use queue::{BulkJob, QueueError, TaskQueue, TaskStatus, ThreadTaskQueue};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    Delete,
    Move,
    Copy,
}

impl BulkOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkOperation::Delete => "delete",
            BulkOperation::Move => "move",
            BulkOperation::Copy => "copy",
        }
    }

    fn needs_destination(self) -> bool {
        matches!(self, BulkOperation::Move | BulkOperation::Copy)
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkOperation {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(BulkOperation::Delete),
            "move" => Ok(BulkOperation::Move),
            "copy" => Ok(BulkOperation::Copy),
            other => Err(BulkError::InvalidOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Target directory for move and copy.
    pub destination: Option<String>,
    /// Run inline even above the async threshold.
    pub force_sync: bool,
}

impl BulkOptions {
    #[must_use]
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }
}

/// Request-level failures. Per-path problems are reported in [`BulkItemResult`].
#[derive(Debug, Error)]
pub enum BulkError {
    #[error("Invalid operation: {0}. Allowed: delete, move, copy")]
    InvalidOperation(String),

    #[error("Paths array cannot be empty")]
    EmptyPaths,

    #[error("Maximum {max} paths per request (received {received})")]
    TooManyPaths { max: usize, received: usize },

    #[error("Destination is required for {operation} operation")]
    DestinationRequired { operation: BulkOperation },

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Stable machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkErrorCode {
    InvalidPath,
    NotFound,
    DestinationNotFound,
    AlreadyExists,
    QuotaExceeded,
    SymlinkAttack,
    DeleteFailed,
    MoveFailed,
    CopyFailed,
}

impl BulkErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkErrorCode::InvalidPath => "INVALID_PATH",
            BulkErrorCode::NotFound => "NOT_FOUND",
            BulkErrorCode::DestinationNotFound => "DESTINATION_NOT_FOUND",
            BulkErrorCode::AlreadyExists => "ALREADY_EXISTS",
            BulkErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            BulkErrorCode::SymlinkAttack => "SYMLINK_ATTACK",
            BulkErrorCode::DeleteFailed => "DELETE_FAILED",
            BulkErrorCode::MoveFailed => "MOVE_FAILED",
            BulkErrorCode::CopyFailed => "COPY_FAILED",
        }
    }
}

impl fmt::Display for BulkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemError {
    pub code: BulkErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemResult {
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkItemError>,
    /// Where the entry ended up, for move and copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
}

impl BulkItemResult {
    fn ok(path: &str, new_path: Option<String>) -> Self {
        Self {
            path: path.to_string(),
            success: true,
            error: None,
            new_path,
        }
    }

    fn fail(path: &str, code: BulkErrorCode, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            success: false,
            error: Some(BulkItemError {
                code,
                message: message.into(),
            }),
            new_path: None,
        }
    }

    pub fn code(&self) -> Option<BulkErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkStats {
    pub operation: BulkOperation,
    /// Number of distinct paths processed.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkItemResult>,
    /// To be dispatched by the caller once the batch is done.
    pub effects: Vec<Effect>,
}

impl BulkStats {
    pub fn new(operation: BulkOperation) -> Self {
        Self {
            operation,
            total: 0,
            succeeded: 0,
            failed: 0,
            results: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn push(&mut self, result: BulkItemResult) {
        self.total += 1;
        if result.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    /// Turn an earlier success into a failure.
    fn mark_failed(&mut self, slot: usize, code: BulkErrorCode, message: String) {
        let Some(result) = self.results.get_mut(slot) else {
            return;
        };
        if result.success {
            self.succeeded -= 1;
            self.failed += 1;
        }
        *result = BulkItemResult::fail(&result.path, code, message);
    }
}

/// How a batch was executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BulkOutcome {
    /// Ran inline below the async threshold, or with `force_sync`.
    Completed(BulkStats),
    /// Above the threshold but no queue was available, so it ran inline.
    Immediate(BulkStats),
    /// Handed to the task queue.
    Queued { task_id: Uuid, total: usize },
}

impl BulkOutcome {
    pub fn stats(&self) -> Option<&BulkStats> {
        match self {
            BulkOutcome::Completed(stats) | BulkOutcome::Immediate(stats) => Some(stats),
            BulkOutcome::Queued { .. } => None,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, BulkOutcome::Queued { .. })
    }
}

/// Order-preserving dedup; the first occurrence wins.
fn dedup_paths(paths: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(paths.len());
    paths
        .iter()
        .filter(|p| seen.insert(p.as_str()))
        .cloned()
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / MIB
}

/// Delete, move and copy for one owner's files.
#[derive(Clone)]
pub struct BulkOperationService {
    backend: Arc<dyn StorageBackend>,
    index: Arc<FileIndex>,
    owner: Owner,
    config: BulkConfig,
    queue: Option<Arc<dyn TaskQueue>>,
}

impl fmt::Debug for BulkOperationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOperationService")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl BulkOperationService {
    pub fn new(backend: Arc<dyn StorageBackend>, index: Arc<FileIndex>, owner: Owner) -> Self {
        Self {
            backend,
            index,
            owner,
            config: BulkConfig::default(),
            queue: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: BulkConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Validate, deduplicate and run a batch.
    ///
    /// Batches larger than the async threshold go to the task queue unless
    /// `force_sync` is set. Without a queue they run inline and come back as
    /// [`BulkOutcome::Immediate`].
    #[instrument(level = "info", skip(self, paths, options), fields(owner = %self.owner, %operation, requested = paths.len()))]
    pub fn execute(
        &self,
        operation: BulkOperation,
        paths: &[String],
        options: &BulkOptions,
    ) -> Result<BulkOutcome, BulkError> {
        if paths.is_empty() {
            return Err(BulkError::EmptyPaths);
        }
        if paths.len() > self.config.max_paths {
            return Err(BulkError::TooManyPaths {
                max: self.config.max_paths,
                received: paths.len(),
            });
        }
        let destination = match options.destination.as_deref() {
            Some(d) if operation.needs_destination() => Some(d.to_string()),
            None if operation.needs_destination() => {
                return Err(BulkError::DestinationRequired { operation });
            }
            _ => None,
        };

        let paths = dedup_paths(paths);
        if paths.len() > self.config.async_threshold && !options.force_sync {
            if let Some(queue) = &self.queue {
                let total = paths.len();
                match queue.submit(self.job(operation, paths.clone(), destination.clone())) {
                    Ok(task_id) => {
                        info!(%task_id, total, "bulk batch queued");
                        return Ok(BulkOutcome::Queued { task_id, total });
                    }
                    Err(e) => warn!(error = %e, "task queue rejected batch, running inline"),
                }
            }
            debug!(total = paths.len(), "no background worker, running inline");
            return self
                .run(operation, &paths, destination.as_deref())
                .map(BulkOutcome::Immediate);
        }

        self.run(operation, &paths, destination.as_deref())
            .map(BulkOutcome::Completed)
    }

    fn job(&self, operation: BulkOperation, paths: Vec<String>, destination: Option<String>) -> BulkJob {
        let service = self.clone();
        Box::new(move || {
            service
                .run(operation, &paths, destination.as_deref())
                .unwrap_or_else(|e| {
                    error!(error = %e, "background bulk batch failed");
                    let mut stats = BulkStats::new(operation);
                    for path in &paths {
                        stats.push(BulkItemResult::fail(path, failure_code(operation), e.to_string()));
                    }
                    stats
                })
        })
    }

    /// Process already-validated, deduplicated paths.
    fn run(
        &self,
        operation: BulkOperation,
        paths: &[String],
        destination: Option<&str>,
    ) -> Result<BulkStats, BulkError> {
        let mut stats = match (operation, destination) {
            (BulkOperation::Delete, _) => self.delete_batch(paths)?,
            (BulkOperation::Move, Some(dest)) => self.per_item(operation, paths, dest, Self::move_one),
            (BulkOperation::Copy, Some(dest)) => self.per_item(operation, paths, dest, Self::copy_one),
            (_, None) => return Err(BulkError::DestinationRequired { operation }),
        };
        stats.operation = operation;
        info!(
            total = stats.total,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "bulk batch finished"
        );
        Ok(stats)
    }

    fn per_item(
        &self,
        operation: BulkOperation,
        paths: &[String],
        destination: &str,
        op: fn(&Self, &str, &VirtualPath, &mut Vec<Effect>) -> BulkItemResult,
    ) -> BulkStats {
        let mut stats = BulkStats::new(operation);
        let dest = match self.resolve_destination(destination) {
            Ok(dest) => dest,
            Err((code, message)) => {
                for path in paths {
                    stats.push(BulkItemResult::fail(path, code, message.clone()));
                }
                return stats;
            }
        };
        for path in paths {
            let result = op(self, path, &dest, &mut stats.effects);
            stats.push(result);
        }
        stats
    }

    fn resolve_destination(&self, destination: &str) -> Result<VirtualPath, (BulkErrorCode, String)> {
        let dest = normalize(destination).map_err(|e| {
            (BulkErrorCode::InvalidPath, format!("Invalid destination: {e}"))
        })?;
        match self.backend.info(dest.as_str()) {
            Ok(meta) if meta.is_directory => Ok(dest),
            Err(StorageError::SymlinkAttack { .. }) => Err((
                BulkErrorCode::SymlinkAttack,
                format!("Symlink refused at destination: {destination}"),
            )),
            _ => Err((
                BulkErrorCode::DestinationNotFound,
                format!("Destination directory not found: {destination}"),
            )),
        }
    }

    // ---------------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------------

    /// One index snapshot, per-path filesystem deletes, one index delete.
    ///
    /// Descendant ids are read before anything on disk changes. If the final
    /// index delete fails, every item whose records it covered is reported as
    /// failed and the batch still returns its stats.
    fn delete_batch(&self, paths: &[String]) -> Result<BulkStats, BulkError> {
        let mut stats = BulkStats::new(BulkOperation::Delete);

        let parsed: Vec<(&String, Result<VirtualPath, String>)> = paths
            .iter()
            .map(|raw| (raw, normalize(raw).map_err(|e| e.to_string())))
            .collect();
        let valid: Vec<VirtualPath> = parsed
            .iter()
            .filter_map(|(_, p)| p.as_ref().ok().cloned())
            .collect();
        let records = self.index.get_many(&self.owner, &valid)?;
        let subtrees = self.index.subtree_ids(&self.owner, &valid)?;

        // (position in `stats.results`, record ids that item removes)
        let mut doomed: Vec<(usize, Vec<i64>)> = Vec::new();
        for (raw, parsed) in parsed {
            let path = match parsed {
                Ok(path) => path,
                Err(reason) => {
                    stats.push(BulkItemResult::fail(raw, BulkErrorCode::InvalidPath, reason));
                    continue;
                }
            };
            let record = records.get(path.as_str());

            let result = match self.delete_from_disk(&path, record) {
                Ok(was_directory) => {
                    let ids = match (record, was_directory) {
                        (_, true) => subtrees.get(path.as_str()).cloned().unwrap_or_default(),
                        (Some(record), false) => vec![record.id],
                        (None, false) => Vec::new(),
                    };
                    if !ids.is_empty() {
                        doomed.push((stats.results.len(), ids));
                    }
                    stats.effects.push(Effect::FileDeleted {
                        owner: self.owner,
                        path: path.as_str().to_string(),
                    });
                    BulkItemResult::ok(raw, None)
                }
                Err(failure) => failure.into_result(raw),
            };
            stats.push(result);
        }

        let mut ids: Vec<i64> = doomed.iter().flat_map(|(_, ids)| ids.iter().copied()).collect();
        ids.sort_unstable();
        ids.dedup();
        if let Err(e) = self.index.delete_ids(&ids) {
            warn!(owner = %self.owner, records = ids.len(), error = %e, "index delete failed after files were removed");
            let message = format!("Removed from disk but the index update failed: {e}");
            for (slot, _) in &doomed {
                stats.mark_failed(*slot, BulkErrorCode::DeleteFailed, message.clone());
            }
        }
        Ok(stats)
    }

    /// Remove `path` from disk. Returns whether it was a directory.
    fn delete_from_disk(&self, path: &VirtualPath, record: Option<&FileRecord>) -> Result<bool, ItemFailure> {
        let meta = match self.backend.info(path.as_str()) {
            Ok(meta) => meta,
            // Already gone from disk: dropping the record is all that is left
            Err(e) if e.is_not_found() => {
                return match record {
                    Some(record) => Ok(record.is_directory),
                    None => Err(ItemFailure::new(
                        BulkErrorCode::NotFound,
                        format!("File not found: {path}"),
                    )),
                };
            }
            Err(e) => return Err(ItemFailure::storage(e, BulkErrorCode::DeleteFailed)),
        };

        let removed = if meta.is_directory {
            self.backend.remove_tree(path.as_str()).map(|_| ())
        } else {
            self.backend.delete(path.as_str())
        };
        match removed {
            Ok(()) => Ok(meta.is_directory),
            Err(e) if e.is_not_found() => Ok(meta.is_directory),
            Err(e) => Err(ItemFailure::storage(e, BulkErrorCode::DeleteFailed)),
        }
    }

    // ---------------------------------------------------------------------
    // Move
    // ---------------------------------------------------------------------

    fn move_one(&self, raw: &str, dest: &VirtualPath, effects: &mut Vec<Effect>) -> BulkItemResult {
        let (path, _record) = match self.lookup(raw, BulkErrorCode::MoveFailed) {
            Ok(found) => found,
            Err(failure) => return failure.into_result(raw),
        };

        let moved = match self.backend.move_to(path.as_str(), dest.as_str()) {
            Ok(meta) => meta,
            Err(e) => return ItemFailure::storage(e, BulkErrorCode::MoveFailed).into_result(raw),
        };

        if let Err(e) = self.index.rename_subtree(&self.owner, &path, &moved.path) {
            error!(from = %path, to = %moved.path, error = %e, "moved on disk but index update failed");
            return BulkItemResult::fail(raw, BulkErrorCode::MoveFailed, format!("Index update failed: {e}"));
        }

        effects.push(Effect::FileMoved {
            owner: self.owner,
            from: path.as_str().to_string(),
            to: moved.path.as_str().to_string(),
        });
        BulkItemResult::ok(raw, Some(moved.path.as_str().to_string()))
    }

    // ---------------------------------------------------------------------
    // Copy
    // ---------------------------------------------------------------------

    fn copy_one(&self, raw: &str, dest: &VirtualPath, effects: &mut Vec<Effect>) -> BulkItemResult {
        let (path, record) = match self.lookup(raw, BulkErrorCode::CopyFailed) {
            Ok(found) => found,
            Err(failure) => return failure.into_result(raw),
        };
        if let Err(failure) = self.check_quota(&path, &record) {
            return failure.into_result(raw);
        }

        let copied = match self.backend.copy(path.as_str(), dest.as_str(), None) {
            Ok(meta) => meta,
            Err(e) => return ItemFailure::storage(e, BulkErrorCode::CopyFailed).into_result(raw),
        };

        let batch = match self.copy_records(&record, &copied) {
            Ok(batch) => batch,
            Err(e) => {
                error!(path = %copied.path, error = %e, "cannot scan copied tree");
                return BulkItemResult::fail(raw, BulkErrorCode::CopyFailed, format!("Filesystem error: {e}"));
            }
        };
        if let Err(e) = self.index.apply(&self.owner, &batch) {
            error!(path = %copied.path, error = %e, "copied on disk but index update failed");
            return BulkItemResult::fail(raw, BulkErrorCode::CopyFailed, format!("Index update failed: {e}"));
        }

        effects.push(Effect::FileCopied {
            owner: self.owner,
            from: path.as_str().to_string(),
            to: copied.path.as_str().to_string(),
        });
        BulkItemResult::ok(raw, Some(copied.path.as_str().to_string()))
    }

    /// Fail when the copy would push the owner past a non-zero quota.
    fn check_quota(&self, path: &VirtualPath, record: &FileRecord) -> Result<(), ItemFailure> {
        let index_err = |e: IndexError| ItemFailure::new(BulkErrorCode::CopyFailed, format!("Index error: {e}"));

        let size = if record.is_directory {
            self.index.subtree_size(&self.owner, path).map_err(index_err)?
        } else {
            record.size
        };
        if size == 0 {
            return Ok(());
        }

        let quota = self.index.owner_quota(&self.owner).map_err(index_err)?;
        if quota == 0 {
            return Ok(());
        }
        let used = self.index.storage_used(&self.owner).map_err(index_err)?;
        if used.saturating_add(size) > quota {
            debug!(%path, used, size, quota, "copy refused by quota");
            return Err(ItemFailure::new(
                BulkErrorCode::QuotaExceeded,
                format!(
                    "Storage quota exceeded (using {:.1}MB of {:.1}MB)",
                    megabytes(used),
                    megabytes(quota)
                ),
            ));
        }
        Ok(())
    }

    /// Records for a fresh copy. A file copy inherits the source's stored
    /// form; a directory copy indexes everything found under it on disk.
    fn copy_records(&self, source: &FileRecord, copied: &FileMeta) -> Result<IndexBatch, StorageError> {
        let mut batch = IndexBatch::default();
        if copied.is_directory {
            batch.creates.push(NewRecord::from_meta(copied));
            for meta in self.backend.walk(copied.path.as_str())? {
                batch.creates.push(NewRecord::from_meta(&meta));
            }
        } else {
            let mut record = NewRecord::from_meta(copied);
            record.size = source.size;
            record.encryption_method = source.encryption_method;
            record.key_id.clone_from(&source.key_id);
            record.encrypted_size = source.encrypted_size;
            batch.creates.push(record);
        }
        Ok(batch)
    }

    // ---------------------------------------------------------------------
    // Shared
    // ---------------------------------------------------------------------

    fn lookup(&self, raw: &str, fallback: BulkErrorCode) -> Result<(VirtualPath, FileRecord), ItemFailure> {
        let path = normalize(raw).map_err(|e| ItemFailure::new(BulkErrorCode::InvalidPath, e.to_string()))?;
        match self.index.get(&self.owner, &path) {
            Ok(Some(record)) => Ok((path, record)),
            Ok(None) => Err(ItemFailure::new(
                BulkErrorCode::NotFound,
                format!("File not found: {raw}"),
            )),
            Err(e) => Err(ItemFailure::new(fallback, format!("Index error: {e}"))),
        }
    }
}

fn failure_code(operation: BulkOperation) -> BulkErrorCode {
    match operation {
        BulkOperation::Delete => BulkErrorCode::DeleteFailed,
        BulkOperation::Move => BulkErrorCode::MoveFailed,
        BulkOperation::Copy => BulkErrorCode::CopyFailed,
    }
}

/// A per-item failure before it is attached to its input path.
#[derive(Debug)]
struct ItemFailure {
    code: BulkErrorCode,
    message: String,
}

impl ItemFailure {
    fn new(code: BulkErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Map a storage error to the closest item code; `fallback` covers the rest.
    fn storage(err: StorageError, fallback: BulkErrorCode) -> Self {
        match err {
            StorageError::InvalidPath(e) => Self::new(BulkErrorCode::InvalidPath, e.to_string()),
            StorageError::NotFound { .. } => Self::new(BulkErrorCode::NotFound, err.to_string()),
            StorageError::AlreadyExists { .. } => Self::new(BulkErrorCode::AlreadyExists, err.to_string()),
            StorageError::SymlinkAttack { .. } | StorageError::OutsideRoot { .. } => {
                Self::new(BulkErrorCode::SymlinkAttack, err.to_string())
            }
            other => Self::new(fallback, format!("Filesystem error: {other}")),
        }
    }

    fn into_result(self, raw: &str) -> BulkItemResult {
        BulkItemResult::fail(raw, self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let paths: Vec<String> = ["b", "a", "b", "c", "a"].map(String::from).to_vec();
        assert_eq!(dedup_paths(&paths), ["b", "a", "c"]);
    }

    #[test]
    fn operation_parsing() {
        assert_eq!("copy".parse::<BulkOperation>().unwrap(), BulkOperation::Copy);
        let err = "rename".parse::<BulkOperation>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid operation: rename. Allowed: delete, move, copy");
    }

    #[test]
    fn codes_serialize_screaming() {
        let json = serde_json::to_string(&BulkErrorCode::DestinationNotFound).unwrap();
        assert_eq!(json, "\"DESTINATION_NOT_FOUND\"");
        assert_eq!(BulkErrorCode::QuotaExceeded.as_str(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn stats_count_outcomes() {
        let mut stats = BulkStats::new(BulkOperation::Move);
        stats.push(BulkItemResult::ok("a", Some("d/a".into())));
        stats.push(BulkItemResult::fail("b", BulkErrorCode::NotFound, "File not found: b"));
        assert_eq!((stats.total, stats.succeeded, stats.failed), (2, 1, 1));
        assert_eq!(stats.results[1].code(), Some(BulkErrorCode::NotFound));
    }

    #[test]
    fn storage_errors_map_to_codes() {
        let ctx = crate::storage::StorageContext::new;
        let cases = [
            (StorageError::NotFound { context: ctx() }, BulkErrorCode::NotFound),
            (StorageError::AlreadyExists { context: ctx() }, BulkErrorCode::AlreadyExists),
            (StorageError::SymlinkAttack { context: ctx() }, BulkErrorCode::SymlinkAttack),
            (StorageError::IntoItself { context: ctx() }, BulkErrorCode::MoveFailed),
        ];
        for (err, code) in cases {
            assert_eq!(ItemFailure::storage(err, BulkErrorCode::MoveFailed).code, code);
        }
    }

    #[test]
    fn quota_message_uses_megabytes() {
        assert!((megabytes(1024 * 1024) - 1.0).abs() < f64::EPSILON);
    }
}
