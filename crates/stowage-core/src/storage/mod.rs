//! Path-relative virtual filesystem over a single storage root.
//!
//! [`StorageBackend`] is the only way the rest of the crate touches file
//! contents. Implementations normalize every incoming path, never follow
//! symlinks, and apply the configured [`EncryptionService`] on the way in and
//! out.
//!
//! [`EncryptionService`]: crate::crypto::EncryptionService

mod layout;
mod local;

use std::{fmt, fs::File, io, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    crypto::{DecryptionError, EncryptionError, EncryptionMethod},
    fs::{RemoveStats, SafeFsError},
    path::{PathError, VirtualPath},
};

pub use layout::StorageLayout;
pub use local::LocalStorage;

/// Plaintext contents returned by [`StorageBackend::open`].
pub type FileReader = io::Cursor<Vec<u8>>;

/// Metadata describing one stored entry.
///
/// This is a value object: callers persist it into the index, the backend
/// never holds index records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub path: VirtualPath,
    pub name: String,
    /// Logical (plaintext) size. Always 0 for directories.
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: DateTime<Utc>,
    pub content_type: Option<String>,
    pub encryption_method: EncryptionMethod,
    pub encryption_key_id: Option<String>,
    /// Physical size on disk, only set for encrypted files.
    pub encrypted_size: Option<u64>,
}

/// A snapshot of one directory listing.
///
/// Entries appear in directory enumeration order. The listing can be walked
/// any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    entries: Vec<FileMeta>,
}

impl Listing {
    pub(crate) fn new(entries: Vec<FileMeta>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileMeta> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a FileMeta;
    type IntoIter = std::slice::Iter<'a, FileMeta>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Listing {
    type Item = FileMeta;
    type IntoIter = std::vec::IntoIter<FileMeta>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Where a storage error happened.
#[derive(Debug, Clone, Default)]
pub struct StorageContext {
    pub operation: Option<&'static str>,
    pub path: Option<String>,
    pub root: Option<PathBuf>,
}

impl StorageContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

impl fmt::Display for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref path) = self.path {
            let shown = if path.is_empty() { "/" } else { path.as_str() };
            parts.push(format!("'{shown}'"));
        }
        if let Some(op) = self.operation {
            parts.push(format!("during {op}"));
        }
        if let Some(ref root) = self.root {
            parts.push(format!("under {}", root.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("not found: {context}")]
    NotFound { context: StorageContext },

    #[error("parent directory does not exist: {context}")]
    ParentNotFound { context: StorageContext },

    #[error("is a directory: {context}")]
    IsADirectory { context: StorageContext },

    #[error("not a directory: {context}")]
    NotADirectory { context: StorageContext },

    #[error("already exists: {context}")]
    AlreadyExists { context: StorageContext },

    #[error("directory not empty: {context}")]
    DirectoryNotEmpty { context: StorageContext },

    #[error("cannot {operation} the storage root")]
    RootPath { operation: &'static str },

    #[error("cannot place a directory inside itself: {context}")]
    IntoItself { context: StorageContext },

    /// **[SECURITY VIOLATION]** A symlink was found on the route to an entry.
    #[error("symlink refused: {context}")]
    SymlinkAttack { context: StorageContext },

    /// **[SECURITY VIOLATION]** A resolved path escaped the storage root.
    #[error("path escapes storage root: {context}")]
    OutsideRoot { context: StorageContext },

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// **[FATAL]** Symlink-safe operations cannot be guaranteed on this host.
    #[error("platform unsupported: {reason}")]
    PlatformUnsupported { reason: String },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("I/O error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: StorageContext,
    },
}

impl StorageError {
    pub fn io(source: io::Error, context: StorageContext) -> Self {
        StorageError::Io { source, context }
    }

    /// Attach `context` to an error from the symlink-safe layer.
    pub fn from_safe(err: SafeFsError, context: StorageContext) -> Self {
        match err {
            SafeFsError::SymlinkAttack { .. } => StorageError::SymlinkAttack { context },
            SafeFsError::PathOutsideBoundary { .. } => StorageError::OutsideRoot { context },
            SafeFsError::NotFound { .. } => StorageError::NotFound { context },
            SafeFsError::AlreadyExists { .. } => StorageError::AlreadyExists { context },
            SafeFsError::NotADirectory { .. } => StorageError::NotADirectory { context },
            SafeFsError::IntoItself { .. } => StorageError::IntoItself { context },
            SafeFsError::PlatformUnsupported { reason } => {
                StorageError::PlatformUnsupported { reason }
            }
            SafeFsError::Io { source, .. } => StorageError::Io { source, context },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// The storage operations consumed by the sync, bulk and migration services.
///
/// Every path argument is a caller-supplied relative path; implementations
/// normalize it and fail with [`StorageError::InvalidPath`] when it is unsafe.
pub trait StorageBackend: Send + Sync {
    /// Write `content`, encrypting it when encryption is enabled.
    fn save(&self, path: &str, content: &[u8]) -> Result<FileMeta, StorageError>;

    /// Read and decrypt a file. Legacy plaintext is returned as-is.
    fn open(&self, path: &str) -> Result<FileReader, StorageError>;

    /// Read the bytes exactly as stored on disk.
    fn open_raw(&self, path: &str) -> Result<File, StorageError>;

    /// Delete a file or an empty directory.
    fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// `false` for missing entries and for paths that fail validation.
    fn exists(&self, path: &str) -> bool;

    fn list(&self, path: &str, glob: Option<&str>) -> Result<Listing, StorageError>;

    fn info(&self, path: &str) -> Result<FileMeta, StorageError>;

    /// Create a directory and any missing parents. Idempotent.
    fn mkdir(&self, path: &str) -> Result<FileMeta, StorageError>;

    /// Move `source` into the existing directory `dest_dir`. Never overwrites.
    fn move_to(&self, source: &str, dest_dir: &str) -> Result<FileMeta, StorageError>;

    /// Copy `source` into `dest_dir`.
    ///
    /// Without `new_name`, a colliding name becomes `name (copy).ext`,
    /// then `name (copy 2).ext` and so on. An explicit `new_name` that
    /// collides is an error.
    fn copy(
        &self,
        source: &str,
        dest_dir: &str,
        new_name: Option<&str>,
    ) -> Result<FileMeta, StorageError>;

    /// Recursively delete a directory through [`crate::fs::safe_rmtree`].
    fn remove_tree(&self, path: &str) -> Result<RemoveStats, StorageError>;

    /// Every entry below `path`, parents before children.
    fn walk(&self, path: &str) -> Result<Vec<FileMeta>, StorageError> {
        let mut out = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(dir) = pending.pop() {
            for meta in self.list(&dir, None)? {
                if meta.is_directory {
                    pending.push(meta.path.as_str().to_string());
                }
                out.push(meta);
            }
        }
        Ok(out)
    }
}
