//! Error types for the stowage-core crate
//!
//! Every component owns its error enum; this module gathers them in one place.

pub use crate::bulk::{BulkError, BulkErrorCode, BulkItemError, QueueError};
pub use crate::config::ConfigError;
pub use crate::crypto::{DecryptionError, EncryptionError, KeyError, codec::UnknownMethod};
pub use crate::fs::SafeFsError;
pub use crate::index::IndexError;
pub use crate::migrate::MigrationError;
pub use crate::owner::UnknownOwnerKind;
pub use crate::path::PathError;
pub use crate::storage::{StorageContext, StorageError};
pub use crate::sync::SyncError;
