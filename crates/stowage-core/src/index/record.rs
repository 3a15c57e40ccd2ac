use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{crypto::EncryptionMethod, owner::Owner, path::VirtualPath, storage::FileMeta};

/// A stored index row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub owner: Owner,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub is_directory: bool,
    pub parent_path: String,
    pub encryption_method: EncryptionMethod,
    pub key_id: Option<String>,
    pub encrypted_size: Option<u64>,
    pub sort_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_encrypted(&self) -> bool {
        self.encryption_method != EncryptionMethod::None
    }

    /// The insertable form of this row, for edits.
    pub fn to_new(&self) -> NewRecord {
        NewRecord {
            path: self.path.clone(),
            name: self.name.clone(),
            size: self.size,
            content_type: self.content_type.clone(),
            is_directory: self.is_directory,
            parent_path: self.parent_path.clone(),
            encryption_method: self.encryption_method,
            key_id: self.key_id.clone(),
            encrypted_size: self.encrypted_size,
            sort_position: self.sort_position,
        }
    }
}

/// Column values for an insert or overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub is_directory: bool,
    pub parent_path: String,
    pub encryption_method: EncryptionMethod,
    pub key_id: Option<String>,
    pub encrypted_size: Option<u64>,
    pub sort_position: Option<i64>,
}

impl NewRecord {
    fn at(path: &VirtualPath) -> Self {
        Self {
            path: path.as_str().to_string(),
            name: path.file_name().unwrap_or_default().to_string(),
            size: 0,
            content_type: None,
            is_directory: false,
            parent_path: path.parent_path(),
            encryption_method: EncryptionMethod::None,
            key_id: None,
            encrypted_size: None,
            sort_position: None,
        }
    }

    /// A plaintext file with its content type guessed from the name.
    pub fn file(path: &VirtualPath, size: u64) -> Self {
        let mut record = Self::at(path);
        record.size = size;
        record.content_type = mime_guess::from_path(&record.name).first_raw().map(str::to_owned);
        record
    }

    pub fn directory(path: &VirtualPath) -> Self {
        let mut record = Self::at(path);
        record.is_directory = true;
        record
    }

    pub fn from_meta(meta: &FileMeta) -> Self {
        let mut record = Self::at(&meta.path);
        record.size = if meta.is_directory { 0 } else { meta.size };
        record.is_directory = meta.is_directory;
        record.content_type = if meta.is_directory {
            None
        } else {
            meta.content_type.clone()
        };
        record.encryption_method = meta.encryption_method;
        record.key_id = meta.encryption_key_id.clone();
        record.encrypted_size = meta.encrypted_size;
        record
    }
}

/// Whether a dependent still references its file in a user-visible way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependentStatus {
    Active,
    Inactive,
}

/// A record that references a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dependent {
    ShareLink { id: i64, status: DependentStatus },
    ManagedContent { id: i64, status: DependentStatus },
}

impl Dependent {
    /// A link is active until revoked or past its expiry.
    pub(crate) fn share_link(
        id: i64,
        revoked: bool,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let live = !revoked && expires_at.is_none_or(|t| t > now);
        Dependent::ShareLink {
            id,
            status: if live {
                DependentStatus::Active
            } else {
                DependentStatus::Inactive
            },
        }
    }

    pub(crate) fn managed_content(id: i64, published: bool) -> Self {
        Dependent::ManagedContent {
            id,
            status: if published {
                DependentStatus::Active
            } else {
                DependentStatus::Inactive
            },
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Dependent::ShareLink { id, .. } | Dependent::ManagedContent { id, .. } => *id,
        }
    }

    pub fn status(&self) -> DependentStatus {
        match self {
            Dependent::ShareLink { status, .. } | Dependent::ManagedContent { status, .. } => *status,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == DependentStatus::Active
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Dependent::ShareLink { .. } => "share link",
            Dependent::ManagedContent { .. } => "managed content",
        }
    }
}
