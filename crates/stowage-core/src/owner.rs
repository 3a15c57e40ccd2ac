//! Who a stored file belongs to.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The two tenant classes. Accounts own private files, organizations own
/// shared files; each lives under its own storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Account,
    Organization,
}

impl OwnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerKind::Account => "account",
            OwnerKind::Organization => "organization",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown owner kind {0:?}")]
pub struct UnknownOwnerKind(pub String);

impl FromStr for OwnerKind {
    type Err = UnknownOwnerKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(OwnerKind::Account),
            "organization" | "org" => Ok(OwnerKind::Organization),
            other => Err(UnknownOwnerKind(other.to_string())),
        }
    }
}

/// Exactly one owner per file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Owner {
    Account(Uuid),
    Organization(Uuid),
}

impl Owner {
    pub fn new(kind: OwnerKind, id: Uuid) -> Self {
        match kind {
            OwnerKind::Account => Owner::Account(id),
            OwnerKind::Organization => Owner::Organization(id),
        }
    }

    pub fn kind(&self) -> OwnerKind {
        match self {
            Owner::Account(_) => OwnerKind::Account,
            Owner::Organization(_) => OwnerKind::Organization,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Owner::Account(id) | Owner::Organization(id) => *id,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}
