pub mod bulk;
pub mod completions;
pub mod config;
pub mod encrypt;
pub mod index_sync;
pub mod keygen;
pub mod ls;
pub mod owners;

use anyhow::{Result, bail};
use clap::Args as ClapArgs;
use uuid::Uuid;

use stowage_core::{Owner, OwnerKind, index::FileIndex};

/// Selects one owner's storage.
#[derive(ClapArgs, Clone)]
pub struct OwnerArgs {
    /// Owner id
    #[arg(long, value_name = "UUID")]
    pub owner: Uuid,

    /// Owner kind: account or organization
    #[arg(long, default_value = "account")]
    pub kind: OwnerKind,
}

impl OwnerArgs {
    pub fn owner(&self) -> Owner {
        Owner::new(self.kind, self.owner)
    }

    /// The owner, which must already be registered in the index.
    pub fn registered(&self, index: &FileIndex) -> Result<Owner> {
        let owner = self.owner();
        if !index.owner_exists(&owner)? {
            bail!("Owner not found: {owner} (register it with `stowage owners add`)");
        }
        Ok(owner)
    }
}
