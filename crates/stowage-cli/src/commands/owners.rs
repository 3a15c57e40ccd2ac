//! Owners command - register tenants in the index and show their usage.
//!
//! Sync and migration only visit registered owners.
//!
//! # Examples
//!
//! ```bash
//! stowage owners add 6f1c... --quota 10737418240
//! stowage owners add 9a2e... --kind organization
//! stowage owners list
//! ```

use anyhow::Result;
use clap::{Args as ClapArgs, Subcommand};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use stowage_core::{Owner, OwnerKind};

use crate::{
    config::Store,
    output::{OutputFormat, create_table, format_size, print_json},
};

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(subcommand)]
    pub command: OwnersCommand,
}

#[derive(Subcommand, Clone)]
pub enum OwnersCommand {
    /// Register an owner, or change its quota
    Add {
        id: Uuid,

        #[arg(long, default_value = "account")]
        kind: OwnerKind,

        /// Quota in bytes; 0 means unlimited
        #[arg(long, default_value_t = 0)]
        quota: u64,
    },

    /// List registered owners with usage
    List {
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Serialize)]
struct OwnerRow {
    owner: Owner,
    quota_bytes: u64,
    used_bytes: u64,
}

#[instrument(level = "info", name = "cmd::owners", skip_all)]
pub fn execute(store: &Store, args: &Args) -> Result<()> {
    match &args.command {
        OwnersCommand::Add { id, kind, quota } => {
            let owner = Owner::new(*kind, *id);
            store.index.register_owner(&owner, *quota)?;
            println!("Registered {owner}");
            Ok(())
        }
        OwnersCommand::List { format } => list(store, *format),
    }
}

fn list(store: &Store, format: OutputFormat) -> Result<()> {
    let mut rows = Vec::new();
    for kind in [OwnerKind::Account, OwnerKind::Organization] {
        for owner in store.index.owners(kind)? {
            rows.push(OwnerRow {
                quota_bytes: store.index.owner_quota(&owner)?,
                used_bytes: store.index.storage_used(&owner)?,
                owner,
            });
        }
    }

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec!["Kind", "Id", "Used", "Quota"]);
            for row in &rows {
                let quota = if row.quota_bytes == 0 {
                    "unlimited".to_string()
                } else {
                    format_size(row.quota_bytes)
                };
                table.add_row(vec![
                    row.owner.kind().to_string(),
                    row.owner.id().to_string(),
                    format_size(row.used_bytes),
                    quota,
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
