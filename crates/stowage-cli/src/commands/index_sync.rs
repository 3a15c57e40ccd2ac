//! Index sync command - reconcile storage roots with the metadata index.
//!
//! # Examples
//!
//! ```bash
//! # Report discrepancies for every owner
//! stowage index-sync
//!
//! # Add missing records for one organization
//! stowage index-sync --mode sync --owner 6f1c... --scope orgs
//!
//! # Preview, then drop records whose files are gone
//! stowage index-sync --mode clean --force --dry-run
//! stowage index-sync --mode clean --force
//! ```

use anyhow::Result;
use clap::{Args as ClapArgs, ValueEnum};
use tracing::instrument;
use uuid::Uuid;

use stowage_core::sync::{IndexSync, SyncMode, SyncRequest, SyncScope, SyncStats};

use crate::{
    config::Store,
    output::{OutputFormat, create_table, print_json},
};

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum ModeArg {
    /// Report only
    #[default]
    Audit,
    /// Add and refresh records
    Sync,
    /// Delete orphaned records (needs --force)
    Clean,
    /// Sync then clean (needs --force)
    Full,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Audit => SyncMode::Audit,
            ModeArg::Sync => SyncMode::Sync,
            ModeArg::Clean => SyncMode::Clean,
            ModeArg::Full => SyncMode::Full,
        }
    }
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum ScopeArg {
    Accounts,
    Orgs,
    #[default]
    All,
}

impl From<ScopeArg> for SyncScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Accounts => SyncScope::Accounts,
            ScopeArg::Orgs => SyncScope::Organizations,
            ScopeArg::All => SyncScope::All,
        }
    }
}

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// What the run may change
    #[arg(long, value_enum, default_value = "audit")]
    pub mode: ModeArg,

    /// Report what would change without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Allow modes that delete records
    #[arg(long)]
    pub force: bool,

    /// Only this owner id
    #[arg(long, value_name = "UUID")]
    pub owner: Option<Uuid>,

    /// Which owner kinds to scan
    #[arg(long, value_enum, default_value = "all")]
    pub scope: ScopeArg,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[instrument(level = "info", name = "cmd::index_sync", skip_all, fields(dry_run = args.dry_run))]
pub fn execute(store: &Store, args: &Args) -> Result<()> {
    let mut request = SyncRequest::new(args.mode.into())
        .dry_run(args.dry_run)
        .force(args.force)
        .scope(args.scope.into());
    if let Some(id) = args.owner {
        request = request.owner(id);
    }

    let stats = IndexSync::new(store.layout.clone(), store.index.clone()).run(request)?;

    match args.format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => print_table(request, &stats),
    }
    Ok(())
}

fn print_table(request: SyncRequest, stats: &SyncStats) {
    let suffix = if request.dry_run { " (dry run)" } else { "" };
    println!("Index sync: mode {}{suffix}", request.mode);

    let mut table = create_table();
    table.set_header(vec!["Metric", "Count"]);
    let rows = [
        ("Owners scanned", stats.owners_scanned),
        ("Entries on disk", stats.files_on_disk),
        ("Records in index", stats.files_in_index),
        ("Missing from index", stats.missing_in_index),
        ("Orphaned in index", stats.orphaned_in_index),
        ("Records created", stats.records_created),
        ("Records updated", stats.records_updated),
        ("Records deleted", stats.records_deleted),
        ("Records skipped", stats.records_skipped),
    ];
    for (label, count) in rows {
        table.add_row(vec![label.to_string(), count.to_string()]);
    }
    println!("{table}");

    for warning in &stats.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &stats.errors {
        eprintln!("error: {error}");
    }
}
