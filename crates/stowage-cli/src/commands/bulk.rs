//! Bulk command - delete, move or copy many paths for one owner.
//!
//! Always runs inline; the per-path outcome is printed and the command fails
//! if any path failed.
//!
//! # Examples
//!
//! ```bash
//! stowage bulk delete --owner 6f1c... old.txt drafts
//! stowage bulk move --owner 6f1c... --destination archive a.txt b.txt
//! stowage bulk copy --owner 6f1c... --kind organization --destination "" report.pdf
//! ```

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args as ClapArgs, ValueEnum};
use tracing::instrument;

use stowage_core::{
    bulk::{BulkOperation, BulkOperationService, BulkOptions, BulkStats},
    effects::{AuditLog, EffectSink},
};

use super::OwnerArgs;
use crate::{
    config::Store,
    output::{OutputFormat, create_table, print_json},
};

#[derive(Clone, Copy, ValueEnum)]
pub enum OperationArg {
    Delete,
    Move,
    Copy,
}

impl From<OperationArg> for BulkOperation {
    fn from(op: OperationArg) -> Self {
        match op {
            OperationArg::Delete => BulkOperation::Delete,
            OperationArg::Move => BulkOperation::Move,
            OperationArg::Copy => BulkOperation::Copy,
        }
    }
}

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[arg(value_enum)]
    pub operation: OperationArg,

    #[command(flatten)]
    pub owner: OwnerArgs,

    /// Target directory for move and copy ("" is the owner root)
    #[arg(long, short)]
    pub destination: Option<String>,

    /// Paths relative to the owner root
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,

    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[instrument(level = "info", name = "cmd::bulk", skip_all, fields(owner = %args.owner.owner, count = args.paths.len()))]
pub fn execute(store: &Store, args: &Args) -> Result<()> {
    let owner = args.owner.registered(&store.index)?;
    let backend = Arc::new(store.layout.backend(&owner)?);
    let service = BulkOperationService::new(backend, store.index.clone(), owner).with_config(store.config.bulk);

    let mut options = BulkOptions::default().force_sync(true);
    if let Some(destination) = &args.destination {
        options = options.destination(destination.clone());
    }

    let outcome = service.execute(args.operation.into(), &args.paths, &options)?;
    let Some(stats) = outcome.stats() else {
        bail!("Bulk request was queued unexpectedly");
    };
    AuditLog.dispatch_all(&stats.effects);

    match args.format {
        OutputFormat::Json => print_json(stats)?,
        OutputFormat::Table => print_table(stats),
    }

    if stats.failed > 0 {
        bail!("{} of {} paths failed", stats.failed, stats.total);
    }
    Ok(())
}

fn print_table(stats: &BulkStats) {
    let mut table = create_table();
    table.set_header(vec!["Path", "Result", "Detail"]);
    for result in &stats.results {
        let (status, detail) = match &result.error {
            None => ("ok".to_string(), result.new_path.clone().unwrap_or_default()),
            Some(error) => (error.code.to_string(), error.message.clone()),
        };
        table.add_row(vec![result.path.clone(), status, detail]);
    }
    println!("{table}");
    println!(
        "{}: {} succeeded, {} failed",
        stats.operation, stats.succeeded, stats.failed
    );
}
