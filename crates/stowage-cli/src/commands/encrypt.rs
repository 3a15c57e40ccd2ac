//! Encrypt-files command - bring legacy plaintext files under the configured key.
//!
//! # Examples
//!
//! ```bash
//! # List plaintext files
//! STOWAGE_ENCRYPTION_METHOD=server STOWAGE_ENCRYPTION_KEY=... stowage encrypt-files
//!
//! # Encrypt them in place
//! stowage encrypt-files --mode encrypt --force
//! ```

use anyhow::Result;
use clap::{Args as ClapArgs, ValueEnum};
use tracing::instrument;
use uuid::Uuid;

use stowage_core::migrate::{EncryptMigration, EncryptMode, EncryptRequest, MigrationStats};

use crate::{
    config::Store,
    output::{OutputFormat, create_table, print_json},
};

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum ModeArg {
    /// Report plaintext files
    #[default]
    Audit,
    /// Rewrite plaintext files encrypted (needs --force)
    Encrypt,
}

impl From<ModeArg> for EncryptMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Audit => EncryptMode::Audit,
            ModeArg::Encrypt => EncryptMode::Encrypt,
        }
    }
}

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[arg(long, value_enum, default_value = "audit")]
    pub mode: ModeArg,

    /// Report without rewriting files
    #[arg(long)]
    pub dry_run: bool,

    /// Allow rewriting files
    #[arg(long)]
    pub force: bool,

    /// Only this owner id
    #[arg(long, value_name = "UUID")]
    pub owner: Option<Uuid>,

    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[instrument(level = "info", name = "cmd::encrypt_files", skip_all, fields(dry_run = args.dry_run))]
pub fn execute(store: &Store, args: &Args) -> Result<()> {
    let request = EncryptRequest {
        mode: args.mode.into(),
        dry_run: args.dry_run,
        force: args.force,
        owner_filter: args.owner,
    };
    let stats = EncryptMigration::new(store.layout.clone(), store.index.clone()).run(request)?;

    match args.format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => print_table(&store.config.encryption.key_id, &stats),
    }
    Ok(())
}

fn print_table(key_id: &str, stats: &MigrationStats) {
    println!("Encryption migration (key id {key_id})");
    for file in &stats.unencrypted_files {
        println!("  [UNENCRYPTED] {file}");
    }

    let mut table = create_table();
    table.set_header(vec!["Metric", "Count"]);
    let rows = [
        ("Owners scanned", stats.owners_scanned),
        ("Files scanned", stats.files_scanned),
        ("Already encrypted", stats.already_encrypted),
        ("Unencrypted", stats.unencrypted),
        ("Encrypted now", stats.encrypted),
        ("Errors", stats.errors),
    ];
    for (label, count) in rows {
        table.add_row(vec![label.to_string(), count.to_string()]);
    }
    println!("{table}");
}
