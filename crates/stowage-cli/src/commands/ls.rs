//! List command - list a directory in one owner's storage.
//!
//! Reads the filesystem through the storage backend, not the index.
//!
//! # Examples
//!
//! ```bash
//! stowage ls --owner 6f1c...
//! stowage ls --owner 6f1c... docs --glob '*.pdf'
//! stowage ls --owner 6f1c... --format json | jq '.entries[].name'
//! ```

use anyhow::Result;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use stowage_core::{FileMeta, StorageBackend};

use super::OwnerArgs;
use crate::{
    config::Store,
    output::{OutputFormat, create_table, format_entry_type, format_size, print_json},
};

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(flatten)]
    pub owner: OwnerArgs,

    /// Directory relative to the owner root (default: root)
    #[arg(default_value = "")]
    pub path: String,

    /// Only names matching this glob
    #[arg(long)]
    pub glob: Option<String>,

    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    entries: Vec<FileMeta>,
}

#[instrument(level = "info", name = "cmd::ls", skip_all, fields(path = %args.path))]
pub fn execute(store: &Store, args: &Args) -> Result<()> {
    let backend = store.layout.backend(&args.owner.owner())?;
    let mut entries: Vec<FileMeta> = backend.list(&args.path, args.glob.as_deref())?.into_iter().collect();
    entries.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));

    match args.format {
        OutputFormat::Json => print_json(&LsOutput {
            path: &args.path,
            entries,
        })?,
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec!["Name", "Type", "Size", "Encryption", "Modified"]);
            for entry in &entries {
                let size = if entry.is_directory {
                    "-".to_string()
                } else {
                    format_size(entry.size)
                };
                table.add_row(vec![
                    entry.name.clone(),
                    format_entry_type(entry.is_directory).to_string(),
                    size,
                    entry.encryption_method.to_string(),
                    entry.modified_at.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
