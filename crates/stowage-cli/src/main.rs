#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
// Disable with `--no-default-features` if debugging allocator issues.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod config;
mod exit_code;
mod output;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use stowage_core::{
    bulk::BulkError,
    config::ConfigError,
    crypto::KeyError,
    fs::SafeFsError,
    index::IndexError,
    migrate::MigrationError,
    storage::StorageError,
    sync::SyncError,
};

use crate::commands::{bulk, completions, encrypt, index_sync, keygen, ls, owners};
use crate::config::{ConfigArgs, Store};

/// Maintenance tools for stowage file stores
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Register an account and index what is already on disk
    stowage owners add 6f1c0c9e-3b7a-4a8e-9a55-0d6a4f6b2f10
    stowage index-sync --mode sync

    # Drop index records whose files are gone (preview first)
    stowage index-sync --mode clean --force --dry-run

    # Encrypt legacy plaintext files
    export STOWAGE_ENCRYPTION_METHOD=server
    export STOWAGE_ENCRYPTION_KEY=\"$(stowage keygen)\"
    stowage encrypt-files --mode encrypt --force

    # Use a config file
    stowage --config /etc/stowage.toml owners list
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE", env = "STOWAGE_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ============ Index and storage maintenance ============

    /// Reconcile storage roots with the index
    IndexSync(index_sync::Args),

    /// Encrypt files stored before encryption was enabled
    EncryptFiles(encrypt::Args),

    /// Delete, move or copy many paths for one owner
    Bulk(bulk::Args),

    /// List a directory in an owner's storage
    Ls(ls::Args),

    /// Register and list owners
    Owners(owners::Args),

    // ============ Standalone commands (no store required) ============

    /// Print a new base64url encryption key
    Keygen(keygen::Args),

    /// Print the effective configuration
    Config(commands::config::Args),

    /// Generate shell completions
    Completions(completions::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);

            // Only print error if not quiet mode (quiet is parsed separately for this)
            let args: Vec<String> = std::env::args().collect();
            let is_quiet = args.iter().any(|a| a == "-q" || a == "--quiet");

            if !is_quiet {
                eprintln!("Error: {e:#}");
            }

            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Held until exit so buffered log lines reach the file
    let _log_guard = if cli.quiet {
        None
    } else {
        setup_tracing(cli.verbose, cli.log_file.as_deref())?
    };

    match &cli.command {
        Commands::Keygen(args) => return keygen::execute(args),
        Commands::Completions(args) => return completions::execute(args),
        _ => {}
    }

    let config = cli.config.load()?;
    if let Commands::Config(args) = &cli.command {
        return commands::config::execute(&config, args);
    }

    let store = Store::open(config)?;
    match &cli.command {
        Commands::IndexSync(args) => index_sync::execute(&store, args),
        Commands::EncryptFiles(args) => encrypt::execute(&store, args),
        Commands::Bulk(args) => bulk::execute(&store, args),
        Commands::Ls(args) => ls::execute(&store, args),
        Commands::Owners(args) => owners::execute(&store, args),
        Commands::Keygen(_) | Commands::Completions(_) | Commands::Config(_) => Ok(()),
    }
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Categorize an error into an exit code using typed error downcasting
///
/// This approach is more robust than string matching because it doesn't depend
/// on error message wording, which could change between versions.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        // Guards on destructive modes
        if let Some(sync_err) = cause.downcast_ref::<SyncError>() {
            match sync_err {
                SyncError::ForceRequired { .. } => return exit_code::FORCE_REQUIRED,
                SyncError::InvalidMode(_) => return exit_code::USAGE_ERROR,
                SyncError::Index(_) => {}
            }
        }

        if let Some(migration_err) = cause.downcast_ref::<MigrationError>() {
            match migration_err {
                MigrationError::ForceRequired => return exit_code::FORCE_REQUIRED,
                MigrationError::EncryptionDisabled => return exit_code::USAGE_ERROR,
                MigrationError::UnknownOwner(_) => return exit_code::NOT_FOUND,
                MigrationError::Index(_) => {}
            }
        }

        if let Some(bulk_err) = cause.downcast_ref::<BulkError>()
            && !matches!(bulk_err, BulkError::Index(_))
        {
            return exit_code::USAGE_ERROR;
        }

        // Storage errors, including symlink refusals
        if let Some(storage_err) = cause.downcast_ref::<StorageError>() {
            match storage_err {
                StorageError::SymlinkAttack { .. } | StorageError::OutsideRoot { .. } => {
                    return exit_code::SECURITY_VIOLATION;
                }
                StorageError::NotFound { .. } | StorageError::ParentNotFound { .. } => {
                    return exit_code::NOT_FOUND;
                }
                StorageError::InvalidPath(_) | StorageError::InvalidGlob { .. } => {
                    return exit_code::USAGE_ERROR;
                }
                _ => {}
            }
        }

        if let Some(fs_err) = cause.downcast_ref::<SafeFsError>()
            && matches!(
                fs_err,
                SafeFsError::SymlinkAttack { .. } | SafeFsError::PathOutsideBoundary { .. }
            )
        {
            return exit_code::SECURITY_VIOLATION;
        }

        if let Some(IndexError::UnknownOwner(_)) = cause.downcast_ref::<IndexError>() {
            return exit_code::NOT_FOUND;
        }

        // Bad configuration is a usage problem
        if cause.downcast_ref::<ConfigError>().is_some() || cause.downcast_ref::<KeyError>().is_some() {
            return exit_code::USAGE_ERROR;
        }

        // Generic I/O errors
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::NotFound
        {
            return exit_code::NOT_FOUND;
        }
    }

    // Fallback to string matching for errors we don't have typed variants for
    let msg = format!("{e:#}").to_lowercase();
    if msg.contains("not found") {
        exit_code::NOT_FOUND
    } else {
        exit_code::GENERAL_ERROR
    }
}
