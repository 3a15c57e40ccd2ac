//! Keygen command - print a fresh encryption key.
//!
//! # Examples
//!
//! ```bash
//! export STOWAGE_ENCRYPTION_KEY="$(stowage keygen)"
//! ```

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use stowage_core::crypto::StorageKey;

#[derive(ClapArgs, Clone)]
pub struct Args {}

#[instrument(level = "info", name = "cmd::keygen", skip_all)]
pub fn execute(_args: &Args) -> Result<()> {
    let key = StorageKey::generate();
    println!("{}", key.to_base64().as_str());
    Ok(())
}
