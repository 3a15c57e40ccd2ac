//! Config command - print the effective configuration as TOML.
//!
//! The encryption key is never printed.

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use stowage_core::StowageConfig;

#[derive(ClapArgs, Clone)]
pub struct Args {}

#[instrument(level = "info", name = "cmd::config", skip_all)]
pub fn execute(config: &StowageConfig, _args: &Args) -> Result<()> {
    let mut shown = config.clone();
    if shown.encryption.key.is_some() {
        shown.encryption.key = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}
