//! Shell completion generation.
//!
//! # Examples
//!
//! ```bash
//! stowage completions bash > /etc/bash_completion.d/stowage
//! stowage completions zsh > "${fpath[1]}/_stowage"
//! ```

use std::io;

use anyhow::Result;
use clap::{Args as ClapArgs, CommandFactory, ValueEnum};
use clap_complete::{Shell, generate};

use crate::Cli;

#[derive(Clone, Copy, ValueEnum)]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
    Powershell,
    Elvish,
}

impl From<ShellType> for Shell {
    fn from(shell: ShellType) -> Self {
        match shell {
            ShellType::Bash => Shell::Bash,
            ShellType::Zsh => Shell::Zsh,
            ShellType::Fish => Shell::Fish,
            ShellType::Powershell => Shell::PowerShell,
            ShellType::Elvish => Shell::Elvish,
        }
    }
}

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[arg(value_enum)]
    pub shell: ShellType,
}

pub fn execute(args: &Args) -> Result<()> {
    generate(Shell::from(args.shell), &mut Cli::command(), "stowage", &mut io::stdout());
    Ok(())
}
