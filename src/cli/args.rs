#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const COMMAND_NAMES: &[&str] = &["demo", "config", "error-codes", "init-db", "help"];

#[derive(Debug, Parser)]
#[command(name = "buildloop")]
#[command(about = "Iterative build-and-repair orchestration engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file (default: .buildloop/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Postgres URL; overrides the config file and environment
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run a scripted build end to end in-process and print its final status
    Demo {
        #[arg(long, default_value = "demo-tenant")]
        tenant: String,

        #[arg(long, default_value_t = 5)]
        max_iterations: u32,

        /// Touch a migration so the run needs approval; the demo approves it
        #[arg(long, default_value_t = false)]
        risky: bool,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Print the effective configuration
    Config,

    /// Print the error code table
    ErrorCodes,

    /// Apply the bundled schema to the configured Postgres database
    InitDb {
        #[arg(short, long)]
        url: Option<String>,
    },
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Demo { .. } => "demo",
            Self::Config => "config",
            Self::ErrorCodes => "error-codes",
            Self::InitDb { .. } => "init-db",
        }
    }
}

/// Closest known subcommand within edit distance 3.
#[must_use]
pub fn suggest_commands(typo: &str) -> Vec<String> {
    COMMAND_NAMES
        .iter()
        .map(|cmd| (cmd, strsim::levenshtein(typo, cmd)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by_key(|(_, dist)| *dist)
        .map(|(cmd, _)| vec![(*cmd).to_string()])
        .unwrap_or_default()
}
