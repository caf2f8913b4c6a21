//! Command-line interface built on clap.
//!
//! [`Cli`] holds the subcommands ([`Command`]: run, route, status) and the
//! global flags (--config, --verbose, --log-json).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// docpilot: budget-aware, circuit-broken document job orchestrator.
#[derive(Debug, Parser)]
#[command(name = "docpilot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./docpilot.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executes a job file end to end.
    Run {
        /// Path to a JSON or TOML job file.
        job_file: PathBuf,

        /// Print the result as JSON on stdout instead of a summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Shows which backend a job would be routed to, and why.
    Route {
        /// Path to a JSON or TOML job file.
        job_file: PathBuf,
    },

    /// Shows budget spend and fallback queue depth.
    Status,
}
