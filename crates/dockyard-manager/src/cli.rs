//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use dockyard_core::LogFormat;

use crate::config::DEFAULT_LEDGER_URL;

/// Builds and deploys archives uploaded to a bucket.
#[derive(Debug, Parser)]
#[command(name = "dockyard-manager")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log format (`json` or `pretty`).
    #[arg(long, env = "DOCKYARD_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Subcommand to execute; `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The subcommand to run.
    #[must_use]
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

/// CLI subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the poll loop with health, metrics and ledger endpoints.
    Serve,
    /// Poll once and wait for the dispatched pipelines to finish.
    Once,
    /// Upload an archive as `<app>/<version>`.
    Upload(UploadArgs),
    /// Inspect or repair the ledger.
    Ledger {
        /// Ledger operation.
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

/// Arguments of `upload`.
#[derive(Debug, Clone, Args)]
pub struct UploadArgs {
    /// Local `.tar` or `.tar.gz` file.
    pub file: PathBuf,

    /// Application name.
    #[arg(long)]
    pub app: String,

    /// Version.
    #[arg(long = "version")]
    pub version: String,

    /// Destination bucket.
    #[arg(long, env = "DOCKYARD_BUCKET")]
    pub bucket: String,
}

/// Ledger subcommands. They read the ledger directly, so `reset` must run
/// while the manager is stopped; use `POST /ledger/:app/:version/reset` on a
/// running manager.
#[derive(Debug, Clone, Subcommand)]
pub enum LedgerCommand {
    /// Print every entry as JSON.
    List {
        /// Ledger location.
        #[arg(long, env = "DOCKYARD_LEDGER_URL", default_value = DEFAULT_LEDGER_URL)]
        ledger_url: String,
    },
    /// Clear the attempt counter of a FAILED entry.
    Reset {
        /// Application name.
        app: String,
        /// Version.
        version: String,
        /// Ledger location.
        #[arg(long, env = "DOCKYARD_LEDGER_URL", default_value = DEFAULT_LEDGER_URL)]
        ledger_url: String,
        /// Attempt ceiling the ledger is opened with.
        #[arg(long, env = "DOCKYARD_MAX_ATTEMPTS", default_value = "3")]
        max_attempts: u32,
    },
}
