//! dockyard-manager binary.

use anyhow::Result;
use clap::Parser;

use dockyard_core::init_logging;
use dockyard_manager::commands::execute;
use dockyard_manager::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.log_format.unwrap_or_default());

    execute(cli.command()).await.inspect_err(|e| {
        tracing::error!(error = %format!("{e:#}"), "dockyard-manager failed");
    })
}
