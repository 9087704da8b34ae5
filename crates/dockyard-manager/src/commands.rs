//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context, Result};

use dockyard_core::{ArtifactKey, BucketLocation, ObjectStoreBackend};
use dockyard_flow::ledger::Ledger;

use crate::cli::{Commands, LedgerCommand, UploadArgs};
use crate::config::ManagerConfig;
use crate::metrics::init_metrics;
use crate::server;
use crate::service::{Components, Manager};
use crate::upload::{upload, UploadRequest};

/// Runs `command` to completion.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the command fails.
pub async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Serve => serve(ManagerConfig::from_env()?).await,
        Commands::Once => once(ManagerConfig::from_env()?).await,
        Commands::Upload(args) => upload_archive(args).await,
        Commands::Ledger { command } => ledger(command).await,
    }
}

async fn connect(config: &ManagerConfig) -> Result<Manager> {
    let components = Components::connect(config)?;
    Ok(Manager::assemble(config, components).await?)
}

async fn serve(config: ManagerConfig) -> Result<()> {
    tracing::info!(?config, "starting dockyard-manager");
    init_metrics().context("install metrics recorder")?;

    let manager = Arc::new(connect(&config).await?);

    let (stop_http, http_stopped) = tokio::sync::oneshot::channel::<()>();
    let http = tokio::spawn(server::serve(
        server::router(manager.clone()),
        config.http_port,
        async move {
            let _ = http_stopped.await;
        },
    ));

    manager.run(shutdown_signal()).await;

    let _ = stop_http.send(());
    http.await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;
    tracing::info!("dockyard-manager stopped");
    Ok(())
}

async fn once(config: ManagerConfig) -> Result<()> {
    let manager = connect(&config).await?;
    let summary = manager.run_once().await?;
    tracing::info!(
        started = summary.started,
        skipped = summary.skipped,
        errors = summary.errors,
        "single poll finished"
    );
    Ok(())
}

async fn upload_archive(args: UploadArgs) -> Result<()> {
    let location = BucketLocation::parse(&args.bucket)?;
    let storage = ObjectStoreBackend::from_location(location.clone())?;
    let request = UploadRequest {
        file: args.file,
        app: args.app,
        version: args.version,
    };

    let uploaded = upload(&storage, &location, &request).await?;
    println!("{}", uploaded.url);
    Ok(())
}

async fn ledger(command: LedgerCommand) -> Result<()> {
    match command {
        LedgerCommand::List { ledger_url } => {
            let storage = ObjectStoreBackend::from_bucket(&ledger_url)?;
            let entries = Ledger::read_all(&storage).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        LedgerCommand::Reset {
            app,
            version,
            ledger_url,
            max_attempts,
        } => {
            let key = ArtifactKey::new(app, version)?;
            let storage = Arc::new(ObjectStoreBackend::from_bucket(&ledger_url)?);
            let ledger = Ledger::open(storage, max_attempts).await?;
            let entry = ledger.reset_attempts(&key).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
