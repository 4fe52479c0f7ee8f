use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use s3_pit_restore::{Cli, RestoreError, RestoreSession, S3Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let endpoint_url = cli.endpoint_url.clone();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => Cli::command()
            .error(clap::error::ErrorKind::ValueValidation, e)
            .exit(),
    };

    let store = S3Store::connect(endpoint_url.as_deref()).await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                cancel.cancel();
            }
        }
    });

    let session = RestoreSession::new(config, Arc::new(store), cancel);
    let summary = match session.run().await {
        Ok(summary) => summary,
        Err(RestoreError::NoMatchingVersions) => {
            eprintln!("No versions matching criteria, exiting ...");
            return Ok(ExitCode::from(1));
        }
        Err(e) => return Err(e).context("restore failed"),
    };

    if summary.interrupted {
        println!("Gracefully exiting ...");
    }
    info!(
        restored = summary.restored,
        removed = summary.removed,
        deleted = summary.deleted_at_window,
        pending_retrieval = summary.pending_retrieval,
        retained = summary.retained,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        cancelled = summary.cancelled,
        dry_run = summary.dry_run,
        "restore finished"
    );
    debug!("summary: {}", serde_json::to_string(&summary)?);

    Ok(ExitCode::SUCCESS)
}
