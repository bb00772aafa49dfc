//! Run command - process jobs until a shutdown signal
//!
//! Usage:
//! ```bash
//! intellifill-worker run
//! intellifill-worker run --shutdown-timeout 60
//! ```

use anyhow::Result;
use clap::Args;
use futures::future::select_all;
use tokio::signal;
use tracing::{error, info, warn};

use super::open_runtime;
use crate::settings::Settings;

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Seconds to wait for active jobs on shutdown (overrides settings)
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

pub async fn run(args: RunArgs, mut settings: Settings) -> Result<()> {
    if let Some(secs) = args.shutdown_timeout {
        settings.shutdown_timeout_secs = secs;
    }

    let (db, runtime) = open_runtime(&settings).await?;
    let workers = runtime.start();
    info!(
        pools = runtime.pools().len(),
        database = %settings.database.url,
        "Workers started"
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        (result, index, _) = select_all(workers) => {
            let queue = runtime.pools().get(index).map(|p| p.queue().name().to_string());
            match result {
                Ok(Ok(())) => warn!(queue = ?queue, "Worker pool exited early"),
                Ok(Err(e)) => error!(queue = ?queue, error = %e, "Worker pool failed"),
                Err(e) => error!(queue = ?queue, error = %e, "Worker pool panicked"),
            }
        }
    }

    let reports = runtime.shutdown(settings.shutdown_timeout()).await;
    for report in &reports {
        if report.abandoned > 0 {
            warn!(
                queue = %report.queue,
                drained = report.drained,
                abandoned = report.abandoned,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Queue shut down with abandoned jobs"
            );
        } else {
            info!(
                queue = %report.queue,
                drained = report.drained,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Queue drained"
            );
        }
    }

    db.close().await;
    info!("Worker shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining workers");
        }
        _ = terminate => {
            info!("Received SIGTERM, draining workers");
        }
    }
}
