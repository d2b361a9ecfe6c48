//! Graceful shutdown handling for the Zeroth server
//!
//! A termination signal cancels the node's abort token; every long wait in
//! the process observes that token.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
    Ok(())
}

/// Cancel `abort` on the first termination signal
pub fn cancel_on_signal(abort: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_shutdown_signal() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signals: {}", e);
                }
                abort.cancel();
            }
            _ = abort.cancelled() => {}
        }
    })
}

/// Run a future until it completes or `abort` is cancelled
pub async fn run_with_shutdown<F, T>(future: F, abort: &CancellationToken) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = abort.cancelled() => {
            warn!("Shutdown signal received, cancelling operation");
            None
        }
    }
}
