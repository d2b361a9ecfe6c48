//! Primary execution context
//!
//! All group 0 bootstrap state is owned by a single thread. Work that arrives
//! elsewhere (for example an inbound RPC handled by the HTTP server) is
//! submitted to that thread and awaited.

use std::future::Future;
use std::thread::{JoinHandle, ThreadId};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::info;

use crate::error::{Result, ZerothError};

/// Handle to the thread that owns the bootstrap state
#[derive(Clone, Debug)]
pub struct PrimaryContext {
    handle: Handle,
    thread: ThreadId,
}

/// Owner of a dedicated primary thread. Dropping it without [`PrimaryThread::stop`]
/// leaves the thread running until the process exits.
pub struct PrimaryThread {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl PrimaryThread {
    /// Stop the primary runtime and join its thread.
    pub fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.join
            .join()
            .map_err(|_| ZerothError::Internal("primary thread panicked".to_string()))
    }
}

impl PrimaryContext {
    /// Bind the primary context to the calling thread and its runtime.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| ZerothError::Internal(format!("no tokio runtime: {}", e)))?;
        Ok(Self {
            handle,
            thread: std::thread::current().id(),
        })
    }

    /// Start a dedicated thread running a current-thread runtime and bind the
    /// primary context to it.
    pub fn spawn_dedicated(name: &str) -> Result<(Self, PrimaryThread)> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let context = PrimaryContext {
                    handle: runtime.handle().clone(),
                    thread: std::thread::current().id(),
                };
                if ready_tx.send(Ok(context)).is_err() {
                    return;
                }
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|e| ZerothError::Internal(format!("failed to spawn primary thread: {}", e)))?;

        let context = ready_rx
            .recv()
            .map_err(|e| ZerothError::Internal(format!("primary thread exited early: {}", e)))?
            .map_err(ZerothError::Internal)?;

        info!(thread = name, "Primary execution context started");
        Ok((
            context,
            PrimaryThread {
                shutdown: shutdown_tx,
                join,
            },
        ))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Panics when called off the primary context.
    pub fn assert_current(&self, operation: &str) {
        assert!(
            self.is_current(),
            "{} must run on the primary execution context",
            operation
        );
    }

    /// Run `fut` on the primary context and wait for its result. Runs inline
    /// when already there.
    pub async fn submit<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return fut.await;
        }
        self.handle
            .spawn(fut)
            .await
            .map_err(|e| ZerothError::Internal(format!("primary context task failed: {}", e)))?
    }
}
