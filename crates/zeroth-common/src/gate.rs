//! Shutdown gate and abortable waits
//!
//! A [`Gate`] lets long-running operations register themselves so that
//! teardown can wait for all of them to drain. Once closing has begun no new
//! holder can enter.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::error::{Result, ZerothError};

/// Shutdown barrier built on a task tracker
#[derive(Clone, Default)]
pub struct Gate {
    tracker: TaskTracker,
}

/// Proof that an operation is inside the gate. Dropping it leaves the gate.
#[derive(Debug)]
pub struct GateHolder {
    _token: TaskTrackerToken,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Enter the gate. Fails once [`Gate::close`] has been called.
    pub fn hold(&self) -> Result<GateHolder> {
        if self.tracker.is_closed() {
            return Err(ZerothError::GateClosed);
        }
        Ok(GateHolder {
            _token: self.tracker.token(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Number of holders currently inside the gate
    pub fn holders(&self) -> usize {
        self.tracker.len()
    }

    /// Refuse new holders and wait until every current holder has left.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Sleep for `duration`, failing early with [`ZerothError::Aborted`] if the
/// token is cancelled.
pub async fn sleep_abortable(duration: Duration, abort: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = abort.cancelled() => Err(ZerothError::Aborted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Await `fut` unless the token is cancelled first.
pub async fn abortable<F, T>(fut: F, abort: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = abort.cancelled() => Err(ZerothError::Aborted),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_rejects_after_close() {
        let gate = Gate::new();
        let holder = gate.hold().unwrap();
        assert_eq!(gate.holders(), 1);
        drop(holder);

        gate.close().await;
        assert!(gate.is_closed());
        assert!(matches!(gate.hold(), Err(ZerothError::GateClosed)));
    }

    #[tokio::test]
    async fn test_gate_close_waits_for_holders() {
        let gate = Gate::new();
        let holder = gate.hold().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert!(gate.is_closed());

        drop(holder);
        tokio::time::timeout(Duration::from_secs(1), closer)
            .await
            .expect("close should finish once the holder leaves")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_abortable() {
        let token = CancellationToken::new();
        assert!(
            sleep_abortable(Duration::from_millis(5), &token)
                .await
                .is_ok()
        );

        token.cancel();
        let result = sleep_abortable(Duration::from_secs(60), &token).await;
        assert!(matches!(result, Err(ZerothError::Aborted)));
    }

    #[tokio::test]
    async fn test_abortable_passes_result_through() {
        let token = CancellationToken::new();
        let value = abortable(async { Ok(7) }, &token).await.unwrap();
        assert_eq!(value, 7);

        token.cancel();
        let result = abortable(std::future::pending::<Result<()>>(), &token).await;
        assert!(matches!(result, Err(ZerothError::Aborted)));
    }
}
