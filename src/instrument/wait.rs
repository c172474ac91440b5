//! Bounded polling of hardware state, with operator abort.
//!
//! Stage motion is observed by polling (`is_stationary`, `is_constant_speed`).
//! A stage that never reports the expected state must not hang the process, so
//! every wait carries a timeout and listens for an [`AbortSignal`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};

/// How often to poll and how long to wait before declaring a hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Longest total wait
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Operator-side handle that cancels an in-flight run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: watch::Sender<bool>,
}

/// Flow-side view of an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<bool>,
}

/// Create a connected abort handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (sender, receiver) = watch::channel(false);
    (AbortHandle { sender }, AbortSignal { receiver })
}

impl AbortHandle {
    /// Raise the abort signal for every connected [`AbortSignal`].
    pub fn abort(&self) {
        // send_replace never fails, even with no live receivers
        self.sender.send_replace(true);
    }
}

impl AbortSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (handle, signal) = abort_pair();
        // Dropping the sender leaves the value at `false` forever
        drop(handle);
        signal
    }

    /// Whether the run has been aborted.
    pub fn is_aborted(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the run has been aborted. Pends forever otherwise.
    pub async fn aborted(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `operation` unless the run is aborted first.
    pub async fn guard<T, F>(&self, what: &str, operation: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        if self.is_aborted() {
            return Err(DaqError::Aborted(what.to_string()));
        }
        tokio::select! {
            result = operation => result,
            _ = self.aborted() => Err(DaqError::Aborted(what.to_string())),
        }
    }
}

/// Poll `condition` until it reports true.
///
/// Returns [`DaqError::HardwareHang`] naming `condition_name` once
/// `policy.timeout` has elapsed, or [`DaqError::Aborted`] as soon as `abort`
/// is raised. Errors from the condition itself propagate unchanged.
pub async fn wait_for<F, Fut>(
    condition_name: &'static str,
    policy: WaitPolicy,
    abort: &AbortSignal,
    mut condition: F,
) -> AppResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let start = Instant::now();
    let mut polls: u64 = 0;

    loop {
        if abort.is_aborted() {
            return Err(DaqError::Aborted(format!("waiting for {}", condition_name)));
        }
        polls += 1;
        if condition().await? {
            debug!(condition = condition_name, polls, elapsed = ?start.elapsed(), "Stage state reached");
            return Ok(());
        }
        if start.elapsed() >= policy.timeout {
            warn!(condition = condition_name, timeout = ?policy.timeout, "Stage wait timed out");
            return Err(DaqError::HardwareHang {
                condition: condition_name,
                timeout: policy.timeout,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.poll_interval) => {}
            _ = abort.aborted() => {
                return Err(DaqError::Aborted(format!("waiting for {}", condition_name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(timeout_ms: u64) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        wait_for("stationary", policy(1_000), &AbortSignal::never(), || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_hardware_hang() {
        let err = wait_for("constant speed", policy(100), &AbortSignal::never(), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        match err {
            DaqError::HardwareHang { condition, timeout } => {
                assert_eq!(condition, "constant speed");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_wait() {
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            handle.abort();
        });
        let started = Instant::now();
        let err = wait_for("stationary", policy(10_000), &signal, || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_cancels_long_operation() {
        let (handle, signal) = abort_pair();
        handle.abort();
        let result: AppResult<()> = signal
            .guard("reading the DAQ", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DaqError::Aborted(_))));
    }

    #[tokio::test]
    async fn condition_errors_propagate() {
        let err = wait_for("stationary", policy(1_000), &AbortSignal::never(), || async {
            Err(anyhow::anyhow!("serial port closed"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DaqError::Hardware(_)));
    }
}
