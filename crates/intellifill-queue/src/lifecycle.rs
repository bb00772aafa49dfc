//! Graceful shutdown: running -> draining -> stopped

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Claiming and processing jobs
    Running,
    /// No new claims; in-flight jobs are finishing
    Draining,
    /// Closed
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// What happened during one pool's shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub queue: String,
    /// Jobs that finished while the pool was draining
    pub drained: u64,
    /// Jobs still running at the deadline, cancelled without reporting
    pub abandoned: usize,
    pub elapsed: Duration,
}

impl WorkerPool {
    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Stop claiming, wait up to `drain_timeout` for in-flight jobs, then close.
    ///
    /// A claim already sent to the store is waited for too; if it returns a
    /// job, the dispatch loop hands that job back to waiting.
    ///
    /// Jobs still running at the deadline are cancelled without touching the
    /// store; their locks lapse and stall recovery hands them to another
    /// worker. Calling this on a stopped pool is a no-op.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        let start = Instant::now();
        let queue = self.queue().name().to_string();

        if self.state() == LifecycleState::Stopped {
            return ShutdownReport {
                queue,
                drained: 0,
                abandoned: 0,
                elapsed: Duration::ZERO,
            };
        }

        self.state_tx.send_replace(LifecycleState::Draining);
        let finished_before = self.runner.finished.load(Ordering::SeqCst);
        info!(
            queue = %queue,
            active = self.active_jobs(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "Draining worker pool"
        );

        let deadline = start + drain_timeout;
        let poll = self.config().drain_poll_interval.max(Duration::from_millis(1));
        loop {
            if self.active_jobs() == 0 && self.pending_claims() == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }

        let abandoned = self.active_jobs();
        if abandoned > 0 {
            warn!(
                queue = %queue,
                abandoned,
                "Drain timeout reached, abandoning in-flight jobs"
            );
            self.runner.hard_stop.cancel();
        }

        let drained = self
            .runner
            .finished
            .load(Ordering::SeqCst)
            .saturating_sub(finished_before);
        self.state_tx.send_replace(LifecycleState::Stopped);

        let report = ShutdownReport {
            queue,
            drained,
            abandoned,
            elapsed: start.elapsed(),
        };
        info!(
            queue = %report.queue,
            drained = report.drained,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Worker pool stopped"
        );
        report
    }
}

/// Shut down every pool concurrently with the same drain timeout
pub async fn shutdown_all(pools: &[Arc<WorkerPool>], drain_timeout: Duration) -> Vec<ShutdownReport> {
    join_all(pools.iter().map(|pool| pool.shutdown(drain_timeout))).await
}
