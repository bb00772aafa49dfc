//! Queue Backend Trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{JobError, QueueError};
use crate::job::{FailOutcome, JobCounts, JobEntry, JobId, JobOptions, StallOutcome};

/// Durable job store shared by every worker process.
///
/// Implementations must make `claim` atomic: two concurrent callers never
/// receive the same job. All lock-guarded transitions (`extend_lock`,
/// `complete`, `fail`) take the lock token handed out by `claim` and reject
/// callers that no longer own the job.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new job; it becomes visible immediately unless delayed
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobEntry, QueueError>;

    /// Claim the most urgent ready job of `queue`
    ///
    /// Due delayed jobs are promoted first. Ordering is priority rank
    /// ascending, then submission order. The lock lasts for the job's own
    /// lock duration when it was submitted with one, else `lock_duration`.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobEntry>, QueueError>;

    /// Renew the lock for `lock_duration`; `false` means the token no longer owns the job
    async fn extend_lock(
        &self,
        id: JobId,
        token: Uuid,
        lock_duration: Duration,
    ) -> Result<bool, QueueError>;

    /// Hand a claimed job back to waiting without spending an attempt.
    ///
    /// Used when a claim lands after the worker started draining. `false`
    /// means the token no longer owns the job.
    async fn release(&self, id: JobId, token: Uuid) -> Result<bool, QueueError>;

    /// Report success for the attempt owned by `token`
    async fn complete(
        &self,
        id: JobId,
        token: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Report failure for the attempt owned by `token` and apply the retry policy
    async fn fail(&self, id: JobId, token: Uuid, error: &JobError)
        -> Result<FailOutcome, QueueError>;

    /// Requeue or fail active jobs whose lock expired before `now`
    async fn recover_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StallOutcome>, QueueError>;

    /// Fetch a job record
    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Remove a job that has not been claimed yet
    ///
    /// Returns `Ok(false)` when the job is unknown. Active and finished jobs
    /// cannot be removed and yield `QueueError::InvalidState`.
    async fn remove(&self, id: JobId) -> Result<bool, QueueError>;

    /// Make a delayed job claimable now; `false` if it is not delayed
    async fn promote(&self, id: JobId) -> Result<bool, QueueError>;

    /// Per-state counts for `queue`
    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    /// Most recently finished (completed or failed) jobs, newest first
    async fn recent_finished(&self, queue: &str, limit: usize)
        -> Result<Vec<JobEntry>, QueueError>;
}

/// Decide the retry outcome for a failed attempt.
///
/// Shared by every backend so the policy stays identical across stores.
/// `attempts_made` is the count *after* the failed attempt was recorded.
pub fn retry_decision(entry: &JobEntry, error: &JobError) -> FailOutcome {
    if error.is_retryable() && entry.attempts_made < entry.max_attempts {
        FailOutcome::Retrying {
            attempt: entry.attempts_made,
            delay: entry.backoff.delay(entry.attempts_made.saturating_sub(1)),
        }
    } else {
        FailOutcome::Failed {
            attempts_made: entry.attempts_made,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackoffStrategy, JobOptions};

    fn entry_with(attempts_made: u32, max_attempts: u32) -> JobEntry {
        let opts = JobOptions::default()
            .with_attempts(max_attempts)
            .with_backoff(BackoffStrategy::exponential(5_000));
        let mut entry = JobEntry::new("q", serde_json::json!({}), &opts, 0, Utc::now());
        entry.attempts_made = attempts_made;
        entry
    }

    #[test]
    fn test_retry_decision_schedules_backoff() {
        let outcome = retry_decision(&entry_with(1, 3), &JobError::retryable("x"));
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(5_000)
            }
        );

        let outcome = retry_decision(&entry_with(2, 3), &JobError::retryable("x"));
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_millis(25_000)
            }
        );
    }

    #[test]
    fn test_retry_decision_terminal_when_exhausted() {
        let outcome = retry_decision(&entry_with(3, 3), &JobError::retryable("x"));
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 3 });
    }

    #[test]
    fn test_permanent_error_never_retried() {
        let outcome = retry_decision(&entry_with(1, 5), &JobError::permanent("bad schema"));
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });
    }
}
