//! In-memory queue implementation with priority scheduling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{retry_decision, QueueBackend};
use crate::error::{ErrorClass, JobError, QueueError};
use crate::job::{
    to_chrono, FailOutcome, JobCounts, JobEntry, JobId, JobLock, JobOptions, JobState,
    StallOutcome,
};

/// Ready-heap entry - orders by priority rank, then submission order (smallest first)
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    priority: u32,
    seq: u64,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: BinaryHeap is a max-heap
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed-heap entry - orders by run_at time (earliest first)
#[derive(Debug, Clone, Eq, PartialEq)]
struct DelayedEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.run_at, other.seq).cmp(&(self.run_at, self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Lane {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, JobEntry>,
    lanes: HashMap<String, Lane>,
    next_seq: u64,
}

/// Process-local queue store.
///
/// `remove` purges the job's heap entries. Any other stale entry, one whose
/// job moved to another state after it was pushed, is skipped when popped.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn push_ready(lane: &mut Lane, job: &JobEntry) {
    lane.ready.push(ReadyEntry {
        priority: job.priority,
        seq: job.seq,
        id: job.id,
    });
}

fn push_delayed(lane: &mut Lane, job: &JobEntry) {
    lane.delayed.push(DelayedEntry {
        run_at: job.run_at,
        seq: job.seq,
        id: job.id,
    });
}

/// Drop the oldest finished ids beyond `keep`
fn trim_finished(jobs: &mut HashMap<Uuid, JobEntry>, ids: &mut VecDeque<JobId>, keep: usize) {
    while ids.len() > keep {
        if let Some(old) = ids.pop_front() {
            if jobs.get(&old).is_some_and(|j| j.state.is_terminal()) {
                jobs.remove(&old);
            }
        }
    }
}

fn owned_job<'a>(
    jobs: &'a mut HashMap<Uuid, JobEntry>,
    id: JobId,
    token: Uuid,
) -> Result<&'a mut JobEntry, QueueError> {
    let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
    if !job.is_locked_by(token) {
        return Err(QueueError::LockLost(id));
    }
    Ok(job)
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobEntry, QueueError> {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let entry = JobEntry::new(queue, payload, options, state.next_seq, Utc::now());

        let lane = state.lanes.entry(queue.to_string()).or_default();
        match entry.state {
            JobState::Delayed => push_delayed(lane, &entry),
            _ => push_ready(lane, &entry),
        }
        state.jobs.insert(entry.id, entry.clone());

        Ok(entry)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobEntry>, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;
        let Some(lane) = lanes.get_mut(queue) else {
            return Ok(None);
        };
        let now = Utc::now();

        // Promote delayed jobs that are due
        while lane.delayed.peek().is_some_and(|e| e.run_at <= now) {
            let Some(entry) = lane.delayed.pop() else {
                break;
            };
            if let Some(job) = jobs.get_mut(&entry.id) {
                if job.state == JobState::Delayed && job.run_at == entry.run_at {
                    job.state = JobState::Waiting;
                    push_ready(lane, job);
                }
            }
        }

        while let Some(entry) = lane.ready.pop() {
            let Some(job) = jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.state != JobState::Waiting {
                continue;
            }

            job.state = JobState::Active;
            job.processed_at = Some(now);
            job.finished_at = None;
            job.lock = Some(JobLock {
                token: Uuid::new_v4(),
                owner: worker_id.to_string(),
                expires_at: now + to_chrono(job.lock_duration_or(lock_duration)),
            });
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn extend_lock(
        &self,
        id: JobId,
        token: Uuid,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.is_locked_by(token) => {
                if let Some(lock) = job.lock.as_mut() {
                    lock.expires_at = Utc::now() + to_chrono(lock_duration);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: JobId, token: Uuid) -> Result<bool, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;
        let Some(job) = jobs.get_mut(&id).filter(|j| j.is_locked_by(token)) else {
            return Ok(false);
        };

        job.state = JobState::Waiting;
        job.processed_at = None;
        job.lock = None;
        push_ready(lanes.entry(job.queue.clone()).or_default(), job);
        Ok(true)
    }

    async fn complete(
        &self,
        id: JobId,
        token: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;

        let job = owned_job(jobs, id, token)?;
        job.state = JobState::Completed;
        job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
        job.finished_at = Some(Utc::now());
        job.result = Some(result);
        job.failed_reason = None;
        job.failure_class = None;
        job.lock = None;
        let keep = job.keep_completed;
        let lane = lanes.entry(job.queue.clone()).or_default();

        lane.completed.push_back(id);
        trim_finished(jobs, &mut lane.completed, keep);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        token: Uuid,
        error: &JobError,
    ) -> Result<FailOutcome, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;

        let job = owned_job(jobs, id, token)?;
        job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
        job.failed_reason = Some(error.to_string());
        job.failure_class = Some(error.class);
        job.lock = None;

        let outcome = retry_decision(job, error);
        let lane = lanes.entry(job.queue.clone()).or_default();
        match &outcome {
            FailOutcome::Retrying { delay, .. } => {
                job.state = JobState::Delayed;
                job.run_at = Utc::now() + to_chrono(*delay);
                push_delayed(lane, job);
            }
            FailOutcome::Failed { .. } => {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                let keep = job.keep_failed;
                lane.failed.push_back(id);
                trim_finished(jobs, &mut lane.failed, keep);
            }
        }

        Ok(outcome)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StallOutcome>, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;
        let lane = lanes.entry(queue.to_string()).or_default();

        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.state == JobState::Active
                    && j.lock.as_ref().is_some_and(|l| l.expires_at < now)
            })
            .map(|j| j.id)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            job.stalled_count += 1;
            job.lock = None;

            if job.stalled_count > job.max_stalled_count {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.failed_reason = Some("job stalled more than allowable limit".to_string());
                job.failure_class = Some(ErrorClass::Unknown);
                lane.failed.push_back(id);
                outcomes.push(StallOutcome::Failed(job.clone()));
            } else {
                job.state = JobState::Waiting;
                push_ready(lane, job);
                outcomes.push(StallOutcome::Requeued(job.clone()));
            }
        }

        if let Some(keep) = outcomes.iter().find_map(|o| match o {
            StallOutcome::Failed(job) => Some(job.keep_failed),
            StallOutcome::Requeued(_) => None,
        }) {
            trim_finished(jobs, &mut lane.failed, keep);
        }

        Ok(outcomes)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let state = self.state.lock().await;
        state.jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;
        match jobs.get(&id).map(|j| j.state) {
            None => Ok(false),
            Some(JobState::Waiting | JobState::Delayed) => {
                if let Some(job) = jobs.remove(&id) {
                    if let Some(lane) = lanes.get_mut(&job.queue) {
                        lane.ready.retain(|e| e.id != id);
                        lane.delayed.retain(|e| e.id != id);
                    }
                }
                Ok(true)
            }
            Some(other) => Err(QueueError::InvalidState(format!(
                "job {} is {} and cannot be removed",
                id, other
            ))),
        }
    }

    async fn promote(&self, id: JobId) -> Result<bool, QueueError> {
        let mut guard = self.state.lock().await;
        let State { jobs, lanes, .. } = &mut *guard;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(QueueError::NotFound(id));
        };
        if job.state != JobState::Delayed {
            return Ok(false);
        }

        job.state = JobState::Waiting;
        job.run_at = Utc::now();
        push_ready(lanes.entry(job.queue.clone()).or_default(), job);
        Ok(true)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values().filter(|j| j.queue == queue) {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn recent_finished(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<JobEntry>, QueueError> {
        let state = self.state.lock().await;
        let Some(lane) = state.lanes.get(queue) else {
            return Ok(Vec::new());
        };

        let mut finished: Vec<JobEntry> = lane
            .completed
            .iter()
            .chain(lane.failed.iter())
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| j.state.is_terminal())
            .cloned()
            .collect();
        finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        finished.truncate(limit);
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackoffStrategy, Priority};
    use serde_json::json;

    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_enqueue_claim() {
        let queue = MemoryQueue::new();
        let job = queue
            .enqueue("ocr", json!({ "foo": "bar" }), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);

        let claimed = queue.claim("ocr", "w1", LOCK).await.unwrap().expect("job");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Active);
        assert!(claimed.processed_at.is_some());
        assert_eq!(claimed.lock.as_ref().unwrap().owner, "w1");

        // Nothing left, and other queues are isolated
        assert!(queue.claim("ocr", "w1", LOCK).await.unwrap().is_none());
        assert!(queue.claim("batch", "w1", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::new();
        let low = queue
            .enqueue("q", json!(1), &JobOptions::default().with_priority(Priority::Low))
            .await
            .unwrap();
        let normal_a = queue.enqueue("q", json!(2), &JobOptions::default()).await.unwrap();
        let high = queue
            .enqueue("q", json!(3), &JobOptions::default().with_priority(Priority::High))
            .await
            .unwrap();
        let normal_b = queue.enqueue("q", json!(4), &JobOptions::default()).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.claim("q", "w", LOCK).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![high.id, normal_a.id, normal_b.id, low.id]);
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default().with_delay(Duration::from_millis(50));
        let job = queue.enqueue("q", json!({}), &opts).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);

        assert!(queue.claim("q", "w", LOCK).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;

        let claimed = queue.claim("q", "w", LOCK).await.unwrap().expect("delayed job");
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn test_promote_delayed() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default().with_delay(Duration::from_secs(60));
        let job = queue.enqueue("q", json!({}), &opts).await.unwrap();

        assert!(queue.promote(job.id).await.unwrap());
        assert!(!queue.promote(job.id).await.unwrap());
        let claimed = queue.claim("q", "w", LOCK).await.unwrap().expect("promoted job");
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn test_complete_requires_lock_owner() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue("q", json!({}), &JobOptions::default()).await.unwrap();
        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();

        let err = queue
            .complete(job.id, Uuid::new_v4(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LockLost(_)));

        let token = claimed.lock.unwrap().token;
        queue.complete(job.id, token, json!({ "ok": true })).await.unwrap();
        let done = queue.get_job(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts_made, 1);
        assert_eq!(done.result, Some(json!({ "ok": true })));
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_retries_then_terminal() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default()
            .with_attempts(2)
            .with_backoff(BackoffStrategy::Fixed { delay_ms: 0 });
        let job = queue.enqueue("q", json!({}), &opts).await.unwrap();

        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        let outcome = queue
            .fail(job.id, claimed.lock.unwrap().token, &JobError::retryable("flaky"))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(queue.get_job(job.id).await.unwrap().state, JobState::Delayed);

        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        let outcome = queue
            .fail(job.id, claimed.lock.unwrap().token, &JobError::retryable("flaky"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 2 });

        let failed = queue.get_job(job.id).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts_made, failed.max_attempts);
        assert_eq!(failed.failed_reason.as_deref(), Some("flaky"));
        assert!(queue.claim("q", "w", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stall_recovery() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue("q", json!({}), &JobOptions::default()).await.unwrap();
        queue
            .claim("q", "crashed", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let outcomes = queue.recover_stalled("q", later).await.unwrap();
        assert!(matches!(outcomes.as_slice(), [StallOutcome::Requeued(_)]));

        // Second stall exceeds the default limit of one
        let claimed = queue
            .claim("q", "crashed-again", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        let later = Utc::now() + chrono::Duration::seconds(1);
        let outcomes = queue.recover_stalled("q", later).await.unwrap();
        assert!(matches!(outcomes.as_slice(), [StallOutcome::Failed(_)]));
        assert_eq!(queue.get_job(job.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_live_lock_not_stalled() {
        let queue = MemoryQueue::new();
        queue.enqueue("q", json!({}), &JobOptions::default()).await.unwrap();
        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        assert!(queue
            .extend_lock(claimed.id, claimed.lock.unwrap().token, LOCK)
            .await
            .unwrap());
        assert!(queue.recover_stalled("q", Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_waiting_but_not_active() {
        let queue = MemoryQueue::new();
        let waiting = queue.enqueue("q", json!(1), &JobOptions::default()).await.unwrap();
        assert!(queue.remove(waiting.id).await.unwrap());
        assert!(queue.claim("q", "w", LOCK).await.unwrap().is_none());

        let job = queue.enqueue("q", json!(2), &JobOptions::default()).await.unwrap();
        queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        assert!(matches!(
            queue.remove(job.id).await,
            Err(QueueError::InvalidState(_))
        ));
        assert!(!queue.remove(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_purges_heap_entries() {
        let queue = MemoryQueue::new();
        let waiting = queue.enqueue("q", json!(1), &JobOptions::default()).await.unwrap();
        let delayed = queue
            .enqueue("q", json!(2), &JobOptions::default().with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        let kept = queue.enqueue("q", json!(3), &JobOptions::default()).await.unwrap();

        assert!(queue.remove(waiting.id).await.unwrap());
        assert!(queue.remove(delayed.id).await.unwrap());
        {
            let state = queue.state.lock().await;
            let lane = &state.lanes["q"];
            assert_eq!(lane.ready.len(), 1);
            assert!(lane.delayed.is_empty());
        }

        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, kept.id);
    }

    #[tokio::test]
    async fn test_release_returns_job_without_spending_attempt() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue("q", json!({}), &JobOptions::default()).await.unwrap();
        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        let token = claimed.lock.unwrap().token;

        assert!(!queue.release(job.id, Uuid::new_v4()).await.unwrap());
        assert!(queue.release(job.id, token).await.unwrap());
        assert!(!queue.release(job.id, token).await.unwrap());

        let released = queue.get_job(job.id).await.unwrap();
        assert_eq!(released.state, JobState::Waiting);
        assert_eq!(released.attempts_made, 0);
        assert!(released.lock.is_none());
        assert!(released.processed_at.is_none());

        let again = queue.claim("q", "w2", LOCK).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
    }

    #[tokio::test]
    async fn test_job_lock_duration_overrides_pool_setting() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default().with_lock_duration(Duration::from_secs(600));
        queue.enqueue("q", json!({}), &opts).await.unwrap();

        let before = Utc::now();
        let claimed = queue.claim("q", "w", LOCK).await.unwrap().unwrap();
        let expires_at = claimed.lock.unwrap().expires_at;
        assert!(expires_at >= before + chrono::Duration::seconds(600));

        // Still owned long after the pool's 30s window would have lapsed
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(queue.recover_stalled("q", later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_keeps_last_completed() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default().with_retention(2, 2);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(queue.enqueue("q", json!(i), &opts).await.unwrap().id);
        }
        while let Some(job) = queue.claim("q", "w", LOCK).await.unwrap() {
            queue
                .complete(job.id, job.lock.unwrap().token, json!(null))
                .await
                .unwrap();
        }

        let counts = queue.counts("q").await.unwrap();
        assert_eq!(counts.completed, 2);
        assert!(queue.get_job(ids[0]).await.is_err());
        assert!(queue.get_job(ids[3]).await.is_ok());
        assert_eq!(queue.recent_finished("q", 10).await.unwrap().len(), 2);
    }
}
