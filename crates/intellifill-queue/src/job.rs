//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ErrorClass;

/// Job Identifier
pub type JobId = Uuid;

/// Multiplier applied per retry when an exponential backoff does not name one.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 5.0;

/// Lifecycle state of a job inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Visible to workers, waiting to be claimed
    Waiting,
    /// Claimed by a worker holding a lock
    Active,
    /// Finished successfully
    Completed,
    /// Terminal failure (attempts exhausted, permanent error, or stalled too often)
    Failed,
    /// Scheduled for a future `run_at` (initial delay or retry backoff)
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "delayed" => Some(Self::Delayed),
            _ => None,
        }
    }

    /// Completed and failed jobs never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic priority levels, mapped to numeric ranks (lower rank = served first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
    Custom(u32),
}

impl Priority {
    pub fn rank(&self) -> u32 {
        match self {
            Self::High => 1,
            Self::Normal => 5,
            Self::Low => 10,
            Self::Custom(rank) => *rank,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => other
                .parse::<u32>()
                .map(Self::Custom)
                .map_err(|_| format!("unknown priority '{}'", s)),
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(5_000)
    }
}

impl BackoffStrategy {
    pub fn exponential(base_ms: u64) -> Self {
        Self::Exponential {
            base_ms,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * multiplier^retry`
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                base_ms,
                multiplier,
            } => {
                let ms = (*base_ms as f64 * multiplier.powi(retry as i32)).min(u64::MAX as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }
}

/// Per-submission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Priority,
    /// Maximum number of attempts, including the first one
    pub attempts: u32,
    pub backoff: BackoffStrategy,
    /// Overall processing timeout for a single attempt
    pub timeout: Option<Duration>,
    /// Keep the job delayed for this long before it becomes claimable
    pub delay: Option<Duration>,
    /// Claimed jobs become stalled if their lock is not renewed within this
    /// window; `None` uses the worker pool's setting
    pub lock_duration: Option<Duration>,
    /// Number of stall recoveries tolerated before the job is failed
    pub max_stalled_count: u32,
    /// Completed jobs retained per queue
    pub keep_completed: usize,
    /// Failed jobs retained per queue
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
            delay: None,
            lock_duration: None,
            max_stalled_count: 1,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = Some(lock_duration);
        self
    }

    pub fn with_retention(mut self, keep_completed: usize, keep_failed: usize) -> Self {
        self.keep_completed = keep_completed;
        self.keep_failed = keep_failed;
        self
    }
}

/// Exclusive claim held by one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: Uuid,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// A persisted job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: u32,
    /// Submission order, used to keep FIFO within a priority band
    pub seq: u64,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub timeout_ms: Option<u64>,
    /// Lock window requested at submission
    #[serde(default)]
    pub lock_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub failure_class: Option<ErrorClass>,
    pub result: Option<serde_json::Value>,
    pub lock: Option<JobLock>,
    pub stalled_count: u32,
    pub max_stalled_count: u32,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl JobEntry {
    /// Build a fresh entry from submission options
    pub fn new(
        queue: &str,
        payload: serde_json::Value,
        options: &JobOptions,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, run_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, now + to_chrono(delay)),
            _ => (JobState::Waiting, now),
        };

        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            priority: options.priority.rank(),
            seq,
            state,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff,
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            lock_duration_ms: options.lock_duration.map(|d| d.as_millis() as u64),
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            failure_class: None,
            result: None,
            lock: None,
            stalled_count: 0,
            max_stalled_count: options.max_stalled_count,
            keep_completed: options.keep_completed,
            keep_failed: options.keep_failed,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The job's own lock window, or `default` when it has none
    pub fn lock_duration_or(&self, default: Duration) -> Duration {
        self.lock_duration_ms.map_or(default, Duration::from_millis)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Wall-clock time spent in the last attempt, if it finished
    pub fn processing_time(&self) -> Option<Duration> {
        let started = self.processed_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    /// Whether `token` currently owns this job
    pub fn is_locked_by(&self, token: Uuid) -> bool {
        self.state == JobState::Active && self.lock.as_ref().is_some_and(|l| l.token == token)
    }

    pub fn status_report(&self) -> JobStatusReport {
        JobStatusReport {
            id: self.id,
            queue: self.queue.clone(),
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
            failed_reason: self.failed_reason.clone(),
            result: self.result.clone(),
        }
    }
}

/// Status view returned to callers polling a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub id: JobId,
    pub queue: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Outcome of reporting a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Re-queued as delayed; claimable again after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Moved to the terminal failed state
    Failed { attempts_made: u32 },
}

/// Outcome of recovering one stalled job
#[derive(Debug, Clone)]
pub enum StallOutcome {
    /// Lock expired, job returned to waiting
    Requeued(JobEntry),
    /// Lock expired too many times, job failed
    Failed(JobEntry),
}

/// Per-state job counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Delayed => self.delayed += n,
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ranks() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("7".parse::<Priority>().unwrap(), Priority::Custom(7));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_backoff_fixed() {
        let strategy = BackoffStrategy::Fixed { delay_ms: 500 };
        assert_eq!(strategy.delay(0), Duration::from_millis(500));
        assert_eq!(strategy.delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_exponential_default_multiplier() {
        let strategy = BackoffStrategy::exponential(5_000);
        assert_eq!(strategy.delay(0), Duration::from_millis(5_000));
        assert_eq!(strategy.delay(1), Duration::from_millis(25_000));
    }

    #[test]
    fn test_backoff_exponential_custom_multiplier() {
        let strategy = BackoffStrategy::Exponential {
            base_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(0).as_millis(), 1_000);
        assert_eq!(strategy.delay(3).as_millis(), 8_000);
    }

    #[test]
    fn test_new_entry_with_delay_is_delayed() {
        let now = Utc::now();
        let opts = JobOptions::default().with_delay(Duration::from_secs(10));
        let entry = JobEntry::new("ocr", serde_json::json!({}), &opts, 1, now);
        assert_eq!(entry.state, JobState::Delayed);
        assert!(entry.run_at > now);

        let entry = JobEntry::new("ocr", serde_json::json!({}), &JobOptions::default(), 2, now);
        assert_eq!(entry.state, JobState::Waiting);
        assert_eq!(entry.run_at, now);
    }

    #[test]
    fn test_lock_duration_falls_back_to_pool_setting() {
        let pool_default = Duration::from_secs(30);
        let entry = JobEntry::new("ocr", serde_json::json!({}), &JobOptions::default(), 1, Utc::now());
        assert_eq!(entry.lock_duration_ms, None);
        assert_eq!(entry.lock_duration_or(pool_default), pool_default);

        let opts = JobOptions::default().with_lock_duration(Duration::from_secs(120));
        let entry = JobEntry::new("ocr", serde_json::json!({}), &opts, 2, Utc::now());
        assert_eq!(entry.lock_duration_ms, Some(120_000));
        assert_eq!(entry.lock_duration_or(pool_default), Duration::from_secs(120));
    }

    #[test]
    fn test_state_round_trip_strings() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Delayed,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }
}
