//! Worker Pool for processing jobs

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, QueueError};
use crate::job::{FailOutcome, JobEntry, StallOutcome};
use crate::lifecycle::LifecycleState;
use crate::limiter::{ClaimLimiter, RateLimit};
use crate::progress::{ProgressHub, ProgressReporter};
use crate::queue::Queue;

/// Work performed for each claimed job of one queue
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Hook run once a job reaches the terminal failed state
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failed(&self, job: &JobEntry, error: &JobError);
}

/// Everything a processor gets for one attempt
pub struct JobContext {
    pub job: JobEntry,
    pub progress: ProgressReporter,
    /// Fires on job timeout, lock loss, or a forced shutdown
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Decode the job payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Return a retryable error if the attempt was cancelled
    pub fn ensure_active(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::retryable("job cancelled"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lock_duration: Duration,
    pub lock_renew_interval: Duration,
    pub stalled_check_interval: Duration,
    pub rate_limit: Option<RateLimit>,
    pub drain_poll_interval: Duration,
    /// Consecutive store failures tolerated before `run` gives up
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            lock_duration: Duration::from_secs(30),
            lock_renew_interval: Duration::from_secs(15),
            stalled_check_interval: Duration::from_secs(30),
            rate_limit: None,
            drain_poll_interval: Duration::from_millis(100),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Lock window, renewed at half its length
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self.lock_renew_interval = lock_duration / 2;
        self
    }
}

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Shared state cloned into every job task
#[derive(Clone)]
pub(crate) struct JobRunner {
    pub(crate) queue: Queue,
    processor: Arc<dyn Processor>,
    failure_handlers: Arc<Vec<Arc<dyn FailureHandler>>>,
    progress: ProgressHub,
    config: WorkerConfig,
    worker_id: String,
    /// Cancels every running attempt without reporting back to the store
    pub(crate) hard_stop: CancellationToken,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) finished: Arc<AtomicU64>,
    /// Claims sent to the store whose job is not yet running or handed back
    pub(crate) claiming: Arc<AtomicUsize>,
}

/// Counts a claim from the moment it is sent until its job is owned elsewhere
struct ClaimGuard(Arc<AtomicUsize>);

impl ClaimGuard {
    fn new(claiming: Arc<AtomicUsize>) -> Self {
        claiming.fetch_add(1, Ordering::SeqCst);
        Self(claiming)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the active counter when a job task ends, however it ends
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    finished: Arc<AtomicU64>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>, finished: Arc<AtomicU64>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active, finished }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    pub(crate) runner: JobRunner,
    pub(crate) state_tx: watch::Sender<LifecycleState>,
}

impl WorkerPool {
    pub fn new(queue: Queue, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        let worker_id = format!("{}-{}", queue.name(), Uuid::new_v4());
        let (state_tx, _) = watch::channel(LifecycleState::Running);

        Self {
            runner: JobRunner {
                queue,
                processor,
                failure_handlers: Arc::new(Vec::new()),
                progress: ProgressHub::default(),
                config,
                worker_id,
                hard_stop: CancellationToken::new(),
                active: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicU64::new(0)),
                claiming: Arc::new(AtomicUsize::new(0)),
            },
            state_tx,
        }
    }

    /// Publish progress through a shared hub instead of a private one
    pub fn with_progress(mut self, hub: ProgressHub) -> Self {
        self.runner.progress = hub;
        self
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        Arc::make_mut(&mut self.runner.failure_handlers).push(handler);
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.runner.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.runner.config
    }

    pub fn worker_id(&self) -> &str {
        &self.runner.worker_id
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.runner.progress
    }

    /// Jobs currently being processed by this pool
    pub fn active_jobs(&self) -> usize {
        self.runner.active.load(Ordering::SeqCst)
    }

    /// Claims in flight against the store
    pub(crate) fn pending_claims(&self) -> usize {
        self.runner.claiming.load(Ordering::SeqCst)
    }

    /// Dispatch loop.
    ///
    /// Claims jobs while the pool is running, bounded by `concurrency` and
    /// the optional claim rate limit, and runs stall recovery on its own
    /// interval. Returns once the pool starts draining, or with
    /// `QueueError::Connection` when the store stays unreachable.
    pub async fn run(&self) -> Result<(), QueueError> {
        let config = &self.runner.config;
        let queue_name = self.runner.queue.name().to_string();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let limiter = config.rate_limit.map(ClaimLimiter::new);
        let mut state_rx = self.state_tx.subscribe();
        let mut stall_tick = tokio::time::interval(config.stalled_check_interval);
        stall_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut store_failures = 0u32;

        info!(
            queue = %queue_name,
            worker_id = %self.runner.worker_id,
            concurrency = config.concurrency,
            "Worker pool started"
        );

        loop {
            if *state_rx.borrow_and_update() != LifecycleState::Running {
                break;
            }

            tokio::select! {
                biased;
                _ = state_rx.changed() => continue,
                _ = stall_tick.tick() => {
                    let result = self.runner.recover_stalled().await;
                    self.handle_store_result(result, &mut store_failures, &mut state_rx).await?;
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };

                    if let Some(limiter) = &limiter {
                        tokio::select! {
                            _ = limiter.wait_ready() => {}
                            _ = state_rx.changed() => continue,
                        }
                    }
                    // Counted before the state check so shutdown cannot miss it
                    let claim_guard = ClaimGuard::new(self.runner.claiming.clone());
                    if *state_rx.borrow() != LifecycleState::Running {
                        break;
                    }

                    let claimed = self
                        .runner
                        .queue
                        .backend()
                        .claim(&queue_name, &self.runner.worker_id, config.lock_duration)
                        .await;
                    match claimed {
                        Ok(Some(job)) if *state_rx.borrow() != LifecycleState::Running => {
                            self.hand_back(&job).await;
                            break;
                        }
                        Ok(Some(job)) => {
                            store_failures = 0;
                            if let Some(limiter) = &limiter {
                                limiter.record().await;
                            }
                            self.spawn_job(job, permit);
                            drop(claim_guard);
                        }
                        Ok(None) => {
                            store_failures = 0;
                            drop(claim_guard);
                            drop(permit);
                            tokio::select! {
                                _ = tokio::time::sleep(config.poll_interval) => {}
                                _ = state_rx.changed() => {}
                            }
                        }
                        Err(e) => {
                            drop(claim_guard);
                            drop(permit);
                            self.handle_store_result(Err(e), &mut store_failures, &mut state_rx)
                                .await?;
                        }
                    }
                }
            }
        }

        info!(queue = %queue_name, "Worker pool stopped claiming");
        Ok(())
    }

    /// Return a job claimed after draining began, leaving its attempts untouched
    async fn hand_back(&self, job: &JobEntry) {
        let Some(token) = job.lock.as_ref().map(|l| l.token) else {
            return;
        };
        match self.runner.queue.backend().release(job.id, token).await {
            Ok(true) => {
                info!(job_id = %job.id, queue = %job.queue, "Claim landed during drain, job handed back")
            }
            Ok(false) => {
                warn!(job_id = %job.id, queue = %job.queue, "Claimed job lock moved before hand back")
            }
            Err(e) => {
                // The lock lapses and stall recovery picks the job up again
                warn!(job_id = %job.id, queue = %job.queue, error = %e, "Could not hand back claimed job")
            }
        }
    }

    fn spawn_job(&self, job: JobEntry, permit: OwnedSemaphorePermit) {
        let guard = ActiveGuard::new(self.runner.active.clone(), self.runner.finished.clone());
        let runner = self.runner.clone();

        tokio::spawn(async move {
            runner.run_job(job).await;
            drop(guard);
            drop(permit);
        });
    }

    /// Reset on success; on failure back off exponentially and give up after
    /// `max_reconnect_attempts` consecutive errors
    async fn handle_store_result(
        &self,
        result: Result<(), QueueError>,
        failures: &mut u32,
        state_rx: &mut watch::Receiver<LifecycleState>,
    ) -> Result<(), QueueError> {
        let err = match result {
            Ok(()) => {
                *failures = 0;
                return Ok(());
            }
            Err(e) => e,
        };

        *failures += 1;
        let config = &self.runner.config;
        if *failures > config.max_reconnect_attempts {
            error!(
                queue = %self.runner.queue.name(),
                attempts = *failures,
                error = %err,
                "Queue store unreachable, giving up"
            );
            return Err(QueueError::Connection(format!(
                "store unavailable after {} attempts: {}",
                failures, err
            )));
        }

        let delay = config
            .reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(*failures - 1))
            .min(MAX_RECONNECT_DELAY);
        warn!(
            queue = %self.runner.queue.name(),
            attempt = *failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Queue store error, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = state_rx.changed() => {}
        }
        Ok(())
    }
}

impl JobRunner {
    async fn run_job(&self, job: JobEntry) {
        let Some(token) = job.lock.as_ref().map(|l| l.token) else {
            warn!(job_id = %job.id, "Claimed job carries no lock, skipping");
            return;
        };
        let queue_name = self.queue.name().to_string();
        let cancel = self.hard_stop.child_token();
        let lock_lost = Arc::new(AtomicBool::new(false));

        info!(
            job_id = %job.id,
            queue = %queue_name,
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            self.clone(),
            job.id,
            token,
            job.lock_duration_or(self.config.lock_duration),
            cancel.clone(),
            heartbeat_stop.clone(),
            lock_lost.clone(),
        ));

        let ctx = JobContext {
            job: job.clone(),
            progress: self.progress.reporter(job.id, queue_name.clone()),
            cancel: cancel.clone(),
        };
        let work = self.processor.process(ctx);
        let timeout = job.timeout();

        let outcome = tokio::select! {
            biased;
            result = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => {
                            cancel.cancel();
                            Err(JobError::retryable(format!(
                                "job timed out after {}ms",
                                limit.as_millis()
                            )))
                        }
                    },
                    None => work.await,
                }
            } => Some(result),
            _ = cancel.cancelled() => None,
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let Some(result) = outcome else {
            if lock_lost.load(Ordering::SeqCst) {
                warn!(job_id = %job.id, queue = %queue_name, "Lock lost, attempt result discarded");
            } else {
                warn!(job_id = %job.id, queue = %queue_name, "Job abandoned by forced shutdown");
            }
            return;
        };

        let backend = self.queue.backend();
        match result {
            Ok(value) => match backend.complete(job.id, token, value).await {
                Ok(()) => {
                    info!(job_id = %job.id, queue = %queue_name, "Job completed");
                    self.progress.finish(job.id).await;
                }
                Err(QueueError::LockLost(_)) => {
                    warn!(job_id = %job.id, queue = %queue_name, "Lock lost before completion")
                }
                Err(e) => {
                    error!(job_id = %job.id, queue = %queue_name, error = %e, "Failed to record completion")
                }
            },
            Err(job_error) => match backend.fail(job.id, token, &job_error).await {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    info!(
                        job_id = %job.id,
                        queue = %queue_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        class = job_error.class.as_str(),
                        error = %job_error,
                        "Job failed, scheduling retry with backoff"
                    );
                }
                Ok(FailOutcome::Failed { attempts_made }) => {
                    error!(
                        job_id = %job.id,
                        queue = %queue_name,
                        attempts_made,
                        class = job_error.class.as_str(),
                        error = %job_error,
                        "Job failed permanently"
                    );
                    self.progress.finish(job.id).await;
                    let entry = backend.get_job(job.id).await.unwrap_or(job);
                    self.notify_failed(&entry, &job_error).await;
                }
                Err(QueueError::LockLost(_)) => {
                    warn!(job_id = %job.id, queue = %queue_name, "Lock lost before failure was recorded")
                }
                Err(e) => {
                    error!(job_id = %job.id, queue = %queue_name, error = %e, "Failed to record failure")
                }
            },
        }
    }

    pub(crate) async fn recover_stalled(&self) -> Result<(), QueueError> {
        let outcomes = self
            .queue
            .backend()
            .recover_stalled(self.queue.name(), Utc::now())
            .await?;

        for outcome in outcomes {
            match outcome {
                StallOutcome::Requeued(job) => {
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        stalled_count = job.stalled_count,
                        "Stalled job returned to waiting"
                    );
                }
                StallOutcome::Failed(job) => {
                    let reason = job
                        .failed_reason
                        .clone()
                        .unwrap_or_else(|| "job stalled".to_string());
                    error!(job_id = %job.id, queue = %job.queue, reason = %reason, "Stalled job failed");
                    self.progress.finish(job.id).await;
                    self.notify_failed(&job, &JobError::unknown(reason)).await;
                }
            }
        }
        Ok(())
    }

    async fn notify_failed(&self, job: &JobEntry, error: &JobError) {
        for handler in self.failure_handlers.iter() {
            handler.on_failed(job, error).await;
        }
    }
}

/// Renew the job lock until stopped; cancel the attempt if ownership is lost
async fn heartbeat(
    runner: JobRunner,
    job_id: Uuid,
    token: Uuid,
    lock_duration: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
    lock_lost: Arc<AtomicBool>,
) {
    let backend = runner.queue.backend();
    let renew_every = runner
        .config
        .lock_renew_interval
        .min(lock_duration / 2)
        .max(Duration::from_millis(1));

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(renew_every) => {}
        }

        match backend.extend_lock(job_id, token, lock_duration).await {
            Ok(true) => debug!(job_id = %job_id, "Lock renewed"),
            Ok(false) => {
                warn!(job_id = %job_id, worker_id = %runner.worker_id, "Job lock lost");
                lock_lost.store(true, Ordering::SeqCst);
                cancel.cancel();
                return;
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Lock renewal failed"),
        }
    }
}
