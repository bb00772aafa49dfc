//! Named queue handle

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{JobCounts, JobId, JobOptions, JobStatusReport};
use crate::metrics::{HealthThresholds, QueueHealth, QueueMetrics};

/// Finished jobs sampled by [`Queue::health`]
pub const DEFAULT_METRICS_WINDOW: usize = 100;

/// A named queue on a shared backend.
///
/// Cheap to clone; every clone talks to the same store.
#[derive(Clone)]
pub struct Queue {
    name: String,
    backend: Arc<dyn QueueBackend>,
    defaults: JobOptions,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            defaults: JobOptions::default(),
        }
    }

    /// Options used by [`Queue::submit_default`]
    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    /// Serialize `payload` and persist it as a new job
    pub async fn submit<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let entry = self.backend.enqueue(&self.name, payload, &options).await?;

        info!(
            job_id = %entry.id,
            queue = %self.name,
            priority = entry.priority,
            state = %entry.state,
            "job submitted"
        );

        Ok(JobHandle {
            id: entry.id,
            queue: self.clone(),
        })
    }

    pub async fn submit_default<T: Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> Result<JobHandle, QueueError> {
        self.submit(payload, self.defaults.clone()).await
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusReport, QueueError> {
        Ok(self.backend.get_job(id).await?.status_report())
    }

    /// Remove a job that is still waiting or delayed
    pub async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let removed = self.backend.remove(id).await?;
        if removed {
            info!(job_id = %id, queue = %self.name, "job removed");
        }
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.backend.counts(&self.name).await
    }

    /// Counts plus averages over the last `window` finished jobs
    pub async fn metrics(&self, window: usize) -> Result<QueueMetrics, QueueError> {
        let counts = self.backend.counts(&self.name).await?;
        let recent = self.backend.recent_finished(&self.name, window).await?;
        Ok(QueueMetrics::from_recent(&self.name, counts, &recent))
    }

    pub async fn health(&self, thresholds: &HealthThresholds) -> Result<QueueHealth, QueueError> {
        Ok(self.metrics(DEFAULT_METRICS_WINDOW).await?.health(thresholds))
    }
}

/// Handle to a submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    queue: Queue,
}

impl JobHandle {
    pub async fn status(&self) -> Result<JobStatusReport, QueueError> {
        self.queue.status(self.id).await
    }

    pub async fn remove(&self) -> Result<bool, QueueError> {
        self.queue.remove(self.id).await
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses
    pub async fn wait(
        &self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<JobStatusReport, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.status().await?;
            if report.state.is_terminal() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QueueError::InvalidState(format!(
                    "job {} still {} after {:?}",
                    self.id, report.state, timeout
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
