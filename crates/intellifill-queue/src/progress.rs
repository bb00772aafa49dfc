//! Progress reporting for running jobs
//!
//! Processors publish [`ProgressEvent`]s through a [`ProgressReporter`]
//! bound to their job. The [`ProgressHub`] fans events out to any number of
//! subscribers and remembers the latest event per job, so a client that
//! reconnects can catch up without replaying the stream. Events of finished
//! jobs are kept for the most recent [`DEFAULT_KEEP_FINISHED`] jobs only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::job::JobId;

/// Stage of a document moving through processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Queued,
    Extraction,
    Chunking,
    Embedding,
    Storage,
    Completed,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Extraction => "extraction",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storage => "storage",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "extraction" => Some(Self::Extraction),
            "chunking" => Some(Self::Chunking),
            "embedding" => Some(Self::Embedding),
            "storage" => Some(Self::Storage),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub queue: String,
    pub stage: ProcessingStage,
    /// 0-100, never decreasing within a job
    pub percentage: u8,
    pub step: String,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        job_id: JobId,
        queue: impl Into<String>,
        stage: ProcessingStage,
        percentage: u8,
        step: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            stage,
            percentage: percentage.min(100),
            step: step.into(),
            processed: None,
            total: None,
            at: Utc::now(),
        }
    }

    pub fn with_counts(mut self, processed: u64, total: u64) -> Self {
        self.processed = Some(processed);
        self.total = Some(total);
        self
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
pub const DEFAULT_KEEP_FINISHED: usize = 1000;

#[derive(Debug, Default)]
struct LatestEvents {
    events: HashMap<JobId, ProgressEvent>,
    /// Finished jobs, oldest first
    finished: VecDeque<JobId>,
}

/// Fan-out point for progress events
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
    latest: Arc<RwLock<LatestEvents>>,
    keep_finished: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            latest: Arc::new(RwLock::new(LatestEvents::default())),
            keep_finished: DEFAULT_KEEP_FINISHED,
        }
    }

    /// How many finished jobs keep their last event
    pub fn with_retention(mut self, keep_finished: usize) -> Self {
        self.keep_finished = keep_finished;
        self
    }

    /// Record and broadcast an event, clamping its percentage so it never
    /// goes below the job's previous value. Returns the event as published.
    pub async fn publish(&self, mut event: ProgressEvent) -> ProgressEvent {
        {
            let mut latest = self.latest.write().await;
            if let Some(prev) = latest.events.get(&event.job_id) {
                event.percentage = event.percentage.max(prev.percentage);
            }
            event.percentage = event.percentage.min(100);
            latest.events.insert(event.job_id, event.clone());
        }

        // No receivers is fine; the latest map still serves late joiners
        let _ = self.sender.send(event.clone());
        event
    }

    /// Subscribe to every job's events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to one job's events
    pub fn subscribe_job(&self, job_id: JobId) -> JobSubscription {
        JobSubscription {
            job_id,
            rx: self.sender.subscribe(),
        }
    }

    /// Most recent event for a job
    pub async fn latest(&self, job_id: JobId) -> Option<ProgressEvent> {
        self.latest.read().await.events.get(&job_id).cloned()
    }

    /// Mark a job as done for good. Its last event stays readable until
    /// `keep_finished` newer jobs have finished.
    pub async fn finish(&self, job_id: JobId) {
        let mut latest = self.latest.write().await;
        if !latest.events.contains_key(&job_id) || latest.finished.contains(&job_id) {
            return;
        }
        latest.finished.push_back(job_id);
        while latest.finished.len() > self.keep_finished {
            if let Some(old) = latest.finished.pop_front() {
                latest.events.remove(&old);
            }
        }
    }

    /// Forget a job's cached event
    pub async fn clear(&self, job_id: JobId) {
        let mut latest = self.latest.write().await;
        latest.events.remove(&job_id);
        latest.finished.retain(|id| *id != job_id);
    }

    pub fn reporter(&self, job_id: JobId, queue: impl Into<String>) -> ProgressReporter {
        ProgressReporter {
            hub: self.clone(),
            job_id,
            queue: queue.into(),
        }
    }
}

/// Receiver filtered to a single job
#[derive(Debug)]
pub struct JobSubscription {
    job_id: JobId,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl JobSubscription {
    /// Next event for this job; `None` once the hub is gone.
    /// Lagged receivers skip ahead rather than fail.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.job_id == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "progress subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Progress handle given to a processor for its current job
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    hub: ProgressHub,
    job_id: JobId,
    queue: String,
}

impl ProgressReporter {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn report(
        &self,
        stage: ProcessingStage,
        percentage: u8,
        step: impl Into<String>,
    ) -> ProgressEvent {
        let event = ProgressEvent::new(self.job_id, self.queue.clone(), stage, percentage, step);
        self.hub.publish(event).await
    }

    pub async fn report_counts(
        &self,
        stage: ProcessingStage,
        percentage: u8,
        step: impl Into<String>,
        processed: u64,
        total: u64,
    ) -> ProgressEvent {
        let event = ProgressEvent::new(self.job_id, self.queue.clone(), stage, percentage, step)
            .with_counts(processed, total);
        self.hub.publish(event).await
    }

    /// Publish a prebuilt event (e.g. one rebuilt from a checkpoint)
    pub async fn publish(&self, event: ProgressEvent) -> ProgressEvent {
        self.hub.publish(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_percentage_never_decreases() {
        let hub = ProgressHub::default();
        let reporter = hub.reporter(Uuid::new_v4(), "knowledge");

        reporter.report(ProcessingStage::Embedding, 60, "batch 2").await;
        let event = reporter.report(ProcessingStage::Embedding, 40, "late").await;
        assert_eq!(event.percentage, 60);

        let event = reporter.report(ProcessingStage::Completed, 150, "done").await;
        assert_eq!(event.percentage, 100);
    }

    #[tokio::test]
    async fn test_latest_and_job_subscription() {
        let hub = ProgressHub::default();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let mut sub = hub.subscribe_job(job_b);

        hub.reporter(job_a, "ocr")
            .report(ProcessingStage::Extraction, 10, "a")
            .await;
        hub.reporter(job_b, "ocr")
            .report_counts(ProcessingStage::Extraction, 20, "b", 1, 4)
            .await;

        let event = sub.recv().await.expect("event for job b");
        assert_eq!(event.job_id, job_b);
        assert_eq!(event.processed, Some(1));

        assert_eq!(hub.latest(job_a).await.unwrap().percentage, 10);
        hub.clear(job_a).await;
        assert!(hub.latest(job_a).await.is_none());
    }

    #[tokio::test]
    async fn test_finished_jobs_evicted_oldest_first() {
        let hub = ProgressHub::default().with_retention(2);
        let running = Uuid::new_v4();
        hub.reporter(running, "ocr")
            .report(ProcessingStage::Extraction, 30, "page 1")
            .await;

        let done: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &done {
            hub.reporter(*id, "ocr")
                .report(ProcessingStage::Completed, 100, "done")
                .await;
            hub.finish(*id).await;
        }
        // Finishing twice does not push anything else out
        hub.finish(done[2]).await;

        assert!(hub.latest(done[0]).await.is_none());
        assert!(hub.latest(done[1]).await.is_some());
        assert!(hub.latest(done[2]).await.is_some());
        assert_eq!(hub.latest(running).await.unwrap().percentage, 30);
        assert_eq!(hub.latest.read().await.events.len(), 3);
    }
}
