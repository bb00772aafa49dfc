//! Terminal failure handling
//!
//! Once a job has used up its attempts (or failed permanently) the owning
//! document records are marked failed and a notification goes out. Batch
//! items that completed before the batch failed keep their results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use intellifill_persist::{DocumentStatus, DocumentStore, StatusUpdate};
use intellifill_queue::{FailureHandler, JobEntry, JobError, JobId};

use crate::payload::{JobPayload, QueueKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub job_id: JobId,
    pub kind: QueueKind,
    pub user_id: String,
    /// Document, source or batch the job was about
    pub subject_id: String,
    pub reason: String,
    pub attempts_made: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Writes failures to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: &Notification) {
        error!(
            job_id = %n.job_id,
            kind = %n.kind,
            user_id = %n.user_id,
            subject = %n.subject_id,
            attempts = n.attempts_made,
            reason = %n.reason,
            "Job failed permanently"
        );
    }
}

/// Forwards failures to an in-process consumer
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: &Notification) {
        if self.sender.send(notification.clone()).await.is_err() {
            warn!(job_id = %notification.job_id, "Notification receiver dropped");
        }
    }
}

pub struct DocumentFailureHandler {
    documents: Arc<dyn DocumentStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl DocumentFailureHandler {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    async fn mark_failed(&self, document_id: &str, user_id: &str, reason: &str) {
        if let Err(e) = self
            .documents
            .set_status(document_id, user_id, StatusUpdate::failed(reason))
            .await
        {
            warn!(document_id, error = %e, "Could not record document failure");
        }
    }

    /// Like `mark_failed`, but leaves a document that already completed alone
    async fn mark_unfinished_failed(&self, document_id: &str, user_id: &str, reason: &str) {
        match self.documents.get(document_id).await {
            Ok(Some(record)) if record.status == DocumentStatus::Completed => {
                debug!(document_id, "Batch item already completed, keeping its result");
            }
            Ok(_) => self.mark_failed(document_id, user_id, reason).await,
            Err(e) => {
                warn!(document_id, error = %e, "Could not read document before marking it failed");
                self.mark_failed(document_id, user_id, reason).await;
            }
        }
    }
}

#[async_trait]
impl FailureHandler for DocumentFailureHandler {
    async fn on_failed(&self, job: &JobEntry, failure: &JobError) {
        let payload: JobPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed job has an unreadable payload");
                return;
            }
        };
        let reason = failure.to_string();

        let (user_id, subject_id) = match &payload {
            // Knowledge sources have no document record
            JobPayload::Knowledge(k) => (&k.user_id, &k.source_id),
            JobPayload::Ocr(o) => {
                self.mark_failed(&o.document_id, &o.user_id, &reason).await;
                (&o.user_id, &o.document_id)
            }
            JobPayload::Document(d) => {
                self.mark_failed(&d.document_id, &d.user_id, &reason).await;
                (&d.user_id, &d.document_id)
            }
            JobPayload::Batch(b) => {
                for item in &b.items {
                    self.mark_unfinished_failed(&item.document_id, &b.user_id, &reason)
                        .await;
                }
                (&b.user_id, &b.batch_id)
            }
        };

        let notification = Notification {
            job_id: job.id,
            kind: payload.kind(),
            user_id: user_id.clone(),
            subject_id: subject_id.clone(),
            reason,
            attempts_made: job.attempts_made,
            at: Utc::now(),
        };
        for notifier in &self.notifiers {
            notifier.notify(&notification).await;
        }
    }
}
