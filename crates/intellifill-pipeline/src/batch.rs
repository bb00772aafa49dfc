//! Batch jobs: the document flow over many items
//!
//! An item that fails is recorded and marked failed; the rest of the batch
//! carries on and the job itself completes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use intellifill_persist::StatusUpdate;
use intellifill_queue::{JobContext, JobError, ProcessingStage, Processor};

use crate::document::{DocumentFlow, DocumentTarget};
use crate::payload::{BatchJob, JobPayload, QueueKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub document_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub success: bool,
    pub processed: usize,
    pub succeeded: usize,
    pub errors: Vec<BatchItemError>,
}

pub struct BatchProcessor {
    flow: Arc<DocumentFlow>,
}

impl BatchProcessor {
    pub fn new(flow: Arc<DocumentFlow>) -> Self {
        Self { flow }
    }

    pub async fn run(&self, ctx: &JobContext, job: &BatchJob) -> Result<BatchResult, JobError> {
        let total = job.items.len();
        let mut errors = Vec::new();

        for (i, item) in job.items.iter().enumerate() {
            ctx.ensure_active()?;

            let outcome = self
                .flow
                .run(DocumentTarget {
                    document_id: &item.document_id,
                    user_id: &job.user_id,
                    file_path: &item.file_path,
                    mime_type: &item.mime_type,
                    form_fields: &[],
                })
                .await;

            if let Err(e) = outcome {
                warn!(
                    batch_id = %job.batch_id,
                    document_id = %item.document_id,
                    error = %e,
                    "Batch item failed"
                );
                if let Err(store_err) = self
                    .flow
                    .documents()
                    .set_status(&item.document_id, &job.user_id, StatusUpdate::failed(e.to_string()))
                    .await
                {
                    warn!(document_id = %item.document_id, error = %store_err, "Could not mark item failed");
                }
                errors.push(BatchItemError {
                    document_id: item.document_id.clone(),
                    error: e.to_string(),
                });
            }

            let done = i + 1;
            ctx.progress
                .report_counts(
                    ProcessingStage::Extraction,
                    (100 * done / total) as u8,
                    format!("Processed {}/{} documents", done, total),
                    done as u64,
                    total as u64,
                )
                .await;
        }

        let result = BatchResult {
            batch_id: job.batch_id.clone(),
            success: errors.is_empty(),
            processed: total,
            succeeded: total - errors.len(),
            errors,
        };
        ctx.progress
            .report(ProcessingStage::Completed, 100, "Batch complete")
            .await;
        info!(
            batch_id = %job.batch_id,
            processed = result.processed,
            succeeded = result.succeeded,
            "Batch complete"
        );
        Ok(result)
    }
}

#[async_trait]
impl Processor for BatchProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let job = match ctx.payload::<JobPayload>()? {
            JobPayload::Batch(job) => job,
            other => return Err(other.misrouted(QueueKind::Batch)),
        };
        let result = self.run(&ctx, &job).await?;
        Ok(serde_json::to_value(result)?)
    }
}
