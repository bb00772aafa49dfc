//! OCR jobs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use intellifill_persist::{DocumentStore, StatusUpdate};
use intellifill_queue::{JobContext, JobError, ProcessingStage, Processor};

use crate::error::staged;
use crate::extract::{ExtractionRequest, Extractor};
use crate::payload::{JobPayload, OcrJob, QueueKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub document_id: String,
    pub text_length: usize,
    pub page_count: u32,
    pub confidence: f64,
}

pub struct OcrProcessor {
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn Extractor>,
}

impl OcrProcessor {
    pub fn new(documents: Arc<dyn DocumentStore>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            documents,
            extractor,
        }
    }

    async fn run(&self, ctx: &JobContext, job: &OcrJob) -> Result<OcrResult, JobError> {
        self.documents
            .set_status(&job.document_id, &job.user_id, StatusUpdate::processing())
            .await
            .map_err(staged("status"))?;
        ctx.progress
            .report(ProcessingStage::Extraction, 10, "Running OCR")
            .await;

        let request = ExtractionRequest::new(&job.file_path, &job.mime_type)
            .with_language(job.language.clone());
        let extracted = self
            .extractor
            .extract(&request)
            .await
            .map_err(staged("extraction"))?;

        let result = OcrResult {
            document_id: job.document_id.clone(),
            text_length: extracted.text.chars().count(),
            page_count: extracted.page_count,
            confidence: extracted.confidence,
        };
        let value = serde_json::to_value(&result)?;
        self.documents
            .set_status(&job.document_id, &job.user_id, StatusUpdate::completed(value))
            .await
            .map_err(staged("status"))?;
        ctx.progress
            .report(ProcessingStage::Completed, 100, "OCR complete")
            .await;

        info!(
            document_id = %job.document_id,
            pages = result.page_count,
            chars = result.text_length,
            "OCR complete"
        );
        Ok(result)
    }
}

#[async_trait]
impl Processor for OcrProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let job = match ctx.payload::<JobPayload>()? {
            JobPayload::Ocr(job) => job,
            other => return Err(other.misrouted(QueueKind::Ocr)),
        };
        let result = self.run(&ctx, &job).await?;
        Ok(serde_json::to_value(result)?)
    }
}
