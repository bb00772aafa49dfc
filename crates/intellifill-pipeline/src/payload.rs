//! Job payloads and queue kinds
//!
//! Every queue carries one variant of [`JobPayload`]. Processors decode the
//! payload and match on it exhaustively; a variant that belongs to another
//! queue is rejected as a permanent failure.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use intellifill_queue::{BackoffStrategy, JobError, JobOptions, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Knowledge(KnowledgeJob),
    Ocr(OcrJob),
    Document(DocumentJob),
    Batch(BatchJob),
}

impl JobPayload {
    pub fn kind(&self) -> QueueKind {
        match self {
            Self::Knowledge(_) => QueueKind::Knowledge,
            Self::Ocr(_) => QueueKind::Ocr,
            Self::Document(_) => QueueKind::Document,
            Self::Batch(_) => QueueKind::Batch,
        }
    }

    /// Permanent error for a payload delivered to the wrong processor
    pub(crate) fn misrouted(&self, expected: QueueKind) -> JobError {
        JobError::permanent(format!(
            "{} payload delivered to the {} queue",
            self.kind(),
            expected
        ))
    }
}

/// Ingest a knowledge source into the chunk store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeJob {
    pub source_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub file_path: String,
    pub mime_type: String,
    #[serde(default)]
    pub options: KnowledgeOptions,
}

/// Per-source overrides of the pipeline defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeOptions {
    pub max_chunk_chars: Option<usize>,
    pub overlap_chars: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrJob {
    pub document_id: String,
    pub user_id: String,
    pub file_path: String,
    pub mime_type: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Target field of a form being filled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub document_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub file_path: String,
    pub mime_type: String,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub document_id: String,
    pub file_path: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: String,
    pub user_id: String,
    pub items: Vec<BatchItem>,
}

/// The four processing queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Knowledge,
    Ocr,
    Document,
    Batch,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [Self::Knowledge, Self::Ocr, Self::Document, Self::Batch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge",
            Self::Ocr => "ocr",
            Self::Document => "document",
            Self::Batch => "batch",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == value || k.queue_name() == value)
    }

    /// Queue name in the store
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge-processing",
            Self::Ocr => "ocr-processing",
            Self::Document => "document-processing",
            Self::Batch => "batch-processing",
        }
    }

    /// Default submission options for this queue
    pub fn default_options(&self) -> JobOptions {
        let base = JobOptions::default()
            .with_attempts(3)
            .with_backoff(BackoffStrategy::exponential(5_000));
        match self {
            Self::Knowledge => base.with_timeout(Duration::from_secs(10 * 60)),
            Self::Ocr => base.with_timeout(Duration::from_secs(5 * 60)),
            Self::Document => base.with_timeout(Duration::from_secs(2 * 60)),
            Self::Batch => base
                .with_attempts(2)
                .with_timeout(Duration::from_secs(30 * 60)),
        }
    }

    /// Default worker settings for this queue
    pub fn worker_config(&self) -> WorkerConfig {
        let concurrency = match self {
            Self::Knowledge => 2,
            Self::Ocr => 3,
            Self::Document => 5,
            Self::Batch => 1,
        };
        WorkerConfig::default().with_concurrency(concurrency)
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
