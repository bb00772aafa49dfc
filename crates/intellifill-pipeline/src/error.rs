//! Processor-internal errors

use thiserror::Error;

use intellifill_llm::LlmError;
use intellifill_persist::StorageError;
use intellifill_queue::{JobError, QueueError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Document contains no text")]
    EmptyDocument,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Memory pressure: {used_mb}MB resident, limit {limit_mb}MB")]
    MemoryPressure { used_mb: u64, limit_mb: u64 },
    #[error("Job cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<PipelineError> for JobError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::UnsupportedType(_)
            | PipelineError::FileNotFound(_)
            | PipelineError::EmptyDocument
            | PipelineError::InvalidPayload(_) => JobError::permanent(e.to_string()),
            PipelineError::Io(_) | PipelineError::MemoryPressure { .. } | PipelineError::Cancelled => {
                JobError::retryable(e.to_string())
            }
            PipelineError::Storage(inner) => inner.into(),
            PipelineError::Llm(inner) => inner.into(),
            PipelineError::Queue(inner) => inner.into(),
        }
    }
}

/// Convert into a `JobError` tagged with the stage it came from
pub(crate) fn staged<E: Into<PipelineError>>(stage: &str) -> impl Fn(E) -> JobError + '_ {
    move |e| {
        let e: PipelineError = e.into();
        JobError::from(e).with_stage(stage)
    }
}
