//! Provider traits and common types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use intellifill_queue::{ErrorClass, JobError};

/// Errors from embedding and extraction providers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Call timed out after {0}ms")]
    Timeout(u64),
    #[error("Rate limited")]
    RateLimited,
    #[error("Provider not available")]
    NotAvailable,
    #[error("Response failed validation: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl LlmError {
    /// Retry class used by the job runner
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::RateLimited | Self::NotAvailable => {
                ErrorClass::Retryable
            }
            Self::Validation(_) | Self::InvalidRequest(_) => ErrorClass::Permanent,
            Self::RequestFailed(_) => ErrorClass::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<LlmError> for JobError {
    fn from(e: LlmError) -> Self {
        JobError::new(e.class(), e.to_string())
    }
}

/// Input to a field extraction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExtractionRequest {
    /// Plain text of the document
    pub text: String,
    /// Field names the caller is interested in, empty for "everything"
    #[serde(default)]
    pub hints: Vec<String>,
}

impl FieldExtractionRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }
}

/// Turns text into fixed-size vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Vector dimension of every embedding this provider returns
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts; the result has one vector per input, in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// Pulls structured fields out of document text
#[async_trait]
pub trait FieldExtractionProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Raw JSON response, validated by the caller
    async fn extract_fields(&self, request: &FieldExtractionRequest) -> Result<String, LlmError>;
}
