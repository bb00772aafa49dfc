//! Queue errors and failure classification

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors raised by the queue store or the worker machinery
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Job not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Lock lost for job {0}")]
    LockLost(Uuid),
    #[error("Queue is shutting down")]
    ShuttingDown,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Connectivity problems are worth reconnecting for; everything else is surfaced
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Backend(_))
    }
}

/// Retry classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: network, timeout, rate limit
    Retryable,
    /// Validation, schema or business-rule violation
    Permanent,
    /// Not classified; retried like `Retryable`
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retryable" => Some(Self::Retryable),
            "permanent" => Some(Self::Permanent),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Failure reported by a processor for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
    /// Pipeline stage the failure happened in, if any
    pub stage: Option<String>,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            stage: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retryable, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, message)
    }

    /// Tag the error with the stage it surfaced from; the first tag wins
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage.into());
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "[{}] {}", stage, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for JobError {}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Serialization(_) | QueueError::InvalidState(_) => {
                JobError::permanent(e.to_string())
            }
            _ => JobError::retryable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::permanent(format!("payload error: {}", e))
    }
}
