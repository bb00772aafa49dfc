//! # IntelliFill Queue
//!
//! Durable background job processing for document ingestion.
//!
//! Features:
//! - Named queues over a pluggable `QueueBackend` (memory here, SQLite in
//!   `intellifill-persist`)
//! - Priority then FIFO ordering, delayed jobs, retention limits
//! - Worker pool with concurrency control, lock renewal and stall recovery
//! - Retry with classified errors and exponential backoff
//! - Progress broadcasting, metrics and health
//! - Graceful drain on shutdown

pub mod backend;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod worker;

pub use backend::{retry_decision, QueueBackend};
pub use error::{ErrorClass, JobError, QueueError};
pub use job::{
    BackoffStrategy, FailOutcome, JobCounts, JobEntry, JobId, JobLock, JobOptions, JobState,
    JobStatusReport, Priority, StallOutcome,
};
pub use lifecycle::{shutdown_all, LifecycleState, ShutdownReport};
pub use limiter::{ClaimLimiter, RateLimit};
pub use memory::MemoryQueue;
pub use metrics::{HealthThresholds, QueueHealth, QueueMetrics};
pub use progress::{ProcessingStage, ProgressEvent, ProgressHub, ProgressReporter};
pub use queue::{JobHandle, Queue};
pub use worker::{FailureHandler, JobContext, Processor, WorkerConfig, WorkerPool};
