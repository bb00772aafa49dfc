//! # IntelliFill Pipeline
//!
//! The processors behind the four document queues:
//!
//! - **knowledge**: extraction → chunking → embedding → storage, resumable
//!   from a checkpoint after any batch
//! - **ocr**: text and confidence for a scanned document
//! - **document**: structured field extraction plus mapping onto a form
//! - **batch**: the document flow over many items, collecting failures
//!
//! [`Runtime`] wires all four onto one backend with shared progress and
//! terminal-failure handling.

pub mod batch;
pub mod chunking;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod failure;
pub mod field_mapping;
pub mod knowledge;
pub mod memory_guard;
pub mod ocr;
pub mod payload;
pub mod runtime;

pub use batch::{BatchItemError, BatchProcessor, BatchResult};
pub use chunking::{Chunker, ChunkerConfig};
pub use config::PipelineConfig;
pub use document::{DocumentFlow, DocumentOutcome, DocumentProcessor, DocumentTarget};
pub use error::PipelineError;
pub use extract::{ExtractedText, ExtractionRequest, Extractor, PlainTextExtractor};
pub use failure::{ChannelNotifier, DocumentFailureHandler, Notification, Notifier, TracingNotifier};
pub use field_mapping::{FieldMapper, FieldMapping, FieldType, MappingConfig, MatchStrategy};
pub use knowledge::{progress_from_checkpoint, KnowledgeProcessor, KnowledgeResult};
pub use memory_guard::{MemoryGuard, MemoryGuardConfig, MemoryProbe, SysinfoProbe};
pub use ocr::{OcrProcessor, OcrResult};
pub use payload::{
    BatchItem, BatchJob, DocumentJob, FormField, JobPayload, KnowledgeJob, KnowledgeOptions,
    OcrJob, QueueKind,
};
pub use runtime::{Runtime, RuntimeBuilder};
