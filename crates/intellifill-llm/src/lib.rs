//! # IntelliFill LLM
//!
//! Model-facing side of document processing.
//!
//! - [`CallGate`]: FIFO semaphore with a per-call timeout in front of every
//!   external call
//! - [`EmbeddingProvider`] / [`FieldExtractionProvider`]: provider seams
//! - [`LlmError`]: provider failures, classified for the retry policy
//! - Response validation and deterministic mock providers
//!
//! ```rust
//! use intellifill_llm::{CallGate, EmbeddingProvider, MockEmbedder};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let gate = CallGate::default();
//! let embedder = MockEmbedder::new(8);
//! let texts = vec!["hello".to_string()];
//! let vectors = gate.call(embedder.embed_batch(&texts)).await.unwrap();
//! assert_eq!(vectors[0].len(), 8);
//! # }
//! ```

pub mod config;
pub mod gate;
pub mod mock;
pub mod provider;
pub mod validation;

pub use config::{ConfigError, LlmConfig};
pub use gate::{CallGate, GateConfig, GateStats};
pub use mock::{MockEmbedder, MockFieldExtractor};
pub use provider::{EmbeddingProvider, FieldExtractionProvider, FieldExtractionRequest, LlmError};
pub use validation::{parse_validated, ExtractedField, ExtractedFields, ValidateResponse};
