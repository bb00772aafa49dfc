//! # IntelliFill Persistence
//!
//! SQLite storage for the processing core, with in-memory counterparts for
//! tests and single-process runs.
//!
//! - `SqliteQueueBackend`: durable queue with atomic claims
//! - `CheckpointStore`: per-source resume state
//! - `ChunkStore`: embedded chunks, deduplicated by content hash
//! - `DocumentStore`: document processing status

pub mod checkpoint;
pub mod chunk_store;
pub mod document_store;
pub mod error;
pub mod queue;
pub mod sqlite;

pub use checkpoint::{
    Checkpoint, CheckpointArtifacts, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore,
};
pub use chunk_store::{
    content_hash, cosine_similarity, estimate_tokens, Chunk, ChunkRecord, ChunkStore,
    InsertReport, MemoryChunkStore, ScoredChunk, SqliteChunkStore,
};
pub use document_store::{
    DocumentRecord, DocumentStatus, DocumentStore, MemoryDocumentStore, SqliteDocumentStore,
    StatusUpdate,
};
pub use error::StorageError;
pub use queue::SqliteQueueBackend;
pub use sqlite::{Database, SqliteConfig};
