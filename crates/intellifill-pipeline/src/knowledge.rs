//! Resumable knowledge ingestion
//!
//! A knowledge job moves a source through extraction, chunking, embedding
//! and storage. The checkpoint is written after every stage and after every
//! embedding or storage batch, so a retried attempt (or a new job for the
//! same source) skips whatever an earlier attempt already finished.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use intellifill_llm::{CallGate, EmbeddingProvider, LlmError};
use intellifill_persist::{Checkpoint, CheckpointStore, Chunk, ChunkRecord, ChunkStore};
use intellifill_queue::{JobContext, JobError, JobId, ProcessingStage, ProgressEvent, Processor};

use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::error::{staged, PipelineError};
use crate::extract::{ExtractionRequest, Extractor, PlainTextExtractor};
use crate::memory_guard::MemoryGuard;
use crate::payload::{JobPayload, KnowledgeJob, QueueKind};

const EXTRACTION_DONE: u8 = 20;
const CHUNKING_DONE: u8 = 30;
const EMBEDDING_SPAN: usize = 55;
const EMBEDDING_DONE: u8 = 85;
const STORAGE_SPAN: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub source_id: String,
    pub total_chunks: u32,
    /// Chunks inserted by this attempt's storage batches
    pub stored: usize,
    pub duplicates_skipped: usize,
    /// Stage of the checkpoint this attempt started from, if any
    pub resumed_from: Option<ProcessingStage>,
}

fn proportion(base: u8, span: usize, done: usize, total: usize) -> u8 {
    if total == 0 {
        return base + span as u8;
    }
    base + (span * done.min(total) / total) as u8
}

/// Progress event describing where a checkpoint left off
pub fn progress_from_checkpoint(job_id: JobId, queue: &str, checkpoint: &Checkpoint) -> ProgressEvent {
    let total = checkpoint.total_chunks.unwrap_or(0) as usize;
    let (percentage, step, done) = match checkpoint.stage {
        ProcessingStage::Queued | ProcessingStage::Extraction => (0, "Resuming extraction".to_string(), None),
        ProcessingStage::Chunking => (EXTRACTION_DONE, "Resuming chunking".to_string(), None),
        ProcessingStage::Embedding => {
            let done = checkpoint.next_chunk_to_embed() as usize;
            (
                proportion(CHUNKING_DONE, EMBEDDING_SPAN, done, total),
                format!("Resuming embedding at chunk {}", done),
                Some(done),
            )
        }
        ProcessingStage::Storage => {
            let done = checkpoint.next_chunk_to_store() as usize;
            (
                proportion(EMBEDDING_DONE, STORAGE_SPAN, done, total),
                format!("Resuming storage at chunk {}", done),
                Some(done),
            )
        }
        ProcessingStage::Completed => (100, "Completed".to_string(), None),
    };

    let event = ProgressEvent::new(job_id, queue, checkpoint.stage, percentage, step);
    match (done, checkpoint.total_chunks) {
        (Some(done), Some(total)) => event.with_counts(done as u64, total as u64),
        _ => event,
    }
}

pub struct KnowledgeProcessor {
    checkpoints: Arc<dyn CheckpointStore>,
    chunks: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    gate: CallGate,
    extractor: Arc<dyn Extractor>,
    memory: MemoryGuard,
    config: PipelineConfig,
}

impl KnowledgeProcessor {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        chunks: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        gate: CallGate,
    ) -> Self {
        let config = PipelineConfig::default();
        Self {
            checkpoints,
            chunks,
            embedder,
            gate,
            extractor: Arc::new(PlainTextExtractor),
            memory: MemoryGuard::default(),
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_memory_guard(mut self, memory: MemoryGuard) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    async fn save(&self, checkpoint: &mut Checkpoint, stage: &str) -> Result<(), JobError> {
        checkpoint.touch();
        self.checkpoints.save(checkpoint).await.map_err(staged(stage))
    }

    pub async fn ingest(&self, ctx: &JobContext, job: &KnowledgeJob) -> Result<KnowledgeResult, JobError> {
        let job_id = ctx.job.id;
        let existing = self
            .checkpoints
            .load(&job.source_id)
            .await
            .map_err(staged("checkpoint"))?;
        let resumed_from = existing.as_ref().map(|c| c.stage);

        let mut checkpoint = match existing {
            Some(mut checkpoint) => {
                info!(
                    job_id = %job_id,
                    source_id = %job.source_id,
                    stage = %checkpoint.stage,
                    next_chunk = checkpoint.next_chunk_to_embed(),
                    "Resuming from checkpoint"
                );
                ctx.progress
                    .publish(progress_from_checkpoint(job_id, &ctx.job.queue, &checkpoint))
                    .await;
                checkpoint.job_id = job_id;
                checkpoint
            }
            None => Checkpoint::new(&job.source_id, job_id),
        };

        // Extraction
        if checkpoint.artifacts.extracted_text.is_none() {
            ctx.progress
                .report(ProcessingStage::Extraction, 0, "Extracting text")
                .await;
            let request = ExtractionRequest::new(&job.file_path, &job.mime_type);
            let extracted = self
                .extractor
                .extract(&request)
                .await
                .map_err(staged("extraction"))?;
            if extracted.text.trim().is_empty() {
                return Err(staged("extraction")(PipelineError::EmptyDocument));
            }

            checkpoint.artifacts.page_count = Some(extracted.page_count);
            checkpoint.artifacts.extracted_text = Some(extracted.text);
            checkpoint.stage = ProcessingStage::Chunking;
            self.save(&mut checkpoint, "extraction").await?;
            ctx.progress
                .report(ProcessingStage::Extraction, EXTRACTION_DONE, "Text extracted")
                .await;
        }

        // Chunking
        if checkpoint.artifacts.chunks.is_none() {
            let mut chunking = self.config.chunking;
            if let Some(max_chars) = job.options.max_chunk_chars {
                chunking.max_chars = max_chars;
            }
            if let Some(overlap_chars) = job.options.overlap_chars {
                chunking.overlap_chars = overlap_chars;
            }

            let text = checkpoint.artifacts.extracted_text.as_deref().unwrap_or_default();
            let chunks = Chunker::new(chunking).chunk(text);
            if chunks.is_empty() {
                return Err(staged("chunking")(PipelineError::EmptyDocument));
            }

            let count = chunks.len();
            checkpoint.total_chunks = Some(count as u32);
            checkpoint.artifacts.chunks = Some(chunks);
            checkpoint.stage = ProcessingStage::Embedding;
            self.save(&mut checkpoint, "chunking").await?;
            ctx.progress
                .report(
                    ProcessingStage::Chunking,
                    CHUNKING_DONE,
                    format!("Split into {} chunks", count),
                )
                .await;
        }

        let chunks: Vec<Chunk> = checkpoint.artifacts.chunks.clone().unwrap_or_default();
        let total = chunks.len();

        self.embed(ctx, &mut checkpoint, &chunks).await?;
        let (stored, duplicates_skipped) = self.store(ctx, job, &mut checkpoint, &chunks).await?;

        self.checkpoints
            .delete(&job.source_id)
            .await
            .map_err(staged("completion"))?;
        ctx.progress
            .report_counts(
                ProcessingStage::Completed,
                100,
                "Knowledge source ingested",
                total as u64,
                total as u64,
            )
            .await;
        info!(
            job_id = %job_id,
            source_id = %job.source_id,
            chunks = total,
            stored,
            duplicates = duplicates_skipped,
            "Knowledge source ingested"
        );

        Ok(KnowledgeResult {
            source_id: job.source_id.clone(),
            total_chunks: total as u32,
            stored,
            duplicates_skipped,
            resumed_from,
        })
    }

    async fn embed(
        &self,
        ctx: &JobContext,
        checkpoint: &mut Checkpoint,
        chunks: &[Chunk],
    ) -> Result<(), JobError> {
        let total = chunks.len();

        // Embeddings and the recorded position must agree; keep the shorter
        let recorded = checkpoint.next_chunk_to_embed() as usize;
        let kept = recorded.min(checkpoint.artifacts.embeddings.len()).min(total);
        if kept != recorded || kept != checkpoint.artifacts.embeddings.len() {
            warn!(
                source_id = %checkpoint.source_id,
                recorded,
                embeddings = checkpoint.artifacts.embeddings.len(),
                kept,
                "Checkpoint embeddings out of step, truncating"
            );
            checkpoint.artifacts.embeddings.truncate(kept);
            checkpoint.last_completed_chunk = kept.checked_sub(1).map(|c| c as u32);
        }

        let batch_size = self.config.embedding_batch_size.max(1);
        let mut start = kept;
        while start < total {
            ctx.ensure_active().map_err(|e| e.with_stage("embedding"))?;
            self.memory.check().await.map_err(staged("embedding"))?;

            let end = (start + batch_size).min(total);
            let texts: Vec<String> = chunks[start..end].iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .gate
                .call(self.embedder.embed_batch(&texts))
                .await
                .map_err(staged("embedding"))?;
            if vectors.len() != texts.len() {
                return Err(staged("embedding")(LlmError::Validation(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                ))));
            }

            checkpoint.artifacts.embeddings.extend(vectors);
            checkpoint.last_completed_chunk = Some(end as u32 - 1);
            checkpoint.stage = ProcessingStage::Embedding;
            self.save(checkpoint, "embedding").await?;

            debug!(source_id = %checkpoint.source_id, start, end, total, "Embedded batch");
            ctx.progress
                .report_counts(
                    ProcessingStage::Embedding,
                    proportion(CHUNKING_DONE, EMBEDDING_SPAN, end, total),
                    format!("Embedded {}/{} chunks", end, total),
                    end as u64,
                    total as u64,
                )
                .await;
            tokio::task::yield_now().await;
            start = end;
        }

        if checkpoint.stage < ProcessingStage::Storage {
            checkpoint.stage = ProcessingStage::Storage;
            self.save(checkpoint, "embedding").await?;
        }
        Ok(())
    }

    async fn store(
        &self,
        ctx: &JobContext,
        job: &KnowledgeJob,
        checkpoint: &mut Checkpoint,
        chunks: &[Chunk],
    ) -> Result<(usize, usize), JobError> {
        let total = chunks.len();
        let batch_size = self.config.storage_batch_size.max(1);
        let mut start = checkpoint.next_chunk_to_store() as usize;
        let (mut stored, mut duplicates) = (0, 0);

        while start < total {
            ctx.ensure_active().map_err(|e| e.with_stage("storage"))?;

            let end = (start + batch_size).min(total);
            let records: Vec<ChunkRecord> = chunks[start..end]
                .iter()
                .zip(&checkpoint.artifacts.embeddings[start..end])
                .map(|(chunk, embedding)| {
                    ChunkRecord::from_chunk(&job.source_id, &job.organization_id, chunk, embedding.clone())
                })
                .collect();
            let report = self
                .chunks
                .insert_batch(&records)
                .await
                .map_err(staged("storage"))?;
            stored += report.inserted;
            duplicates += report.duplicates;

            checkpoint.last_stored_chunk = Some(end as u32 - 1);
            self.save(checkpoint, "storage").await?;

            debug!(
                source_id = %job.source_id,
                inserted = report.inserted,
                duplicates = report.duplicates,
                "Stored batch"
            );
            ctx.progress
                .report_counts(
                    ProcessingStage::Storage,
                    proportion(EMBEDDING_DONE, STORAGE_SPAN, end, total),
                    format!("Stored {}/{} chunks", end, total),
                    end as u64,
                    total as u64,
                )
                .await;
            start = end;
        }
        Ok((stored, duplicates))
    }
}

#[async_trait]
impl Processor for KnowledgeProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let job = match ctx.payload::<JobPayload>()? {
            JobPayload::Knowledge(job) => job,
            other => return Err(other.misrouted(QueueKind::Knowledge)),
        };
        let result = self.ingest(&ctx, &job).await?;
        Ok(serde_json::to_value(result)?)
    }
}
