//! Wiring the four queues to their processors
//!
//! [`Runtime`] owns one [`Queue`] and one [`WorkerPool`] per [`QueueKind`],
//! all on the same backend, progress hub and failure handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use intellifill_llm::{CallGate, EmbeddingProvider, FieldExtractionProvider, MockEmbedder, MockFieldExtractor};
use intellifill_persist::{
    CheckpointStore, ChunkStore, Database, DocumentStore, MemoryCheckpointStore, MemoryChunkStore,
    MemoryDocumentStore, SqliteCheckpointStore, SqliteChunkStore, SqliteDocumentStore,
    SqliteQueueBackend,
};
use intellifill_queue::{
    shutdown_all, JobHandle, JobId, JobOptions, JobStatusReport, MemoryQueue, ProgressHub, Processor, Queue, QueueBackend,
    QueueError, ShutdownReport, WorkerConfig, WorkerPool,
};

use crate::batch::BatchProcessor;
use crate::config::PipelineConfig;
use crate::document::{DocumentFlow, DocumentProcessor};
use crate::extract::{Extractor, PlainTextExtractor};
use crate::failure::{DocumentFailureHandler, Notifier, TracingNotifier};
use crate::field_mapping::FieldMapper;
use crate::knowledge::KnowledgeProcessor;
use crate::memory_guard::{MemoryGuard, SysinfoProbe};
use crate::ocr::OcrProcessor;
use crate::payload::{JobPayload, QueueKind};

pub struct RuntimeBuilder {
    backend: Arc<dyn QueueBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
    chunks: Arc<dyn ChunkStore>,
    documents: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    field_extractor: Arc<dyn FieldExtractionProvider>,
    extractor: Arc<dyn Extractor>,
    gate: CallGate,
    config: PipelineConfig,
    memory: Option<MemoryGuard>,
    workers: HashMap<QueueKind, WorkerConfig>,
    notifiers: Vec<Arc<dyn Notifier>>,
    progress: ProgressHub,
}

impl RuntimeBuilder {
    /// In-memory stores and mock providers on the given backend
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            chunks: Arc::new(MemoryChunkStore::new()),
            documents: Arc::new(MemoryDocumentStore::new()),
            embedder: Arc::new(MockEmbedder::default()),
            field_extractor: Arc::new(MockFieldExtractor::new()),
            extractor: Arc::new(PlainTextExtractor),
            gate: CallGate::default(),
            config: PipelineConfig::default(),
            memory: None,
            workers: HashMap::new(),
            notifiers: vec![Arc::new(TracingNotifier)],
            progress: ProgressHub::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryQueue::new()))
    }

    /// SQLite queue and stores sharing one pool
    pub fn sqlite(db: &Database) -> Self {
        let pool = db.pool().clone();
        Self::new(Arc::new(SqliteQueueBackend::new(pool.clone()))).with_stores(
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(SqliteChunkStore::new(pool.clone())),
            Arc::new(SqliteDocumentStore::new(pool)),
        )
    }

    pub fn with_stores(
        mut self,
        checkpoints: Arc<dyn CheckpointStore>,
        chunks: Arc<dyn ChunkStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        self.checkpoints = checkpoints;
        self.chunks = chunks;
        self.documents = documents;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_field_extractor(mut self, provider: Arc<dyn FieldExtractionProvider>) -> Self {
        self.field_extractor = provider;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_gate(mut self, gate: CallGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_memory_guard(mut self, memory: MemoryGuard) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override the default worker settings of one queue
    pub fn with_worker_config(mut self, kind: QueueKind, config: WorkerConfig) -> Self {
        self.workers.insert(kind, config);
        self
    }

    /// Replace the default log notifier set
    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn with_progress(mut self, progress: ProgressHub) -> Self {
        self.progress = progress;
        self
    }

    pub fn build(self) -> Runtime {
        let memory = self.memory.unwrap_or_else(|| {
            MemoryGuard::new(
                Box::new(SysinfoProbe::default()),
                self.config.memory.clone(),
            )
        });
        let knowledge = KnowledgeProcessor::new(
            self.checkpoints.clone(),
            self.chunks.clone(),
            self.embedder.clone(),
            self.gate.clone(),
        )
        .with_extractor(self.extractor.clone())
        .with_memory_guard(memory)
        .with_config(self.config.clone());

        let flow = Arc::new(
            DocumentFlow::new(
                self.documents.clone(),
                self.extractor.clone(),
                self.field_extractor.clone(),
                self.gate.clone(),
            )
            .with_mapper(FieldMapper::new(self.config.mapping.clone())),
        );

        let failure_handler = self
            .notifiers
            .into_iter()
            .fold(DocumentFailureHandler::new(self.documents.clone()), |h, n| {
                h.with_notifier(n)
            });
        let failure_handler = Arc::new(failure_handler);

        let mut processors: HashMap<QueueKind, Arc<dyn Processor>> = HashMap::new();
        processors.insert(QueueKind::Knowledge, Arc::new(knowledge));
        processors.insert(
            QueueKind::Ocr,
            Arc::new(OcrProcessor::new(self.documents.clone(), self.extractor.clone())),
        );
        processors.insert(QueueKind::Document, Arc::new(DocumentProcessor::new(flow.clone())));
        processors.insert(QueueKind::Batch, Arc::new(BatchProcessor::new(flow)));

        let mut queues = HashMap::new();
        let mut pools = Vec::new();
        for kind in QueueKind::ALL {
            let queue = Queue::new(kind.queue_name(), self.backend.clone())
                .with_defaults(kind.default_options());
            let Some(processor) = processors.remove(&kind) else {
                continue;
            };
            let worker_config = self
                .workers
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| kind.worker_config());
            let pool = WorkerPool::new(queue.clone(), processor, worker_config)
                .with_progress(self.progress.clone())
                .with_failure_handler(failure_handler.clone());
            queues.insert(kind, queue);
            pools.push(Arc::new(pool));
        }

        Runtime {
            backend: self.backend,
            queues,
            pools,
            progress: self.progress,
            gate: self.gate,
            documents: self.documents,
            chunks: self.chunks,
            checkpoints: self.checkpoints,
        }
    }
}

/// All queues and their worker pools
pub struct Runtime {
    backend: Arc<dyn QueueBackend>,
    queues: HashMap<QueueKind, Queue>,
    pools: Vec<Arc<WorkerPool>>,
    progress: ProgressHub,
    gate: CallGate,
    documents: Arc<dyn DocumentStore>,
    chunks: Arc<dyn ChunkStore>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl Runtime {
    pub fn builder(backend: Arc<dyn QueueBackend>) -> RuntimeBuilder {
        RuntimeBuilder::new(backend)
    }

    pub fn queue(&self, kind: QueueKind) -> Result<&Queue, QueueError> {
        self.queues
            .get(&kind)
            .ok_or_else(|| QueueError::InvalidState(format!("no queue for {}", kind)))
    }

    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    pub fn gate(&self) -> &CallGate {
        &self.gate
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn chunks(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Route a payload to its queue, with that queue's defaults unless
    /// `options` is given
    pub async fn submit(
        &self,
        payload: &JobPayload,
        options: Option<JobOptions>,
    ) -> Result<JobHandle, QueueError> {
        let queue = self.queue(payload.kind())?;
        match options {
            Some(options) => queue.submit(payload, options).await,
            None => queue.submit_default(payload).await,
        }
    }

    /// Status of a job on any queue
    pub async fn status(&self, id: JobId) -> Result<JobStatusReport, QueueError> {
        Ok(self.backend.get_job(id).await?.status_report())
    }

    /// Remove a waiting or delayed job from whichever queue holds it
    pub async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let job = self.backend.get_job(id).await?;
        match QueueKind::parse(&job.queue).and_then(|kind| self.queues.get(&kind)) {
            Some(queue) => queue.remove(id).await,
            None => self.backend.remove(id).await,
        }
    }

    /// Spawn every pool's dispatch loop
    pub fn start(&self) -> Vec<JoinHandle<Result<(), QueueError>>> {
        self.pools
            .iter()
            .map(|pool| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let result = pool.run().await;
                    if let Err(e) = &result {
                        error!(queue = %pool.queue().name(), error = %e, "Worker pool stopped");
                    }
                    result
                })
            })
            .collect()
    }

    /// Drain every pool concurrently
    pub async fn shutdown(&self, drain_timeout: Duration) -> Vec<ShutdownReport> {
        info!(pools = self.pools.len(), timeout_ms = drain_timeout.as_millis() as u64, "Shutting down workers");
        shutdown_all(&self.pools, drain_timeout).await
    }
}
