//! Processing checkpoints for resumable ingestion
//!
//! A checkpoint records how far a source has progressed through the
//! knowledge pipeline, together with the artifacts produced so far, so a
//! retried or recovered job continues where the last attempt stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use intellifill_queue::ProcessingStage;

use crate::chunk_store::Chunk;
use crate::error::StorageError;

/// Intermediate results carried between attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointArtifacts {
    pub extracted_text: Option<String>,
    pub page_count: Option<u32>,
    pub chunks: Option<Vec<Chunk>>,
    /// Embeddings of chunks `0..=last_completed_chunk`, in order
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub job_id: Uuid,
    pub stage: ProcessingStage,
    /// Last chunk index whose embedding is recorded
    pub last_completed_chunk: Option<u32>,
    /// Last chunk index written to the chunk store
    pub last_stored_chunk: Option<u32>,
    pub total_chunks: Option<u32>,
    pub artifacts: CheckpointArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.into(),
            job_id,
            stage: ProcessingStage::Extraction,
            last_completed_chunk: None,
            last_stored_chunk: None,
            total_chunks: None,
            artifacts: CheckpointArtifacts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// First chunk index that still needs an embedding
    pub fn next_chunk_to_embed(&self) -> u32 {
        self.last_completed_chunk.map_or(0, |c| c + 1)
    }

    /// First chunk index that still needs storing
    pub fn next_chunk_to_store(&self) -> u32 {
        self.last_stored_chunk.map_or(0, |c| c + 1)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Unreadable checkpoints are logged and reported as absent
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, StorageError>;

    /// Insert or replace the checkpoint for its source
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    async fn delete(&self, source_id: &str) -> Result<bool, StorageError>;
}

/// In-memory checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.checkpoints.read().await.get(source_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        let mut stored = checkpoint.clone();
        if let Some(existing) = checkpoints.get(&checkpoint.source_id) {
            stored.created_at = existing.created_at;
        }
        checkpoints.insert(stored.source_id.clone(), stored);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool, StorageError> {
        Ok(self.checkpoints.write().await.remove(source_id).is_some())
    }
}

/// SQLite checkpoint store
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, String> {
    let get = |col: &str| -> Result<Option<i64>, String> {
        row.try_get::<Option<i64>, _>(col).map_err(|e| e.to_string())
    };

    let source_id: String = row.try_get("source_id").map_err(|e| e.to_string())?;
    let job_id: String = row.try_get("job_id").map_err(|e| e.to_string())?;
    let stage: String = row.try_get("stage").map_err(|e| e.to_string())?;
    let artifacts: String = row.try_get("artifacts").map_err(|e| e.to_string())?;
    let created_at = get("created_at")?.unwrap_or_default();
    let updated_at = get("updated_at")?.unwrap_or_default();

    Ok(Checkpoint {
        source_id,
        job_id: Uuid::parse_str(&job_id).map_err(|e| e.to_string())?,
        stage: ProcessingStage::parse(&stage).ok_or_else(|| format!("unknown stage '{}'", stage))?,
        last_completed_chunk: get("last_completed_chunk")?.map(|v| v as u32),
        last_stored_chunk: get("last_stored_chunk")?.map(|v| v as u32),
        total_chunks: get("total_chunks")?.map(|v| v as u32),
        artifacts: serde_json::from_str(&artifacts).map_err(|e| e.to_string())?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default(),
        updated_at: DateTime::<Utc>::from_timestamp_millis(updated_at).unwrap_or_default(),
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        match decode_row(&row) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(reason) => {
                warn!(source_id = %source_id, reason = %reason, "Corrupt checkpoint ignored");
                Ok(None)
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                source_id, job_id, stage, last_completed_chunk, last_stored_chunk,
                total_chunks, artifacts, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_id) DO UPDATE SET
                job_id = excluded.job_id,
                stage = excluded.stage,
                last_completed_chunk = excluded.last_completed_chunk,
                last_stored_chunk = excluded.last_stored_chunk,
                total_chunks = excluded.total_chunks,
                artifacts = excluded.artifacts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.source_id)
        .bind(checkpoint.job_id.to_string())
        .bind(checkpoint.stage.as_str())
        .bind(checkpoint.last_completed_chunk.map(i64::from))
        .bind(checkpoint.last_stored_chunk.map(i64::from))
        .bind(checkpoint.total_chunks.map(i64::from))
        .bind(serde_json::to_string(&checkpoint.artifacts)?)
        .bind(checkpoint.created_at.timestamp_millis())
        .bind(checkpoint.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
