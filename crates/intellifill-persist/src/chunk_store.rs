//! Chunk storage with content-hash deduplication and similarity search

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;

/// SHA-256 of the chunk text, hex encoded
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Rough token count used for budgeting embedding calls
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

/// A slice of extracted text, ready to embed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub content: String,
    pub content_hash: String,
    /// Character offsets into the extracted text
    pub char_start: usize,
    pub char_end: usize,
    pub token_estimate: u32,
}

impl Chunk {
    pub fn new(index: u32, content: impl Into<String>, char_start: usize, char_end: usize) -> Self {
        let content = content.into();
        Self {
            index,
            content_hash: content_hash(&content),
            token_estimate: estimate_tokens(&content),
            content,
            char_start,
            char_end,
        }
    }
}

/// A chunk with its embedding, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub source_id: String,
    pub organization_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub content_hash: String,
    pub token_count: u32,
    pub embedding: Vec<f32>,
}

impl ChunkRecord {
    pub fn from_chunk(
        source_id: &str,
        organization_id: &str,
        chunk: &Chunk,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            organization_id: organization_id.to_string(),
            chunk_index: chunk.index,
            content: chunk.content.clone(),
            content_hash: chunk.content_hash.clone(),
            token_count: chunk.token_estimate,
            embedding,
        }
    }
}

/// Result of one batched insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    pub inserted: usize,
    /// Records skipped because the source already holds identical content
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub score: f32,
    pub chunk: ChunkRecord,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert records; a `(source_id, content_hash)` pair already present is
    /// counted as a duplicate and left untouched
    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<InsertReport, StorageError>;

    async fn count(&self, source_id: &str) -> Result<usize, StorageError>;

    /// Cosine-similarity search within one organization
    async fn search(
        &self,
        organization_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, StorageError>;

    /// Drop every chunk of a source; returns how many were removed
    async fn delete_source(&self, source_id: &str) -> Result<usize, StorageError>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

fn rank(mut scores: Vec<ScoredChunk>, limit: usize) -> Vec<ScoredChunk> {
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scores.truncate(limit);
    scores
}

/// In-memory chunk store
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<(String, String), ChunkRecord>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<InsertReport, StorageError> {
        let mut chunks = self.chunks.write().await;
        let mut report = InsertReport::default();

        for record in records {
            let key = (record.source_id.clone(), record.content_hash.clone());
            if chunks.contains_key(&key) {
                report.duplicates += 1;
            } else {
                chunks.insert(key, record.clone());
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn count(&self, source_id: &str) -> Result<usize, StorageError> {
        let chunks = self.chunks.read().await;
        Ok(chunks.keys().filter(|(s, _)| s == source_id).count())
    }

    async fn search(
        &self,
        organization_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        let chunks = self.chunks.read().await;
        let scores = chunks
            .values()
            .filter(|c| c.organization_id == organization_id)
            .map(|c| ScoredChunk {
                score: cosine_similarity(query, &c.embedding),
                chunk: c.clone(),
            })
            .collect();
        Ok(rank(scores, limit))
    }

    async fn delete_source(&self, source_id: &str) -> Result<usize, StorageError> {
        let mut chunks = self.chunks.write().await;
        let before = chunks.len();
        chunks.retain(|(s, _), _| s != source_id);
        Ok(before - chunks.len())
    }
}

/// SQLite-backed chunk store; embeddings are little-endian f32 blobs
#[derive(Debug, Clone)]
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<InsertReport, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut report = InsertReport::default();
        let now = chrono::Utc::now().timestamp_millis();

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO document_chunks
                    (id, source_id, organization_id, chunk_index, content, content_hash,
                     token_count, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&record.source_id)
            .bind(&record.organization_id)
            .bind(record.chunk_index as i64)
            .bind(&record.content)
            .bind(&record.content_hash)
            .bind(record.token_count as i64)
            .bind(encode_vector(&record.embedding))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                report.duplicates += 1;
            } else {
                report.inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn count(&self, source_id: &str) -> Result<usize, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn search(
        &self,
        organization_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        // Brute-force scan of the organization's chunks
        let rows = sqlx::query(
            r#"
            SELECT source_id, organization_id, chunk_index, content, content_hash,
                   token_count, embedding
            FROM document_chunks WHERE organization_id = ?
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes: Vec<u8> = row.try_get("embedding")?;
            if bytes.len() != query.len() * 4 {
                continue;
            }
            let embedding = decode_vector(&bytes);
            let chunk = ChunkRecord {
                source_id: row.try_get("source_id")?,
                organization_id: row.try_get("organization_id")?,
                chunk_index: row.try_get::<i64, _>("chunk_index")? as u32,
                content: row.try_get("content")?,
                content_hash: row.try_get("content_hash")?,
                token_count: row.try_get::<i64, _>("token_count")? as u32,
                embedding,
            };
            scores.push(ScoredChunk {
                score: cosine_similarity(query, &chunk.embedding),
                chunk,
            });
        }

        Ok(rank(scores, limit))
    }

    async fn delete_source(&self, source_id: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM document_chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &str, text: &str, embedding: Vec<f32>) -> ChunkRecord {
        let chunk = Chunk::new(0, text, 0, text.len());
        ChunkRecord::from_chunk(source, "org-1", &chunk, embedding)
    }

    #[test]
    fn test_chunk_hash_and_tokens() {
        let a = Chunk::new(0, "hello world", 0, 11);
        let b = Chunk::new(5, "hello world", 40, 51);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
        assert_eq!(a.token_estimate, 3);
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_memory_store_dedup_per_source() {
        let store = MemoryChunkStore::new();
        let batch = vec![
            record("src-a", "alpha", vec![1.0, 0.0]),
            record("src-a", "beta", vec![0.0, 1.0]),
        ];

        let first = store.insert_batch(&batch).await.unwrap();
        assert_eq!(first, InsertReport { inserted: 2, duplicates: 0 });

        let again = store.insert_batch(&batch).await.unwrap();
        assert_eq!(again, InsertReport { inserted: 0, duplicates: 2 });
        assert_eq!(store.count("src-a").await.unwrap(), 2);

        // Same content under another source is not a duplicate
        let other = store
            .insert_batch(&[record("src-b", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(other.inserted, 1);

        let hits = store.search("org-1", &[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.content, "alpha");

        assert_eq!(store.delete_source("src-a").await.unwrap(), 2);
        assert_eq!(store.count("src-a").await.unwrap(), 0);
    }
}
