//! Document processing status records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub user_id: String,
    pub status: DocumentStatus,
    /// Human-readable failure reason
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status update applied to a document
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl StatusUpdate {
    pub fn processing() -> Self {
        Self {
            status: DocumentStatus::Processing,
            error: None,
            result: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: DocumentStatus::Completed,
            error: None,
            result: Some(result),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: DocumentStatus::Failed,
            error: Some(reason.into()),
            result: None,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply a status update, creating the record if needed
    async fn set_status(
        &self,
        document_id: &str,
        user_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StorageError>;

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, DocumentRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn set_status(
        &self,
        document_id: &str,
        user_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut documents = self.documents.write().await;
        let record = documents
            .entry(document_id.to_string())
            .or_insert_with(|| DocumentRecord {
                id: document_id.to_string(),
                user_id: user_id.to_string(),
                status: DocumentStatus::Pending,
                error: None,
                result: None,
                created_at: now,
                updated_at: now,
            });
        record.status = update.status;
        record.error = update.error;
        record.result = update.result;
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StorageError> {
        Ok(self.documents.read().await.get(document_id).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn set_status(
        &self,
        document_id: &str,
        user_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        let result = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, user_id, status, error, result, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                result = excluded.result,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(update.status.as_str())
        .bind(update.error)
        .bind(result)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(Some(DocumentRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: DocumentStatus::parse(&status)
                .ok_or_else(|| StorageError::Serialization(format!("unknown status '{}'", status)))?,
            error: row.try_get("error")?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default(),
            updated_at: DateTime::<Utc>::from_timestamp_millis(updated_at).unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_status_transitions() {
        let store = MemoryDocumentStore::new();
        store
            .set_status("doc-1", "user-1", StatusUpdate::processing())
            .await
            .unwrap();
        assert_eq!(
            store.get("doc-1").await.unwrap().unwrap().status,
            DocumentStatus::Processing
        );

        store
            .set_status("doc-1", "user-1", StatusUpdate::failed("OCR engine unavailable"))
            .await
            .unwrap();
        let record = store.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("OCR engine unavailable"));
    }
}
