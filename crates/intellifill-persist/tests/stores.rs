use uuid::Uuid;

use intellifill_persist::{
    Checkpoint, CheckpointStore, Chunk, ChunkRecord, ChunkStore, Database, DocumentStatus,
    DocumentStore, InsertReport, SqliteCheckpointStore, SqliteChunkStore, SqliteDocumentStore,
    StatusUpdate,
};
use intellifill_queue::ProcessingStage;

fn records(source: &str, texts: &[&str]) -> Vec<ChunkRecord> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let chunk = Chunk::new(i as u32, *text, 0, text.len());
            ChunkRecord::from_chunk(source, "org-1", &chunk, vec![i as f32 + 1.0, 1.0, 0.0])
        })
        .collect()
}

#[tokio::test]
async fn test_checkpoint_upsert_and_delete() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::memory().await?;
    let store = SqliteCheckpointStore::new(db.pool().clone());
    assert!(store.load("src-1").await?.is_none());

    let mut checkpoint = Checkpoint::new("src-1", Uuid::new_v4());
    checkpoint.artifacts.extracted_text = Some("hello".into());
    store.save(&checkpoint).await?;

    checkpoint.stage = ProcessingStage::Embedding;
    checkpoint.total_chunks = Some(12);
    checkpoint.last_completed_chunk = Some(4);
    checkpoint.artifacts.chunks = Some(vec![Chunk::new(0, "hello", 0, 5)]);
    checkpoint.artifacts.embeddings = vec![vec![0.5; 3]; 5];
    checkpoint.touch();
    store.save(&checkpoint).await?;

    let loaded = store.load("src-1").await?.expect("checkpoint");
    assert_eq!(loaded.stage, ProcessingStage::Embedding);
    assert_eq!(loaded.next_chunk_to_embed(), 5);
    assert_eq!(loaded.total_chunks, Some(12));
    assert_eq!(loaded.artifacts.embeddings.len(), 5);
    assert_eq!(loaded.artifacts.extracted_text.as_deref(), Some("hello"));

    assert!(store.delete("src-1").await?);
    assert!(store.load("src-1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_checkpoint_reads_as_absent() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::memory().await?;
    let store = SqliteCheckpointStore::new(db.pool().clone());

    sqlx::query(
        "INSERT INTO checkpoints (source_id, job_id, stage, artifacts, created_at, updated_at) \
         VALUES ('broken', 'not-a-uuid', 'embedding', '{not json', 0, 0)",
    )
    .execute(db.pool())
    .await?;

    assert!(store.load("broken").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_chunk_dedup_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::memory().await?;
    let store = SqliteChunkStore::new(db.pool().clone());
    let batch = records("src-1", &["alpha", "beta", "gamma"]);

    let first = store.insert_batch(&batch).await?;
    assert_eq!(first, InsertReport { inserted: 3, duplicates: 0 });

    let second = store.insert_batch(&batch).await?;
    assert_eq!(second, InsertReport { inserted: 0, duplicates: 3 });
    assert_eq!(store.count("src-1").await?, 3);

    // Identical text in a different source is stored separately
    let other = store.insert_batch(&records("src-2", &["alpha"])).await?;
    assert_eq!(other.inserted, 1);

    let hits = store.search("org-1", &[3.0, 1.0, 0.0], 2).await?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk.content, "gamma");
    assert!(hits[0].score >= hits[1].score);

    assert_eq!(store.delete_source("src-1").await?, 3);
    assert_eq!(store.count("src-1").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_document_status_updates() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::memory().await?;
    let store = SqliteDocumentStore::new(db.pool().clone());

    store
        .set_status("doc-1", "user-1", StatusUpdate::processing())
        .await?;
    store
        .set_status(
            "doc-1",
            "user-1",
            StatusUpdate::completed(serde_json::json!({ "fields": 3 })),
        )
        .await?;

    let record = store.get("doc-1").await?.expect("document");
    assert_eq!(record.status, DocumentStatus::Completed);
    assert_eq!(record.result, Some(serde_json::json!({ "fields": 3 })));
    assert!(record.error.is_none());

    store
        .set_status("doc-1", "user-1", StatusUpdate::failed("extraction failed"))
        .await?;
    let record = store.get("doc-1").await?.expect("document");
    assert_eq!(record.status, DocumentStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("extraction failed"));
    assert!(store.get("missing").await?.is_none());
    Ok(())
}
