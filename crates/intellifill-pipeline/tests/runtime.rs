use std::path::Path;
use std::time::Duration;

use intellifill_persist::{CheckpointStore, ChunkStore, Database, DocumentStatus, DocumentStore};
use intellifill_pipeline::{
    JobPayload, KnowledgeJob, KnowledgeOptions, KnowledgeResult, MemoryGuard, MemoryGuardConfig,
    MemoryProbe, OcrJob, QueueKind, Runtime, RuntimeBuilder,
};
use intellifill_queue::{JobState, LifecycleState, Priority, WorkerConfig};

#[derive(Debug)]
struct Unmeasured;

impl MemoryProbe for Unmeasured {
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

fn fast_worker(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(5),
        drain_poll_interval: Duration::from_millis(5),
        ..WorkerConfig::default().with_concurrency(concurrency)
    }
}

fn build(builder: RuntimeBuilder) -> Runtime {
    QueueKind::ALL
        .into_iter()
        .fold(builder, |b, kind| b.with_worker_config(kind, fast_worker(1)))
        .with_memory_guard(MemoryGuard::new(Box::new(Unmeasured), MemoryGuardConfig::default()))
        .build()
}

fn write(dir: &Path, name: &str, text: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path.display().to_string()
}

fn ocr(document_id: &str, file_path: &str) -> JobPayload {
    JobPayload::Ocr(OcrJob {
        document_id: document_id.into(),
        user_id: "user-1".into(),
        file_path: file_path.into(),
        mime_type: "text/plain".into(),
        language: None,
    })
}

#[tokio::test]
async fn test_knowledge_job_end_to_end_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let text = (0..30)
        .map(|i| format!("Section {} explains an unrelated topic in plain words.", i))
        .collect::<Vec<_>>()
        .join("\n\n");
    let file = write(dir.path(), "handbook.txt", &text);

    let db = Database::memory().await.unwrap();
    let runtime = build(RuntimeBuilder::sqlite(&db));
    let workers = runtime.start();

    let payload = JobPayload::Knowledge(KnowledgeJob {
        source_id: "handbook".into(),
        organization_id: "org-1".into(),
        user_id: "user-1".into(),
        file_path: file,
        mime_type: "text/plain".into(),
        options: KnowledgeOptions {
            max_chunk_chars: Some(120),
            overlap_chars: Some(20),
        },
    });
    let handle = runtime.submit(&payload, None).await.unwrap();
    let report = handle
        .wait(Duration::from_millis(10), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Completed);
    let result: KnowledgeResult = serde_json::from_value(report.result.unwrap()).unwrap();
    assert!(result.total_chunks > 1);
    assert_eq!(result.stored, result.total_chunks as usize);
    assert_eq!(
        runtime.chunks().count("handbook").await.unwrap(),
        result.total_chunks as usize
    );
    assert!(runtime.checkpoints().load("handbook").await.unwrap().is_none());

    let reports = runtime.shutdown(Duration::from_secs(2)).await;
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.abandoned == 0));
    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    assert!(runtime
        .pools()
        .iter()
        .all(|p| p.state() == LifecycleState::Stopped));
}

#[tokio::test]
async fn test_priority_order_across_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(dir.path(), "scan.txt", "scanned text");
    let runtime = build(RuntimeBuilder::in_memory());
    let mut events = runtime.progress().subscribe();

    let queue = runtime.queue(QueueKind::Ocr).unwrap();
    let defaults = queue.defaults().clone();
    let low = runtime
        .submit(&ocr("low", &file), Some(defaults.clone().with_priority(Priority::Low)))
        .await
        .unwrap();
    let normal = runtime.submit(&ocr("normal", &file), None).await.unwrap();
    let high = runtime
        .submit(&ocr("high", &file), Some(defaults.with_priority(Priority::High)))
        .await
        .unwrap();

    let workers = runtime.start();
    low.wait(Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !order.contains(&event.job_id) {
            order.push(event.job_id);
        }
    }
    assert_eq!(order, vec![high.id, normal.id, low.id]);

    let record = runtime.documents().get("low").await.unwrap().unwrap();
    assert_eq!(record.status, DocumentStatus::Completed);

    runtime.shutdown(Duration::from_secs(2)).await;
    for worker in workers {
        worker.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_terminal_failure_reaches_document_status() {
    let runtime = build(RuntimeBuilder::in_memory());
    let workers = runtime.start();

    // Unsupported type fails permanently on the first attempt
    let payload = JobPayload::Ocr(OcrJob {
        document_id: "scan-png".into(),
        user_id: "user-1".into(),
        file_path: "/tmp/scan.png".into(),
        mime_type: "image/png".into(),
        language: None,
    });
    let handle = runtime.submit(&payload, None).await.unwrap();
    let report = handle
        .wait(Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.attempts_made, 1);

    let documents = runtime.documents().clone();
    let mut status = None;
    for _ in 0..100 {
        status = documents.get("scan-png").await.unwrap().map(|r| r.status);
        if status == Some(DocumentStatus::Failed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(DocumentStatus::Failed));

    runtime.shutdown(Duration::from_secs(2)).await;
    for worker in workers {
        worker.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_submit_routes_by_payload_kind() {
    let runtime = build(RuntimeBuilder::in_memory());
    let handle = runtime
        .submit(&ocr("doc-x", "/tmp/x.txt"), None)
        .await
        .unwrap();

    let status = runtime
        .queue(QueueKind::Ocr)
        .unwrap()
        .status(handle.id)
        .await
        .unwrap();
    assert_eq!(status.queue, "ocr-processing");
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.max_attempts, 3);

    let counts = runtime.queue(QueueKind::Knowledge).unwrap().counts().await.unwrap();
    assert_eq!(counts.waiting, 0);
}
