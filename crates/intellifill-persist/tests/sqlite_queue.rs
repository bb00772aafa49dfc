use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use intellifill_persist::{Database, SqliteConfig, SqliteQueueBackend};
use intellifill_queue::{
    BackoffStrategy, FailOutcome, JobError, JobOptions, JobState, Priority, QueueBackend,
    QueueError, StallOutcome,
};

const LOCK: Duration = Duration::from_secs(30);

async fn backend() -> SqliteQueueBackend {
    let db = Database::memory().await.expect("in-memory database");
    SqliteQueueBackend::new(db.pool().clone())
}

#[tokio::test]
async fn test_claim_order_priority_then_fifo() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let low = queue
        .enqueue("docs", json!({ "n": 1 }), &JobOptions::default().with_priority(Priority::Low))
        .await?;
    let normal_a = queue.enqueue("docs", json!({ "n": 2 }), &JobOptions::default()).await?;
    let high = queue
        .enqueue("docs", json!({ "n": 3 }), &JobOptions::default().with_priority(Priority::High))
        .await?;
    let normal_b = queue.enqueue("docs", json!({ "n": 4 }), &JobOptions::default()).await?;
    assert!(normal_b.seq > normal_a.seq);

    let mut order = Vec::new();
    while let Some(job) = queue.claim("docs", "w1", LOCK).await? {
        assert_eq!(job.state, JobState::Active);
        assert!(job.processed_at.is_some());
        order.push(job.id);
    }
    assert_eq!(order, vec![high.id, normal_a.id, normal_b.id, low.id]);

    // Queues are isolated
    assert!(queue.claim("other", "w1", LOCK).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_payload_and_options_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let opts = JobOptions::default()
        .with_attempts(4)
        .with_timeout(Duration::from_secs(600))
        .with_backoff(BackoffStrategy::Fixed { delay_ms: 250 });
    let job = queue
        .enqueue("knowledge", json!({ "type": "knowledge", "source_id": "s1" }), &opts)
        .await?;

    let loaded = queue.get_job(job.id).await?;
    assert_eq!(loaded.payload["source_id"], "s1");
    assert_eq!(loaded.max_attempts, 4);
    assert_eq!(loaded.timeout(), Some(Duration::from_secs(600)));
    assert_eq!(loaded.backoff, BackoffStrategy::Fixed { delay_ms: 250 });
    assert_eq!(loaded.state, JobState::Waiting);
    Ok(())
}

#[tokio::test]
async fn test_complete_and_lock_ownership() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let job = queue.enqueue("docs", json!({}), &JobOptions::default()).await?;
    let claimed = queue.claim("docs", "w1", LOCK).await?.expect("job");
    let token = claimed.lock.expect("lock").token;

    assert!(queue.extend_lock(job.id, token, LOCK).await?);
    assert!(!queue.extend_lock(job.id, uuid::Uuid::new_v4(), LOCK).await?);
    assert!(matches!(
        queue.complete(job.id, uuid::Uuid::new_v4(), json!({})).await,
        Err(QueueError::LockLost(_))
    ));

    queue.complete(job.id, token, json!({ "pages": 2 })).await?;
    let done = queue.get_job(job.id).await?;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts_made, 1);
    assert_eq!(done.result, Some(json!({ "pages": 2 })));
    assert!(done.lock.is_none());
    assert!(done.processing_time().is_some());
    Ok(())
}

#[tokio::test]
async fn test_release_hands_job_back_to_waiting() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let job = queue.enqueue("docs", json!({}), &JobOptions::default()).await?;
    let claimed = queue.claim("docs", "w1", LOCK).await?.expect("job");
    let token = claimed.lock.expect("lock").token;

    assert!(!queue.release(job.id, uuid::Uuid::new_v4()).await?);
    assert!(queue.release(job.id, token).await?);
    assert!(!queue.release(job.id, token).await?);

    let released = queue.get_job(job.id).await?;
    assert_eq!(released.state, JobState::Waiting);
    assert_eq!(released.attempts_made, 0);
    assert!(released.lock.is_none());
    assert!(released.processed_at.is_none());

    let again = queue.claim("docs", "w2", LOCK).await?.expect("job");
    assert_eq!(again.id, job.id);
    assert_eq!(again.lock.expect("lock").owner, "w2");
    Ok(())
}

#[tokio::test]
async fn test_job_lock_duration_is_stored_and_used() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let long = JobOptions::default().with_lock_duration(Duration::from_secs(600));
    let job = queue.enqueue("ocr", json!({}), &long).await?;
    let plain = queue.enqueue("ocr", json!({}), &JobOptions::default()).await?;
    assert_eq!(queue.get_job(job.id).await?.lock_duration_ms, Some(600_000));
    assert_eq!(queue.get_job(plain.id).await?.lock_duration_ms, None);

    let before = chrono::Utc::now();
    let first = queue.claim("ocr", "w1", Duration::from_millis(1)).await?.expect("job");
    assert_eq!(first.id, job.id);
    assert!(first.lock.expect("lock").expires_at >= before + chrono::Duration::seconds(599));
    queue.claim("ocr", "w1", Duration::from_millis(1)).await?.expect("job");

    // Only the job on the pool's 1ms window counts as stalled
    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    let outcomes = queue.recover_stalled("ocr", later).await?;
    assert!(matches!(outcomes.as_slice(), [StallOutcome::Requeued(j)] if j.id == plain.id));
    Ok(())
}

#[tokio::test]
async fn test_retry_backoff_and_terminal_failure() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let opts = JobOptions::default()
        .with_attempts(3)
        .with_backoff(BackoffStrategy::exponential(5_000));
    let job = queue.enqueue("knowledge", json!({}), &opts).await?;
    let error = JobError::retryable("503 from embedding service");

    let mut delays = Vec::new();
    loop {
        let claimed = queue.claim("knowledge", "w1", LOCK).await?.expect("claimable");
        let token = claimed.lock.expect("lock").token;
        match queue.fail(job.id, token, &error).await? {
            FailOutcome::Retrying { delay, .. } => {
                delays.push(delay);
                assert_eq!(queue.get_job(job.id).await?.state, JobState::Delayed);
                assert!(queue.claim("knowledge", "w1", LOCK).await?.is_none());
                assert!(queue.promote(job.id).await?);
            }
            FailOutcome::Failed { attempts_made } => {
                assert_eq!(attempts_made, 3);
                break;
            }
        }
    }

    assert_eq!(
        delays,
        vec![Duration::from_millis(5_000), Duration::from_millis(25_000)]
    );
    let failed = queue.get_job(job.id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempts_made, 3);
    assert_eq!(failed.failed_reason.as_deref(), Some("503 from embedding service"));
    Ok(())
}

#[tokio::test]
async fn test_delayed_job_becomes_claimable() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let job = queue
        .enqueue(
            "ocr",
            json!({}),
            &JobOptions::default().with_delay(Duration::from_millis(40)),
        )
        .await?;
    assert_eq!(job.state, JobState::Delayed);
    assert!(queue.claim("ocr", "w1", LOCK).await?.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let claimed = queue.claim("ocr", "w1", LOCK).await?.expect("due job");
    assert_eq!(claimed.id, job.id);
    Ok(())
}

#[tokio::test]
async fn test_stall_recovery_then_failure() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let job = queue.enqueue("ocr", json!({}), &JobOptions::default()).await?;

    queue.claim("ocr", "crashed", Duration::from_millis(1)).await?.expect("job");
    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    let outcomes = queue.recover_stalled("ocr", later).await?;
    assert!(matches!(outcomes.as_slice(), [StallOutcome::Requeued(j)] if j.stalled_count == 1));

    queue.claim("ocr", "crashed", Duration::from_millis(1)).await?.expect("job");
    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    let outcomes = queue.recover_stalled("ocr", later).await?;
    assert!(matches!(outcomes.as_slice(), [StallOutcome::Failed(_)]));

    let failed = queue.get_job(job.id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.failed_reason.as_deref(),
        Some("job stalled more than allowable limit")
    );
    Ok(())
}

#[tokio::test]
async fn test_remove_rules() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let waiting = queue.enqueue("docs", json!({}), &JobOptions::default()).await?;
    assert!(queue.remove(waiting.id).await?);
    assert!(!queue.remove(waiting.id).await?);

    let active = queue.enqueue("docs", json!({}), &JobOptions::default()).await?;
    queue.claim("docs", "w1", LOCK).await?.expect("job");
    assert!(matches!(
        queue.remove(active.id).await,
        Err(QueueError::InvalidState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_retention_and_metrics_inputs() -> Result<(), Box<dyn std::error::Error>> {
    let queue = backend().await;
    let opts = JobOptions::default().with_retention(2, 1);
    for n in 0..3 {
        queue.enqueue("docs", json!({ "n": n }), &opts).await?;
    }
    while let Some(job) = queue.claim("docs", "w1", LOCK).await? {
        queue
            .complete(job.id, job.lock.expect("lock").token, json!(null))
            .await?;
    }

    let counts = queue.counts("docs").await?;
    assert_eq!(counts.completed, 2);
    assert_eq!(queue.recent_finished("docs", 10).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let db = Database::connect_with(SqliteConfig {
        url: format!("sqlite:{}", dir.path().join("claims.db").display()),
        max_connections: 4,
        wal_mode: false,
        busy_timeout_secs: 10,
    })
    .await?;
    let queue = Arc::new(SqliteQueueBackend::new(db.pool().clone()));
    for n in 0..20 {
        queue.enqueue("docs", json!({ "n": n }), &JobOptions::default()).await?;
    }

    let mut tasks = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue
                .claim("docs", &format!("w{}", w), LOCK)
                .await
                .expect("claim")
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await?);
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    Ok(())
}
