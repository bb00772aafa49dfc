use serde_json::json;
use std::time::Duration;

use intellifill_queue::{
    BackoffStrategy, ErrorClass, FailOutcome, JobError, JobOptions, JobState, MemoryQueue,
    QueueBackend,
};

const LOCK: Duration = Duration::from_secs(30);

/// Claim the job, fail it with `error`, and return the outcome
async fn fail_once(queue: &MemoryQueue, error: &JobError) -> FailOutcome {
    let job = queue
        .claim("knowledge", "w1", LOCK)
        .await
        .unwrap()
        .expect("claimable job");
    let token = job.lock.expect("lock").token;
    queue.fail(job.id, token, error).await.unwrap()
}

#[tokio::test]
async fn test_three_attempts_with_exponential_backoff() {
    let queue = MemoryQueue::new();
    let opts = JobOptions::default()
        .with_attempts(3)
        .with_backoff(BackoffStrategy::exponential(5_000));
    let job = queue.enqueue("knowledge", json!({}), &opts).await.unwrap();
    let error = JobError::retryable("connection reset");

    let first = fail_once(&queue, &error).await;
    assert_eq!(
        first,
        FailOutcome::Retrying {
            attempt: 1,
            delay: Duration::from_millis(5_000)
        }
    );
    let entry = queue.get_job(job.id).await.unwrap();
    assert_eq!(entry.state, JobState::Delayed);
    let wait = (entry.run_at - chrono::Utc::now()).num_milliseconds();
    assert!(wait > 4_000 && wait <= 5_000, "run_at is {}ms away", wait);

    // Not claimable until its backoff passes
    assert!(queue.claim("knowledge", "w1", LOCK).await.unwrap().is_none());
    assert!(queue.promote(job.id).await.unwrap());

    let second = fail_once(&queue, &error).await;
    assert_eq!(
        second,
        FailOutcome::Retrying {
            attempt: 2,
            delay: Duration::from_millis(25_000)
        }
    );
    assert!(queue.promote(job.id).await.unwrap());

    let third = fail_once(&queue, &error).await;
    assert_eq!(third, FailOutcome::Failed { attempts_made: 3 });

    let entry = queue.get_job(job.id).await.unwrap();
    assert_eq!(entry.state, JobState::Failed);
    assert_eq!(entry.attempts_made, 3);
    assert_eq!(entry.failure_class, Some(ErrorClass::Retryable));
    assert!(entry.finished_at.is_some());
    assert!(queue.claim("knowledge", "w1", LOCK).await.unwrap().is_none());
}

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let queue = MemoryQueue::new();
    let opts = JobOptions::default()
        .with_attempts(2)
        .with_backoff(BackoffStrategy::Fixed { delay_ms: 0 });
    let job = queue.enqueue("knowledge", json!({}), &opts).await.unwrap();
    let error = JobError::unknown("odd response");

    assert!(matches!(
        fail_once(&queue, &error).await,
        FailOutcome::Retrying { .. }
    ));
    assert_eq!(
        fail_once(&queue, &error).await,
        FailOutcome::Failed { attempts_made: 2 }
    );

    let entry = queue.get_job(job.id).await.unwrap();
    assert!(entry.attempts_made <= entry.max_attempts);
    assert_eq!(entry.failure_class, Some(ErrorClass::Unknown));
}

#[tokio::test]
async fn test_validation_error_fails_on_first_attempt() {
    let queue = MemoryQueue::new();
    let job = queue
        .enqueue("knowledge", json!({}), &JobOptions::default().with_attempts(5))
        .await
        .unwrap();

    let outcome = fail_once(&queue, &JobError::permanent("response missing fields")).await;
    assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });
    assert_eq!(
        queue.get_job(job.id).await.unwrap().failure_class,
        Some(ErrorClass::Permanent)
    );
}
