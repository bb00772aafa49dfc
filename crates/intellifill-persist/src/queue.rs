//! Durable queue backend using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use intellifill_queue::{
    retry_decision, ErrorClass, FailOutcome, JobCounts, JobEntry, JobError, JobId, JobLock,
    JobOptions, JobState, QueueBackend, QueueError, StallOutcome,
};

use crate::error::StorageError;

const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Durable queue backend using SQLite.
///
/// Every state transition is a single conditional `UPDATE`, so several
/// worker processes can share one database file.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Keep only the newest `keep` finished jobs in `state` for `queue`
    async fn trim(&self, queue: &str, state: JobState, keep: usize) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ?1 AND state = ?2 AND id NOT IN (
                SELECT id FROM jobs
                WHERE queue = ?1 AND state = ?2
                ORDER BY finished_at DESC, seq DESC
                LIMIT ?3
            )
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Tell a missing job apart from one whose lock moved on
    async fn lock_failure(&self, id: JobId) -> QueueError {
        match self.get_job(id).await {
            Ok(_) => QueueError::LockLost(id),
            Err(e) => e,
        }
    }
}

fn db_err(e: sqlx::Error) -> QueueError {
    StorageError::from(e).into()
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Backend(format!("invalid timestamp {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    ms.map(from_millis).transpose()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn lock_expiry(lock_duration: Duration) -> i64 {
    Utc::now().timestamp_millis().saturating_add(duration_ms(lock_duration))
}

fn row_to_entry(row: &SqliteRow) -> Result<JobEntry, QueueError> {
    let get_err = |e: sqlx::Error| QueueError::Backend(e.to_string());

    let id: String = row.try_get("id").map_err(get_err)?;
    let id = Uuid::parse_str(&id).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;
    let state: String = row.try_get("state").map_err(get_err)?;
    let state = JobState::parse(&state)
        .ok_or_else(|| QueueError::Backend(format!("Invalid state in DB: {}", state)))?;
    let payload: String = row.try_get("payload").map_err(get_err)?;
    let backoff: String = row.try_get("backoff").map_err(get_err)?;
    let result: Option<String> = row.try_get("result").map_err(get_err)?;
    let failure_class: Option<String> = row.try_get("failure_class").map_err(get_err)?;

    let lock_token: Option<String> = row.try_get("lock_token").map_err(get_err)?;
    let lock_owner: Option<String> = row.try_get("lock_owner").map_err(get_err)?;
    let lock_expires_at: Option<i64> = row.try_get("lock_expires_at").map_err(get_err)?;
    let lock = match (lock_token, lock_owner, lock_expires_at) {
        (Some(token), Some(owner), Some(expires_at)) => Some(JobLock {
            token: Uuid::parse_str(&token)
                .map_err(|_| QueueError::Backend("Invalid lock token".into()))?,
            owner,
            expires_at: from_millis(expires_at)?,
        }),
        _ => None,
    };

    Ok(JobEntry {
        id,
        queue: row.try_get("queue").map_err(get_err)?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get::<i64, _>("priority").map_err(get_err)? as u32,
        seq: row.try_get::<i64, _>("seq").map_err(get_err)? as u64,
        state,
        attempts_made: row.try_get::<i64, _>("attempts_made").map_err(get_err)? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(get_err)? as u32,
        backoff: serde_json::from_str(&backoff)?,
        timeout_ms: row
            .try_get::<Option<i64>, _>("timeout_ms")
            .map_err(get_err)?
            .map(|t| t as u64),
        lock_duration_ms: row
            .try_get::<Option<i64>, _>("lock_duration_ms")
            .map_err(get_err)?
            .map(|t| t as u64),
        created_at: from_millis(row.try_get("created_at").map_err(get_err)?)?,
        run_at: from_millis(row.try_get("run_at").map_err(get_err)?)?,
        processed_at: opt_from_millis(row.try_get("processed_at").map_err(get_err)?)?,
        finished_at: opt_from_millis(row.try_get("finished_at").map_err(get_err)?)?,
        failed_reason: row.try_get("failed_reason").map_err(get_err)?,
        failure_class: failure_class.as_deref().and_then(ErrorClass::parse),
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        lock,
        stalled_count: row.try_get::<i64, _>("stalled_count").map_err(get_err)? as u32,
        max_stalled_count: row.try_get::<i64, _>("max_stalled_count").map_err(get_err)? as u32,
        keep_completed: row.try_get::<i64, _>("keep_completed").map_err(get_err)? as usize,
        keep_failed: row.try_get::<i64, _>("keep_failed").map_err(get_err)? as usize,
    })
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        options: &JobOptions,
    ) -> Result<JobEntry, QueueError> {
        // seq is assigned inside the INSERT so concurrent producers stay ordered
        let draft = JobEntry::new(queue, payload, options, 0, Utc::now());

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, priority, seq, state, attempts_made, max_attempts,
                backoff, timeout_ms, lock_duration_ms, created_at, run_at, stalled_count,
                max_stalled_count, keep_completed, keep_failed
            )
            VALUES (
                ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs), ?, 0, ?,
                ?, ?, ?, ?, ?, 0, ?, ?, ?
            )
            RETURNING *
            "#,
        )
        .bind(draft.id.to_string())
        .bind(&draft.queue)
        .bind(serde_json::to_string(&draft.payload)?)
        .bind(draft.priority as i64)
        .bind(draft.state.as_str())
        .bind(draft.max_attempts as i64)
        .bind(serde_json::to_string(&draft.backoff)?)
        .bind(draft.timeout_ms.map(|t| t as i64))
        .bind(draft.lock_duration_ms.map(|t| t as i64))
        .bind(millis(draft.created_at))
        .bind(millis(draft.run_at))
        .bind(draft.max_stalled_count as i64)
        .bind(draft.keep_completed as i64)
        .bind(draft.keep_failed as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_entry(&row)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobEntry>, QueueError> {
        let now = millis(Utc::now());

        sqlx::query(
            "UPDATE jobs SET state = 'waiting' WHERE queue = ? AND state = 'delayed' AND run_at <= ?",
        )
        .bind(queue)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'active',
                processed_at = ?1,
                finished_at = NULL,
                lock_token = ?2,
                lock_owner = ?3,
                lock_expires_at = ?1 + COALESCE(lock_duration_ms, ?4)
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?5 AND state = 'waiting'
                ORDER BY priority ASC, seq ASC
                LIMIT 1
            )
            AND state = 'waiting'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(Uuid::new_v4().to_string())
        .bind(worker_id)
        .bind(duration_ms(lock_duration))
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn extend_lock(
        &self,
        id: JobId,
        token: Uuid,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_expires_at = ? WHERE id = ? AND state = 'active' AND lock_token = ?",
        )
        .bind(lock_expiry(lock_duration))
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, id: JobId, token: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'waiting',
                processed_at = NULL,
                lock_token = NULL,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = ? AND state = 'active' AND lock_token = ?
            "#,
        )
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: JobId, token: Uuid, result: Value) -> Result<(), QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                attempts_made = MIN(attempts_made + 1, max_attempts),
                finished_at = ?,
                result = ?,
                failed_reason = NULL,
                failure_class = NULL,
                lock_token = NULL,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = ? AND state = 'active' AND lock_token = ?
            RETURNING queue, keep_completed
            "#,
        )
        .bind(millis(Utc::now()))
        .bind(serde_json::to_string(&result)?)
        .bind(id.to_string())
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(self.lock_failure(id).await);
        };
        let queue: String = row.try_get("queue").map_err(db_err)?;
        let keep: i64 = row.try_get("keep_completed").map_err(db_err)?;
        self.trim(&queue, JobState::Completed, keep as usize).await
    }

    async fn fail(
        &self,
        id: JobId,
        token: Uuid,
        error: &JobError,
    ) -> Result<FailOutcome, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts_made = MIN(attempts_made + 1, max_attempts),
                failed_reason = ?,
                failure_class = ?
            WHERE id = ? AND state = 'active' AND lock_token = ?
            RETURNING *
            "#,
        )
        .bind(error.to_string())
        .bind(error.class.as_str())
        .bind(id.to_string())
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(self.lock_failure(id).await);
        };
        let entry = row_to_entry(&row)?;
        let outcome = retry_decision(&entry, error);
        let now = Utc::now();

        let updated = match &outcome {
            FailOutcome::Retrying { delay, .. } => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'delayed', run_at = ?,
                        lock_token = NULL, lock_owner = NULL, lock_expires_at = NULL
                    WHERE id = ? AND lock_token = ?
                    "#,
                )
                .bind(millis(now).saturating_add(delay_ms))
                .bind(id.to_string())
                .bind(token.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?
            }
            FailOutcome::Failed { .. } => sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'failed', finished_at = ?,
                    lock_token = NULL, lock_owner = NULL, lock_expires_at = NULL
                WHERE id = ? AND lock_token = ?
                "#,
            )
            .bind(millis(now))
            .bind(id.to_string())
            .bind(token.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
        };

        if updated.rows_affected() == 0 {
            return Err(QueueError::LockLost(id));
        }
        if matches!(outcome, FailOutcome::Failed { .. }) {
            self.trim(&entry.queue, JobState::Failed, entry.keep_failed).await?;
        }
        Ok(outcome)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StallOutcome>, QueueError> {
        let now_ms = millis(now);

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'waiting',
                stalled_count = stalled_count + 1,
                lock_token = NULL, lock_owner = NULL, lock_expires_at = NULL
            WHERE queue = ? AND state = 'active' AND lock_expires_at < ?
              AND stalled_count + 1 <= max_stalled_count
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        // Whatever is still expired has used up its stall allowance
        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed',
                stalled_count = stalled_count + 1,
                finished_at = ?,
                failed_reason = ?,
                failure_class = ?,
                lock_token = NULL, lock_owner = NULL, lock_expires_at = NULL
            WHERE queue = ? AND state = 'active' AND lock_expires_at < ?
            RETURNING *
            "#,
        )
        .bind(now_ms)
        .bind(STALLED_REASON)
        .bind(ErrorClass::Unknown.as_str())
        .bind(queue)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut outcomes = Vec::with_capacity(requeued.len() + failed.len());
        for row in &requeued {
            outcomes.push(StallOutcome::Requeued(row_to_entry(row)?));
        }
        let mut keep_failed = None;
        for row in &failed {
            let entry = row_to_entry(row)?;
            keep_failed = Some(entry.keep_failed);
            outcomes.push(StallOutcome::Failed(entry));
        }
        if let Some(keep) = keep_failed {
            self.trim(queue, JobState::Failed, keep).await?;
        }

        Ok(outcomes)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE id = ? AND state IN ('waiting', 'delayed')")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_job(id).await {
            Ok(job) => Err(QueueError::InvalidState(format!(
                "job {} is {} and cannot be removed",
                id, job.state
            ))),
            Err(QueueError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn promote(&self, id: JobId) -> Result<bool, QueueError> {
        let result =
            sqlx::query("UPDATE jobs SET state = 'waiting', run_at = ? WHERE id = ? AND state = 'delayed'")
                .bind(millis(Utc::now()))
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.get_job(id).await.map(|_| false)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY state")
            .bind(queue)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            if let Some(state) = JobState::parse(&state) {
                counts.add(state, n as u64);
            }
        }
        Ok(counts)
    }

    async fn recent_finished(&self, queue: &str, limit: usize) -> Result<Vec<JobEntry>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE queue = ? AND state IN ('completed', 'failed')
            ORDER BY finished_at DESC, seq DESC
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_entry).collect()
    }
}
