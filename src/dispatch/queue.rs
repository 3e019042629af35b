use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::{JOB_RETRY_BACKOFF_SECS, JOB_VISIBILITY_TIMEOUT_SECS};
use crate::db::models::JobRow;
use crate::dispatch::Job;
use crate::error::{AppError, Result};
use crate::types::now_secs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub message_id: String,
    /// True when a job with the same dedup key already existed; no new
    /// message was created.
    pub deduplicated: bool,
}

/// A job leased to one consumer until its visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    /// Raw body; decoded by the consumer so an undecodable job can be
    /// dead-lettered instead of retried.
    pub body: String,
    /// Delivery count including this one.
    pub attempts: i64,
    pub max_attempts: i64,
    /// Result of an earlier delivery whose callback never landed.
    pub outcome: Option<String>,
}

impl From<JobRow> for ClaimedJob {
    fn from(r: JobRow) -> Self {
        ClaimedJob {
            id: r.id,
            body: r.body,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
            outcome: r.outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retrying { visible_at: i64 },
    DeadLettered,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job, dedup_key: &str) -> Result<EnqueueReceipt>;
    async fn claim(&self) -> Result<Option<ClaimedJob>>;
    async fn ack(&self, id: &str) -> Result<()>;
    async fn nack(&self, id: &str, error: &str) -> Result<NackOutcome>;
    async fn dead_letter(&self, id: &str, error: &str) -> Result<()>;
    /// Persist the execution result on the job before reporting it.
    async fn stash_outcome(&self, id: &str, outcome: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    max_attempts: i64,
    visibility_timeout_secs: i64,
    backoff_secs: i64,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, max_attempts: i64) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
            visibility_timeout_secs: JOB_VISIBILITY_TIMEOUT_SECS,
            backoff_secs: JOB_RETRY_BACKOFF_SECS,
        }
    }

    pub fn with_timings(mut self, visibility_timeout_secs: i64, backoff_secs: i64) -> Self {
        self.visibility_timeout_secs = visibility_timeout_secs;
        self.backoff_secs = backoff_secs;
        self
    }

    /// Jobs waiting for a consumer.
    pub async fn pending_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn status_of(&self, id: &str) -> Result<Option<String>> {
        let s: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(s)
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: &Job, dedup_key: &str) -> Result<EnqueueReceipt> {
        let id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_string(job)?;
        let now = now_secs();

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, body, dedup_key, status, attempts, max_attempts, visible_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(job.kind())
        .bind(&body)
        .bind(dedup_key)
        .bind(self.max_attempts)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(EnqueueReceipt { message_id: id, deduplicated: false });
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM jobs WHERE dedup_key = ?")
            .bind(dedup_key)
            .fetch_one(&self.pool)
            .await?;
        info!(dedup_key, message_id = %existing, "[QUEUE] Duplicate enqueue collapsed");
        Ok(EnqueueReceipt { message_id: existing, deduplicated: true })
    }

    /// Lease the oldest visible job. A `running` job whose lease lapsed is
    /// visible again; one that lapsed on its final attempt is dead-lettered.
    async fn claim(&self) -> Result<Option<ClaimedJob>> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead', last_error = COALESCE(last_error, 'lease expired on final attempt')
            WHERE status = 'running' AND visible_at <= ? AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if expired > 0 {
            warn!(count = expired, "[QUEUE] Dead-lettered jobs whose final lease expired");
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, visible_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status IN ('pending', 'running') AND visible_at <= ?
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, kind, body, dedup_key, status, attempts, max_attempts,
                      visible_at, last_error, outcome, created_at
            "#,
        )
        .bind(now + self.visibility_timeout_secs)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.map(ClaimedJob::from))
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let done = sqlx::query("UPDATE jobs SET status = 'done' WHERE id = ? AND status = 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if done == 0 {
            return Err(AppError::Queue(format!("ack of job {id} that is not running")));
        }
        Ok(())
    }

    async fn nack(&self, id: &str, error: &str) -> Result<NackOutcome> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE id = ? AND status = 'running'")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let (attempts, max_attempts) =
            row.ok_or_else(|| AppError::Queue(format!("nack of job {id} that is not running")))?;

        if attempts >= max_attempts {
            self.dead_letter(id, error).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at = now_secs() + self.backoff_secs * attempts;
        sqlx::query("UPDATE jobs SET status = 'pending', visible_at = ?, last_error = ? WHERE id = ?")
            .bind(visible_at)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(NackOutcome::Retrying { visible_at })
    }

    async fn dead_letter(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'dead', last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        warn!(job = %id, "[QUEUE] Dead-lettered: {error}");
        Ok(())
    }

    async fn stash_outcome(&self, id: &str, outcome: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET outcome = ? WHERE id = ?")
            .bind(outcome)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::dispatch::PurchaseJob;

    fn job(attempt: &str) -> Job {
        Job::Purchase(PurchaseJob {
            attempt_id: attempt.into(),
            watch_item_id: "w1".into(),
            tenant_id: "t1".into(),
            retailer: "target".into(),
            product_locator: "https://www.target.com/p/-/A-1234567".into(),
            quantity: 1,
            price_ceiling: None,
        })
    }

    #[tokio::test]
    async fn same_dedup_key_yields_one_message() {
        let q = SqliteQueue::new(test_pool().await, 3);
        let first = q.enqueue(&job("a1"), "purchase:w1:7").await.unwrap();
        let second = q.enqueue(&job("a2"), "purchase:w1:7").await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(q.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_leases_and_ack_completes() {
        let q = SqliteQueue::new(test_pool().await, 3);
        let receipt = q.enqueue(&job("a1"), "k1").await.unwrap();

        let claimed = q.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, receipt.message_id);
        assert_eq!(claimed.attempts, 1);
        assert!(q.claim().await.unwrap().is_none());

        q.ack(&claimed.id).await.unwrap();
        assert_eq!(q.status_of(&claimed.id).await.unwrap().as_deref(), Some("done"));
        assert!(q.ack(&claimed.id).await.is_err());
    }

    #[tokio::test]
    async fn nack_retries_then_dead_letters() {
        let q = SqliteQueue::new(test_pool().await, 2).with_timings(900, 0);
        q.enqueue(&job("a1"), "k1").await.unwrap();

        let c = q.claim().await.unwrap().unwrap();
        assert!(matches!(q.nack(&c.id, "callback down").await.unwrap(), NackOutcome::Retrying { .. }));
        let c = q.claim().await.unwrap().unwrap();
        assert_eq!(c.attempts, 2);
        assert_eq!(q.nack(&c.id, "callback down").await.unwrap(), NackOutcome::DeadLettered);
        assert!(q.claim().await.unwrap().is_none());
        assert_eq!(q.status_of(&c.id).await.unwrap().as_deref(), Some("dead"));
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered() {
        let q = SqliteQueue::new(test_pool().await, 3).with_timings(0, 0);
        q.enqueue(&job("a1"), "k1").await.unwrap();
        let first = q.claim().await.unwrap().unwrap();
        let again = q.claim().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn stashed_outcome_survives_redelivery() {
        let q = SqliteQueue::new(test_pool().await, 3).with_timings(900, 0);
        q.enqueue(&job("a1"), "k1").await.unwrap();
        let c = q.claim().await.unwrap().unwrap();
        assert!(c.outcome.is_none());

        q.stash_outcome(&c.id, r#"{"status":"success"}"#).await.unwrap();
        q.nack(&c.id, "callback down").await.unwrap();
        let again = q.claim().await.unwrap().unwrap();
        assert_eq!(again.outcome.as_deref(), Some(r#"{"status":"success"}"#));
    }
}
