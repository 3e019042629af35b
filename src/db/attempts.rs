use sqlx::SqlitePool;

use crate::db::models::{PurchaseAttemptRow, PurchaseEventRow};
use crate::error::{AppError, Result};
use crate::types::{PurchaseAttempt, PurchaseOutcome, PurchaseStatus};

/// Result of applying a status report to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: PurchaseStatus },
    /// Attempt already terminal or further along; the report was a duplicate
    /// or arrived out of order.
    Ignored { current: PurchaseStatus },
}

/// Create an attempt in `detected` and append the first audit row.
pub async fn create(
    pool: &SqlitePool,
    tenant_id: &str,
    watch_item_id: &str,
    now: i64,
) -> Result<PurchaseAttempt> {
    let id = uuid::Uuid::new_v4().to_string();
    let status = PurchaseStatus::Detected.to_string();

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO purchase_attempts (id, tenant_id, watch_item_id, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(tenant_id)
    .bind(watch_item_id)
    .bind(&status)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO purchase_events (attempt_id, from_status, to_status, detail, created_at) VALUES (?, NULL, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&status)
    .bind("in stock and eligible")
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(PurchaseAttempt {
        id,
        tenant_id: tenant_id.to_string(),
        watch_item_id: watch_item_id.to_string(),
        status: PurchaseStatus::Detected,
        order_ref: None,
        total_price: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<PurchaseAttempt>> {
    let row = sqlx::query_as::<_, PurchaseAttemptRow>(
        r#"
        SELECT id, tenant_id, watch_item_id, status, order_ref, total_price,
               failure_reason, created_at, updated_at
        FROM purchase_attempts WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(PurchaseAttempt::from))
}

/// Apply a reported status. Progress never moves backwards. A final report
/// is recorded even when its status ranks below the progress already seen,
/// so a carted-but-unconfirmed ending always reaches the attempt. Once an
/// attempt is terminal, or closed as carted with a reason, later reports
/// return `Transition::Ignored`.
pub async fn apply(
    pool: &SqlitePool,
    id: &str,
    outcome: &PurchaseOutcome,
    final_report: bool,
    now: i64,
) -> Result<Transition> {
    let mut tx = pool.begin().await?;

    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT status, failure_reason FROM purchase_attempts WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let (current, reason) = row.ok_or_else(|| AppError::NotFound(format!("purchase attempt {id}")))?;
    let current = PurchaseStatus::parse(&current).unwrap_or(PurchaseStatus::Failed);

    let closed = current.is_terminal() || (current == PurchaseStatus::Carted && reason.is_some());
    let stale = closed || (!final_report && outcome.status.rank() <= current.rank());
    if stale {
        return Ok(Transition::Ignored { current });
    }

    sqlx::query(
        r#"
        UPDATE purchase_attempts
        SET status = ?,
            order_ref = COALESCE(?, order_ref),
            total_price = COALESCE(?, total_price),
            failure_reason = COALESCE(?, failure_reason),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(outcome.status.to_string())
    .bind(&outcome.order_ref)
    .bind(outcome.total_price)
    .bind(&outcome.failure_reason)
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    let detail = outcome
        .failure_reason
        .clone()
        .or_else(|| outcome.order_ref.as_ref().map(|r| format!("order {r}")));
    sqlx::query(
        "INSERT INTO purchase_events (attempt_id, from_status, to_status, detail, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(current.to_string())
    .bind(outcome.status.to_string())
    .bind(detail)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Transition::Applied { from: current })
}

/// Audit trail for one attempt, oldest first.
pub async fn events(pool: &SqlitePool, attempt_id: &str) -> Result<Vec<PurchaseEventRow>> {
    let rows = sqlx::query_as::<_, PurchaseEventRow>(
        r#"
        SELECT id, attempt_id, from_status, to_status, detail, created_at
        FROM purchase_events WHERE attempt_id = ? ORDER BY id ASC
        "#,
    )
    .bind(attempt_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// True if the item has a non-terminal attempt created at or after `since`.
pub async fn has_open_attempt(pool: &SqlitePool, watch_item_id: &str, since: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM purchase_attempts
        WHERE watch_item_id = ? AND created_at >= ?
          AND status NOT IN ('success', 'failed', 'cancelled')
        "#,
    )
    .bind(watch_item_id)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn progress(status: PurchaseStatus) -> PurchaseOutcome {
        PurchaseOutcome {
            status,
            order_ref: None,
            total_price: None,
            failure_reason: None,
            steps_completed: vec![],
        }
    }

    #[tokio::test]
    async fn transitions_are_audited_in_order() {
        let pool = test_pool().await;
        let attempt = create(&pool, "t1", "item1", 10).await.unwrap();

        apply(&pool, &attempt.id, &progress(PurchaseStatus::Carted), false, 11).await.unwrap();
        let done = PurchaseOutcome::success(Some("ORD-1".to_string()), Some(21.5), vec![]);
        let t = apply(&pool, &attempt.id, &done, true, 12).await.unwrap();
        assert_eq!(t, Transition::Applied { from: PurchaseStatus::Carted });

        let stored = get(&pool, &attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Success);
        assert_eq!(stored.order_ref.as_deref(), Some("ORD-1"));

        let trail: Vec<String> = events(&pool, &attempt.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.to_status)
            .collect();
        assert_eq!(trail, vec!["detected", "carted", "success"]);
    }

    #[tokio::test]
    async fn terminal_attempt_ignores_later_reports() {
        let pool = test_pool().await;
        let attempt = create(&pool, "t1", "item1", 10).await.unwrap();
        apply(&pool, &attempt.id, &PurchaseOutcome::failed("MFA required", vec![]), true, 11)
            .await
            .unwrap();

        let again = PurchaseOutcome::success(Some("ORD-2".to_string()), None, vec![]);
        let t = apply(&pool, &attempt.id, &again, true, 12).await.unwrap();
        assert_eq!(t, Transition::Ignored { current: PurchaseStatus::Failed });
        assert_eq!(events(&pool, &attempt.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let pool = test_pool().await;
        let attempt = create(&pool, "t1", "item1", 10).await.unwrap();
        apply(&pool, &attempt.id, &progress(PurchaseStatus::CheckoutStarted), false, 11)
            .await
            .unwrap();
        let t = apply(&pool, &attempt.id, &progress(PurchaseStatus::Carted), false, 12).await.unwrap();
        assert!(matches!(t, Transition::Ignored { .. }));
    }

    #[tokio::test]
    async fn final_carted_report_lands_after_further_progress() {
        let pool = test_pool().await;
        let attempt = create(&pool, "t1", "item1", 10).await.unwrap();
        apply(&pool, &attempt.id, &progress(PurchaseStatus::CheckoutPayment), false, 11)
            .await
            .unwrap();

        let ended = PurchaseOutcome::carted_unconfirmed("no confirmation page", vec![]);
        let t = apply(&pool, &attempt.id, &ended, true, 12).await.unwrap();
        assert_eq!(t, Transition::Applied { from: PurchaseStatus::CheckoutPayment });

        let stored = get(&pool, &attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Carted);
        assert_eq!(stored.failure_reason.as_deref(), Some("no confirmation page"));

        // Redelivered final report and late progress are both ignored.
        let again = apply(&pool, &attempt.id, &ended, true, 13).await.unwrap();
        assert_eq!(again, Transition::Ignored { current: PurchaseStatus::Carted });
        let late = apply(&pool, &attempt.id, &progress(PurchaseStatus::CheckoutPayment), false, 14)
            .await
            .unwrap();
        assert!(matches!(late, Transition::Ignored { .. }));
        assert_eq!(events(&pool, &attempt.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn open_attempt_detection_respects_window_and_status() {
        let pool = test_pool().await;
        let attempt = create(&pool, "t1", "item1", 100).await.unwrap();
        assert!(has_open_attempt(&pool, "item1", 50).await.unwrap());
        assert!(!has_open_attempt(&pool, "item1", 101).await.unwrap());

        apply(&pool, &attempt.id, &PurchaseOutcome::failed("x", vec![]), true, 102).await.unwrap();
        assert!(!has_open_attempt(&pool, "item1", 50).await.unwrap());
    }
}
