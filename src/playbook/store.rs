use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::PLAYBOOK_MAX_CONSECUTIVE_FAILURES;
use crate::db::models::PlaybookRow;
use crate::error::{AppError, Result};
use crate::playbook::actions::Action;

#[derive(Debug, Clone)]
pub struct Playbook {
    pub id: String,
    pub retailer: String,
    pub version: i64,
    pub steps: Vec<Action>,
    pub success_count: i64,
    pub fail_count: i64,
    pub consecutive_failures: i64,
    pub active: bool,
    pub recorded_at: i64,
}

impl TryFrom<PlaybookRow> for Playbook {
    type Error = AppError;

    fn try_from(r: PlaybookRow) -> Result<Self> {
        Ok(Playbook {
            steps: serde_json::from_str(&r.steps)?,
            id: r.id,
            retailer: r.retailer,
            version: r.version,
            success_count: r.success_count,
            fail_count: r.fail_count,
            consecutive_failures: r.consecutive_failures,
            active: r.active != 0,
            recorded_at: r.recorded_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, retailer, version, steps, success_count, fail_count,
           consecutive_failures, active, recorded_at
    FROM playbooks
"#;

/// Versioned, retailer-scoped playbooks. One active version per retailer,
/// enforced both here and by a partial unique index.
#[derive(Clone)]
pub struct PlaybookStore {
    pool: SqlitePool,
}

impl PlaybookStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deactivate every prior version and insert `steps` as the next version,
    /// active, in one transaction.
    pub async fn save(&self, retailer: &str, steps: &[Action], now: i64) -> Result<Playbook> {
        let body = serde_json::to_string(steps)?;
        let id = uuid::Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE playbooks SET active = 0 WHERE retailer = ? AND active = 1")
            .bind(retailer)
            .execute(&mut *tx)
            .await?;
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) + 1 FROM playbooks WHERE retailer = ?")
                .bind(retailer)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO playbooks (id, retailer, version, steps, active, recorded_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&id)
        .bind(retailer)
        .bind(version)
        .bind(&body)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(retailer, version, steps = steps.len(), "[PLAYBOOK] Recorded new version");
        Ok(Playbook {
            id,
            retailer: retailer.to_string(),
            version,
            steps: steps.to_vec(),
            success_count: 0,
            fail_count: 0,
            consecutive_failures: 0,
            active: true,
            recorded_at: now,
        })
    }

    pub async fn active_for(&self, retailer: &str) -> Result<Option<Playbook>> {
        let sql = format!("{SELECT_COLUMNS} WHERE retailer = ? AND active = 1");
        let row = sqlx::query_as::<_, PlaybookRow>(&sql)
            .bind(retailer)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Playbook::try_from).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<Playbook>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row = sqlx::query_as::<_, PlaybookRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Playbook::try_from).transpose()
    }

    pub async fn record_success(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE playbooks SET success_count = success_count + 1, consecutive_failures = 0 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failed replay. Returns true when this failure deactivated the
    /// playbook.
    pub async fn record_failure(&self, id: &str) -> Result<bool> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE playbooks
            SET fail_count = fail_count + 1,
                consecutive_failures = consecutive_failures + 1,
                active = CASE WHEN consecutive_failures + 1 >= ? THEN 0 ELSE active END
            WHERE id = ?
            RETURNING consecutive_failures, active
            "#,
        )
        .bind(PLAYBOOK_MAX_CONSECUTIVE_FAILURES)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((streak, 0)) if streak == PLAYBOOK_MAX_CONSECUTIVE_FAILURES => {
                warn!(playbook = %id, streak, "[PLAYBOOK] Deactivated after consecutive replay failures");
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("playbook {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn steps(n: usize) -> Vec<Action> {
        (0..n)
            .map(|i| Action::Navigate { url: format!("https://shop.example/{i}") })
            .collect()
    }

    #[tokio::test]
    async fn save_keeps_one_active_version_per_retailer() {
        let store = PlaybookStore::new(test_pool().await);
        let v1 = store.save("target", &steps(2), 1).await.unwrap();
        let v2 = store.save("target", &steps(3), 2).await.unwrap();
        let other = store.save("walmart", &steps(1), 3).await.unwrap();

        assert_eq!((v1.version, v2.version, other.version), (1, 2, 1));
        let active = store.active_for("target").await.unwrap().unwrap();
        assert_eq!(active.id, v2.id);
        assert_eq!(active.steps.len(), 3);
        assert!(!store.get(&v1.id).await.unwrap().unwrap().active);
        assert!(store.get(&other.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn three_consecutive_failures_deactivate() {
        let store = PlaybookStore::new(test_pool().await);
        let pb = store.save("target", &steps(2), 1).await.unwrap();

        assert!(!store.record_failure(&pb.id).await.unwrap());
        assert!(!store.record_failure(&pb.id).await.unwrap());
        assert!(store.record_failure(&pb.id).await.unwrap());

        let stored = store.get(&pb.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.fail_count, 3);
        assert!(store.active_for("target").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let store = PlaybookStore::new(test_pool().await);
        let pb = store.save("target", &steps(2), 1).await.unwrap();

        store.record_failure(&pb.id).await.unwrap();
        store.record_failure(&pb.id).await.unwrap();
        store.record_success(&pb.id).await.unwrap();
        assert!(!store.record_failure(&pb.id).await.unwrap());

        let stored = store.get(&pb.id).await.unwrap().unwrap();
        assert!(stored.active);
        assert_eq!((stored.success_count, stored.fail_count, stored.consecutive_failures), (1, 3, 1));
    }
}
