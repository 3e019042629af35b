use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::locks::LockStore;

/// Lock store shared between the scheduler process and the purchase worker.
/// Expiry timestamps are Unix milliseconds.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Remove expired counter units. Counters stay correct without this; it
    /// only bounds table growth.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = now_ms();
        let locks = sqlx::query("DELETE FROM locks WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let units = sqlx::query("DELETE FROM lock_counters WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(locks + units)
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        // The upsert only overwrites an expired row, so a live lock yields
        // zero affected rows.
        let affected = sqlx::query(
            r#"
            INSERT INTO locks (key, owner_token, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                owner_token = excluded.owner_token,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM locks WHERE key = ? AND owner_token = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn force_release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn counter_add(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = now_ms();
        sqlx::query("INSERT INTO lock_counters (key, expires_at) VALUES (?, ?)")
            .bind(key)
            .bind(now + ttl.as_millis() as i64)
            .execute(&self.pool)
            .await?;
        self.counter_value(key).await
    }

    async fn counter_value(&self, key: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM lock_counters WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_ms())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn live_lock_blocks_other_owner() {
        let store = SqliteLockStore::new(test_pool().await);
        assert!(store.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_acquire("k", "b", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_owner_checked_and_force_is_not() {
        let store = SqliteLockStore::new(test_pool().await);
        store.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap();
        assert!(!store.release("k", "b").await.unwrap());
        store.force_release("k").await.unwrap();
        assert!(store.try_acquire("k", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let store = SqliteLockStore::new(test_pool().await);
        store.try_acquire("k", "a", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_acquire("k", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn counters_decay() {
        let store = SqliteLockStore::new(test_pool().await);
        store.counter_add("c", Duration::from_millis(5)).await.unwrap();
        assert_eq!(store.counter_add("c", Duration::from_secs(60)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.counter_value("c").await.unwrap(), 1);
        assert!(store.purge_expired().await.unwrap() >= 1);
    }
}
