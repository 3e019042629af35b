use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::warn;

use crate::db::models::ActivityRow;
use crate::error::Result;
use crate::types::{now_secs, ActivityKind};

/// One activity-log entry, queued for the background writer.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub watch_item_id: String,
    pub tenant_id: String,
    pub kind: ActivityKind,
    pub message: String,
    pub created_at: i64,
}

/// Cloneable handle used by the scheduler and the callback sink to append
/// activity rows without waiting on the database.
#[derive(Clone)]
pub struct ActivityLog {
    tx: mpsc::Sender<ActivityEvent>,
}

impl ActivityLog {
    pub fn new(tx: mpsc::Sender<ActivityEvent>) -> Self {
        Self { tx }
    }

    pub fn record(
        &self,
        watch_item_id: &str,
        tenant_id: &str,
        kind: ActivityKind,
        message: impl Into<String>,
    ) {
        let event = ActivityEvent {
            watch_item_id: watch_item_id.to_string(),
            tenant_id: tenant_id.to_string(),
            kind,
            message: message.into(),
            created_at: now_secs(),
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!("activity channel full, dropping {kind} for {watch_item_id}: {e}");
        }
    }
}

pub async fn insert(pool: &SqlitePool, e: &ActivityEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO activity_log (watch_item_id, tenant_id, kind, message, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&e.watch_item_id)
    .bind(&e.tenant_id)
    .bind(e.kind.to_string())
    .bind(&e.message)
    .bind(e.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent activity for one watch item, newest first.
pub async fn list_for_item(pool: &SqlitePool, watch_item_id: &str, limit: i64) -> Result<Vec<ActivityRow>> {
    let rows = sqlx::query_as::<_, ActivityRow>(
        r#"
        SELECT id, watch_item_id, tenant_id, kind, message, created_at
        FROM activity_log WHERE watch_item_id = ?
        ORDER BY id DESC LIMIT ?
        "#,
    )
    .bind(watch_item_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
