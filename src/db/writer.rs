use tokio::sync::mpsc;
use tracing::error;

use crate::db::activity::{self, ActivityEvent};

/// Receives ActivityEvents and appends them to the activity log.
/// Runs as a dedicated background task so the scheduling path never waits on SQLite.
pub struct ActivityWriter {
    pool: sqlx::SqlitePool,
    activity_rx: mpsc::Receiver<ActivityEvent>,
}

impl ActivityWriter {
    pub fn new(pool: sqlx::SqlitePool, activity_rx: mpsc::Receiver<ActivityEvent>) -> Self {
        Self { pool, activity_rx }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.activity_rx.recv().await {
            if let Err(e) = activity::insert(&self.pool, &event).await {
                error!(
                    item_id = %event.watch_item_id,
                    kind = %event.kind,
                    "Activity write error: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::activity::{list_for_item, ActivityLog};
    use crate::db::test_pool;
    use crate::types::ActivityKind;

    #[tokio::test]
    async fn writer_persists_recorded_events() {
        let pool = test_pool().await;
        let (tx, rx) = mpsc::channel(8);
        let log = ActivityLog::new(tx);

        log.record("item1", "t1", ActivityKind::RestockDetected, "back in stock at $10.00");
        log.record("item1", "t1", ActivityKind::PurchaseTriggered, "attempt a1");
        drop(log);

        // Channel closes once every sender is gone, so run() returns.
        ActivityWriter::new(pool.clone(), rx).run().await;

        let rows = list_for_item(&pool, "item1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "purchase_triggered");
        assert_eq!(rows[1].kind, "restock_detected");
    }
}
