use sqlx::SqlitePool;

use crate::db::models::WatchItemRow;
use crate::error::Result;
use crate::types::{StockSnapshot, WatchItem};

const SELECT_COLUMNS: &str = r#"
    SELECT id, tenant_id, retailer, product_locator, mode, poll_interval_secs,
           price_ceiling, quantity, active, last_checked_at, last_status, last_price
    FROM watch_items
"#;

/// All active watch items, oldest-checked first (never-checked first of all).
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<WatchItem>> {
    let sql = format!(
        "{SELECT_COLUMNS} WHERE active = 1 ORDER BY last_checked_at IS NOT NULL, last_checked_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, WatchItemRow>(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(WatchItem::from).collect())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<WatchItem>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
    let row = sqlx::query_as::<_, WatchItemRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(WatchItem::from))
}

/// Insert or replace a watch item. The tenant CRUD surface owns these rows;
/// this exists for seeding and tests.
pub async fn upsert(pool: &SqlitePool, item: &WatchItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO watch_items (
            id, tenant_id, retailer, product_locator, mode, poll_interval_secs,
            price_ceiling, quantity, active, last_checked_at, last_status, last_price
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            tenant_id = excluded.tenant_id,
            retailer = excluded.retailer,
            product_locator = excluded.product_locator,
            mode = excluded.mode,
            poll_interval_secs = excluded.poll_interval_secs,
            price_ceiling = excluded.price_ceiling,
            quantity = excluded.quantity,
            active = excluded.active,
            last_checked_at = excluded.last_checked_at,
            last_status = excluded.last_status,
            last_price = excluded.last_price
        "#,
    )
    .bind(&item.id)
    .bind(&item.tenant_id)
    .bind(&item.retailer)
    .bind(&item.product_locator)
    .bind(item.mode.to_string())
    .bind(item.poll_interval_secs)
    .bind(item.price_ceiling)
    .bind(item.quantity)
    .bind(i64::from(item.active))
    .bind(item.last_checked_at)
    .bind(item.last_status.to_string())
    .bind(item.last_price)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write the resolver-owned fields of one item in a single statement, so a
/// reader never observes a half-updated item.
pub async fn record_snapshot(
    pool: &SqlitePool,
    id: &str,
    snapshot: &StockSnapshot,
    checked_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE watch_items
        SET last_checked_at = ?, last_status = ?, last_price = COALESCE(?, last_price)
        WHERE id = ?
        "#,
    )
    .bind(checked_at)
    .bind(snapshot.status().to_string())
    .bind(snapshot.price)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Advance `last_checked_at` only, leaving status and price untouched.
/// Used when resolution was exhausted for this item.
pub async fn touch_checked(pool: &SqlitePool, id: &str, checked_at: i64) -> Result<()> {
    sqlx::query("UPDATE watch_items SET last_checked_at = ? WHERE id = ?")
        .bind(checked_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
pub fn test_item(id: &str, tenant: &str, locator: &str) -> WatchItem {
    use crate::types::{StockStatus, WatchMode};
    WatchItem {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        retailer: "target".to_string(),
        product_locator: locator.to_string(),
        mode: WatchMode::Notify,
        poll_interval_secs: 300,
        price_ceiling: None,
        quantity: 1,
        active: true,
        last_checked_at: None,
        last_status: StockStatus::Unknown,
        last_price: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::StockStatus;

    #[tokio::test]
    async fn list_active_orders_never_checked_first_then_oldest() {
        let pool = test_pool().await;
        let mut a = test_item("a", "t1", "https://x/a");
        a.last_checked_at = Some(200);
        let mut b = test_item("b", "t1", "https://x/b");
        b.last_checked_at = Some(100);
        let c = test_item("c", "t2", "https://x/c");
        let mut d = test_item("d", "t2", "https://x/d");
        d.active = false;
        for item in [&a, &b, &c, &d] {
            upsert(&pool, item).await.unwrap();
        }

        let ids: Vec<String> = list_active(&pool).await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn record_snapshot_updates_status_fields_together() {
        let pool = test_pool().await;
        upsert(&pool, &test_item("a", "t1", "https://x/a")).await.unwrap();

        let snap = StockSnapshot {
            in_stock: true,
            price: Some(19.99),
            display_name: "Thing".to_string(),
            image: None,
            raw_status: "structured:api:IN_STOCK".to_string(),
        };
        record_snapshot(&pool, "a", &snap, 1_000).await.unwrap();

        let item = get(&pool, "a").await.unwrap().unwrap();
        assert_eq!(item.last_checked_at, Some(1_000));
        assert_eq!(item.last_status, StockStatus::InStock);
        assert_eq!(item.last_price, Some(19.99));
    }

    #[tokio::test]
    async fn touch_checked_leaves_status_alone() {
        let pool = test_pool().await;
        let mut item = test_item("a", "t1", "https://x/a");
        item.last_status = StockStatus::OutOfStock;
        item.last_price = Some(5.0);
        upsert(&pool, &item).await.unwrap();

        touch_checked(&pool, "a", 42).await.unwrap();

        let item = get(&pool, "a").await.unwrap().unwrap();
        assert_eq!(item.last_checked_at, Some(42));
        assert_eq!(item.last_status, StockStatus::OutOfStock);
        assert_eq!(item.last_price, Some(5.0));
    }
}
