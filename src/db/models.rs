/// Database row types matching `migrations/0001_init.sql`.
/// Used by sqlx for typed queries.
use crate::types::{PurchaseAttempt, PurchaseStatus, StockStatus, WatchItem, WatchMode};

#[derive(Debug, sqlx::FromRow)]
pub struct WatchItemRow {
    pub id: String,
    pub tenant_id: String,
    pub retailer: String,
    pub product_locator: String,
    pub mode: String,
    pub poll_interval_secs: i64,
    pub price_ceiling: Option<f64>,
    pub quantity: i64,
    pub active: i64,
    pub last_checked_at: Option<i64>,
    pub last_status: String,
    pub last_price: Option<f64>,
}

impl From<WatchItemRow> for WatchItem {
    fn from(r: WatchItemRow) -> Self {
        WatchItem {
            id: r.id,
            tenant_id: r.tenant_id,
            retailer: r.retailer,
            product_locator: r.product_locator,
            mode: WatchMode::parse(&r.mode),
            poll_interval_secs: r.poll_interval_secs,
            price_ceiling: r.price_ceiling,
            quantity: r.quantity.max(1),
            active: r.active != 0,
            last_checked_at: r.last_checked_at,
            last_status: StockStatus::parse(&r.last_status),
            last_price: r.last_price,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PurchaseAttemptRow {
    pub id: String,
    pub tenant_id: String,
    pub watch_item_id: String,
    pub status: String,
    pub order_ref: Option<String>,
    pub total_price: Option<f64>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<PurchaseAttemptRow> for PurchaseAttempt {
    fn from(r: PurchaseAttemptRow) -> Self {
        PurchaseAttempt {
            id: r.id,
            tenant_id: r.tenant_id,
            watch_item_id: r.watch_item_id,
            // Rows are only ever written from the enum; an unknown value means
            // a foreign writer, which is treated as a dead attempt.
            status: PurchaseStatus::parse(&r.status).unwrap_or(PurchaseStatus::Failed),
            order_ref: r.order_ref,
            total_price: r.total_price,
            failure_reason: r.failure_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct PurchaseEventRow {
    pub id: i64,
    pub attempt_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub detail: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ActivityRow {
    pub id: i64,
    pub watch_item_id: String,
    pub tenant_id: String,
    pub kind: String,
    pub message: String,
    pub created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PlaybookRow {
    pub id: String,
    pub retailer: String,
    pub version: i64,
    pub steps: String,
    pub success_count: i64,
    pub fail_count: i64,
    pub consecutive_failures: i64,
    pub active: i64,
    pub recorded_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub body: String,
    pub dedup_key: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub visible_at: i64,
    pub last_error: Option<String>,
    pub outcome: Option<String>,
    pub created_at: i64,
}
