use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Watch items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    Notify,
    AutoPurchase,
}

impl WatchMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "auto_purchase" => WatchMode::AutoPurchase,
            _ => WatchMode::Notify,
        }
    }
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchMode::Notify => write!(f, "notify"),
            WatchMode::AutoPurchase => write!(f, "auto_purchase"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Unknown,
}

impl StockStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "in_stock" => StockStatus::InStock,
            "out_of_stock" => StockStatus::OutOfStock,
            _ => StockStatus::Unknown,
        }
    }
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StockStatus::InStock => "in_stock",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A tenant's monitoring target. Config fields belong to the tenant's CRUD
/// surface; `last_*` fields are written by the scheduler after a resolve.
#[derive(Debug, Clone, Serialize)]
pub struct WatchItem {
    pub id: String,
    pub tenant_id: String,
    pub retailer: String,
    pub product_locator: String,
    pub mode: WatchMode,
    /// Seconds between checks, before the tier minimum is applied.
    pub poll_interval_secs: i64,
    pub price_ceiling: Option<f64>,
    pub quantity: i64,
    pub active: bool,
    /// Unix seconds; None = never checked.
    pub last_checked_at: Option<i64>,
    pub last_status: StockStatus,
    pub last_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Stock snapshots
// ---------------------------------------------------------------------------

/// One resolution result. Never persisted as a whole; only the fields it
/// contributes to the owning WatchItem are written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub in_stock: bool,
    pub price: Option<f64>,
    pub display_name: String,
    pub image: Option<String>,
    /// Tier and label that decided availability, e.g. `structured:redsky:IN_STOCK`.
    pub raw_status: String,
}

impl StockSnapshot {
    pub fn status(&self) -> StockStatus {
        if self.in_stock {
            StockStatus::InStock
        } else {
            StockStatus::OutOfStock
        }
    }
}

// ---------------------------------------------------------------------------
// Purchase attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Detected,
    Carted,
    CheckoutStarted,
    CheckoutPayment,
    Success,
    Failed,
    Cancelled,
}

impl PurchaseStatus {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "detected" => PurchaseStatus::Detected,
            "carted" => PurchaseStatus::Carted,
            "checkout_started" => PurchaseStatus::CheckoutStarted,
            "checkout_payment" => PurchaseStatus::CheckoutPayment,
            "success" => PurchaseStatus::Success,
            "failed" => PurchaseStatus::Failed,
            "cancelled" => PurchaseStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseStatus::Success | PurchaseStatus::Failed | PurchaseStatus::Cancelled
        )
    }

    /// Position along the happy path; used to reject regressions from
    /// duplicate or reordered progress callbacks.
    pub fn rank(self) -> u8 {
        match self {
            PurchaseStatus::Detected => 0,
            PurchaseStatus::Carted => 1,
            PurchaseStatus::CheckoutStarted => 2,
            PurchaseStatus::CheckoutPayment => 3,
            PurchaseStatus::Success | PurchaseStatus::Failed | PurchaseStatus::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PurchaseStatus::Detected => "detected",
            PurchaseStatus::Carted => "carted",
            PurchaseStatus::CheckoutStarted => "checkout_started",
            PurchaseStatus::CheckoutPayment => "checkout_payment",
            PurchaseStatus::Success => "success",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseAttempt {
    pub id: String,
    pub tenant_id: String,
    pub watch_item_id: String,
    pub status: PurchaseStatus,
    pub order_ref: Option<String>,
    pub total_price: Option<f64>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result contract reported by the worker for one purchase execution.
///
/// `status` is normally terminal. `carted` as a final report means the flow
/// stopped with the item in the cart and no confirmed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOutcome {
    pub status: PurchaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub steps_completed: Vec<String>,
}

impl PurchaseOutcome {
    pub fn success(order_ref: Option<String>, total_price: Option<f64>, steps: Vec<String>) -> Self {
        Self {
            status: PurchaseStatus::Success,
            order_ref,
            total_price,
            failure_reason: None,
            steps_completed: steps,
        }
    }

    pub fn failed(reason: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            status: PurchaseStatus::Failed,
            order_ref: None,
            total_price: None,
            failure_reason: Some(reason.into()),
            steps_completed: steps,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: PurchaseStatus::Cancelled,
            order_ref: None,
            total_price: None,
            failure_reason: Some(reason.into()),
            steps_completed: vec![],
        }
    }

    pub fn carted_unconfirmed(reason: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            status: PurchaseStatus::Carted,
            order_ref: None,
            total_price: None,
            failure_reason: Some(reason.into()),
            steps_completed: steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    RestockDetected,
    ResolutionFailed,
    PurchaseTriggered,
    PurchaseBlocked,
    PurchaseProgress,
    PurchaseSucceeded,
    PurchaseFailed,
    PurchaseNeedsReview,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityKind::RestockDetected => "restock_detected",
            ActivityKind::ResolutionFailed => "resolution_failed",
            ActivityKind::PurchaseTriggered => "purchase_triggered",
            ActivityKind::PurchaseBlocked => "purchase_blocked",
            ActivityKind::PurchaseProgress => "purchase_progress",
            ActivityKind::PurchaseSucceeded => "purchase_succeeded",
            ActivityKind::PurchaseFailed => "purchase_failed",
            ActivityKind::PurchaseNeedsReview => "purchase_needs_review",
        };
        write!(f, "{s}")
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(PurchaseStatus::Success.is_terminal());
        assert!(PurchaseStatus::Failed.is_terminal());
        assert!(PurchaseStatus::Cancelled.is_terminal());
        assert!(!PurchaseStatus::Carted.is_terminal());
        assert!(!PurchaseStatus::Detected.is_terminal());
    }

    #[test]
    fn status_text_round_trips_through_parse() {
        for s in [
            PurchaseStatus::Detected,
            PurchaseStatus::CheckoutStarted,
            PurchaseStatus::CheckoutPayment,
            PurchaseStatus::Cancelled,
        ] {
            assert_eq!(PurchaseStatus::parse(&s.to_string()), Some(s));
        }
        assert_eq!(PurchaseStatus::parse("shipped"), None);
    }

    #[test]
    fn outcome_serializes_result_contract_shape() {
        let outcome = PurchaseOutcome::failed("MFA required", vec!["login".to_string()]);
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["failure_reason"], "MFA required");
        assert!(v.get("order_ref").is_none());
        assert_eq!(v["steps_completed"][0], "login");
    }
}
