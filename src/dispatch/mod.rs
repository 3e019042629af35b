//! Hand-off of slow purchase execution to the out-of-process worker over a
//! durable at-least-once queue.

pub mod queue;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use queue::{EnqueueReceipt, JobQueue, SqliteQueue};

/// Everything the worker needs to execute one purchase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseJob {
    pub attempt_id: String,
    pub watch_item_id: String,
    pub tenant_id: String,
    pub retailer: String,
    pub product_locator: String,
    pub quantity: i64,
    pub price_ceiling: Option<f64>,
}

/// Job bodies, tagged by kind. Decoding is exhaustive: an unknown kind is a
/// decode error and the job is dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Purchase(PurchaseJob),
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Purchase(_) => "purchase",
        }
    }
}

/// Deterministic key collapsing repeat triggers for one item inside one
/// time bucket.
pub fn purchase_dedup_key(watch_item_id: &str, now: i64, window_secs: i64) -> String {
    let bucket = now.div_euclid(window_secs.max(1));
    format!("purchase:{watch_item_id}:{bucket}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_wire_shape_is_flat_and_tagged() {
        let job = Job::Purchase(PurchaseJob {
            attempt_id: "a1".into(),
            watch_item_id: "w1".into(),
            tenant_id: "t1".into(),
            retailer: "target".into(),
            product_locator: "https://www.target.com/p/-/A-1234567".into(),
            quantity: 2,
            price_ceiling: Some(49.99),
        });
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["kind"], "purchase");
        assert_eq!(v["attempt_id"], "a1");
        assert_eq!(serde_json::from_value::<Job>(v).unwrap(), job);

        assert!(serde_json::from_str::<Job>(r#"{"kind":"refund","attempt_id":"a1"}"#).is_err());
    }

    #[test]
    fn dedup_key_buckets_by_window() {
        assert_eq!(purchase_dedup_key("w1", 1_000, 300), "purchase:w1:3");
        assert_eq!(purchase_dedup_key("w1", 1_199, 300), "purchase:w1:3");
        assert_eq!(purchase_dedup_key("w1", 1_200, 300), "purchase:w1:4");
    }
}
