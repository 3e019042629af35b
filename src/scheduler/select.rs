//! Due-item selection and fair interleaving across tenants.

use std::collections::{HashMap, VecDeque};

use crate::types::WatchItem;

/// Never-checked items are always due; otherwise the configured interval
/// applies, raised to the tier minimum.
pub fn is_due(item: &WatchItem, now: i64, min_poll_secs: i64) -> bool {
    match item.last_checked_at {
        None => true,
        Some(last) => now - last >= item.poll_interval_secs.max(min_poll_secs),
    }
}

/// Round-robin across tenants in order of each tenant's first appearance.
/// Each tenant's own order is preserved, so oldest-first input stays
/// oldest-first per tenant.
pub fn fair_interleave(items: Vec<WatchItem>, per_tenant: usize, total: usize) -> Vec<WatchItem> {
    let mut order: Vec<String> = Vec::new();
    let mut queues: HashMap<String, VecDeque<WatchItem>> = HashMap::new();
    for item in items {
        let q = queues.entry(item.tenant_id.clone()).or_insert_with(|| {
            order.push(item.tenant_id.clone());
            VecDeque::new()
        });
        if q.len() < per_tenant {
            q.push_back(item);
        }
    }

    let mut out = Vec::new();
    while out.len() < total {
        let mut progressed = false;
        for tenant in &order {
            if out.len() >= total {
                break;
            }
            if let Some(item) = queues.get_mut(tenant).and_then(VecDeque::pop_front) {
                out.push(item);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}
