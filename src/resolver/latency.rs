//! Per-source resolution latency. The resolver records, the API reads.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

/// Upper bound of the tracked range (ms); longer samples are clamped.
const MAX_TRACKED_MS: u64 = 120_000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub source: String,
    pub samples: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

#[derive(Default)]
pub struct LatencyStats {
    by_source: Mutex<BTreeMap<String, Histogram<u64>>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &str, elapsed: Duration) {
        let ms = (elapsed.as_millis() as u64).clamp(1, MAX_TRACKED_MS);
        let Ok(mut map) = self.by_source.lock() else {
            return;
        };
        if !map.contains_key(source) {
            let Ok(h) = Histogram::new_with_bounds(1, MAX_TRACKED_MS, 3) else {
                return;
            };
            map.insert(source.to_string(), h);
        }
        if let Some(h) = map.get_mut(source) {
            let _ = h.record(ms);
        }
    }

    /// One summary per source that has samples, ordered by source name.
    pub fn summaries(&self) -> Vec<LatencySummary> {
        let Ok(map) = self.by_source.lock() else {
            return Vec::new();
        };
        map.iter()
            .filter(|(_, h)| h.len() > 0)
            .map(|(source, h)| LatencySummary {
                source: source.clone(),
                samples: h.len(),
                p50_ms: h.value_at_quantile(0.5),
                p95_ms: h.value_at_quantile(0.95),
                p99_ms: h.value_at_quantile(0.99),
                max_ms: h.max(),
            })
            .collect()
    }
}
