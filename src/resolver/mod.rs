//! Stock and price resolution over ranked, independently failable sources.
//!
//! Preference order: structured fulfillment signal, then a structured price
//! with no out-of-stock marker (inferred), then embedded page state, page
//! metadata and finally text heuristics.

pub mod fetch;
pub mod html;
pub mod latency;
pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SOURCE_TIMEOUT_SECS;
use crate::error::{AppError, Result};
use crate::retailers::{adapter_for, SourceSpec};
use crate::types::StockSnapshot;

use fetch::{HttpFetch, SourceError};
use latency::LatencyStats;
use probe::Probe;

const PAGE_SOURCE: &str = "page";

#[derive(Clone)]
pub struct Resolver {
    fetch: Arc<dyn HttpFetch>,
    latency: Arc<LatencyStats>,
    api_keys: HashMap<String, String>,
    source_timeout: Duration,
}

impl Resolver {
    pub fn new(
        fetch: Arc<dyn HttpFetch>,
        latency: Arc<LatencyStats>,
        api_keys: HashMap<String, String>,
    ) -> Self {
        Self {
            fetch,
            latency,
            api_keys,
            source_timeout: Duration::from_secs(SOURCE_TIMEOUT_SECS),
        }
    }

    pub fn latency(&self) -> &Arc<LatencyStats> {
        &self.latency
    }

    /// Best-effort snapshot for a product URL. Errors only when every source,
    /// including the page fallback, is exhausted.
    pub async fn resolve(&self, locator: &str) -> Result<StockSnapshot> {
        let adapter = adapter_for(locator).ok_or_else(|| AppError::Resolution {
            locator: locator.to_string(),
            reason: "unsupported product locator".to_string(),
        })?;
        let (sources, page_url) = match adapter.extract_id(locator) {
            Some(id) => (
                adapter.sources(&id, self.api_keys.get(adapter.key()).map(String::as_str)),
                adapter.page_url(locator, &id),
            ),
            None => (Vec::new(), locator.to_string()),
        };
        self.resolve_ranked(locator, &sources, &page_url).await
    }

    pub async fn resolve_ranked(
        &self,
        locator: &str,
        sources: &[SourceSpec],
        page_url: &str,
    ) -> Result<StockSnapshot> {
        let mut decided: Option<(bool, String)> = None;
        let mut richest: Option<(usize, Probe)> = None;
        let mut priced_by: Option<&'static str> = None;
        let mut saw_out_marker = false;
        let mut failures = Vec::new();

        for source in sources {
            let payload = match self.timed(source.name, self.fetch.get_json(&source.url)).await {
                Ok(v) => v,
                Err(e) => {
                    debug!(source = source.name, locator, "[RESOLVE] Source failed: {e}");
                    failures.push(format!("{}: {e}", source.name));
                    continue;
                }
            };

            let found = probe::probe(&payload);
            saw_out_marker |= found.has_out_of_stock_marker();
            if priced_by.is_none() && found.price.is_some() {
                priced_by = Some(source.name);
            }
            if decided.is_none() {
                if let Some(m) = found.availability() {
                    decided = Some((m.in_stock, format!("structured:{}:{}", source.name, m.label)));
                }
            }
            richest = Some(match richest.take() {
                Some((score, mut best)) if score >= found.richness() => {
                    best.backfill(&found);
                    (score, best)
                }
                Some((_, previous)) => {
                    let score = found.richness();
                    let mut best = found;
                    best.backfill(&previous);
                    (score, best)
                }
                None => (found.richness(), found),
            });

            if decided.is_some() && richest.as_ref().is_some_and(|(score, _)| *score == 3) {
                break;
            }
        }

        let fields = richest.map(|(_, p)| p).unwrap_or_default();

        if let Some((in_stock, raw_status)) = decided {
            return Ok(snapshot(locator, in_stock, raw_status, fields));
        }

        if let (Some(source), false) = (priced_by, saw_out_marker) {
            info!(locator, source, "[RESOLVE] No fulfillment signal; live price implies in stock");
            return Ok(snapshot(locator, true, format!("inferred:{source}"), fields));
        }

        match self.timed(PAGE_SOURCE, self.fetch.get_text(page_url)).await {
            Ok(page) => {
                if let Some(mut finding) = html::extract(&page) {
                    let mut merged = fields;
                    merged.backfill(&finding.fields);
                    finding.fields = merged;
                    return Ok(snapshot(locator, finding.in_stock, finding.raw_status, finding.fields));
                }
                failures.push(format!("{PAGE_SOURCE}: no availability signal"));
            }
            Err(e) => failures.push(format!("{PAGE_SOURCE}: {e}")),
        }

        warn!(locator, attempts = failures.len(), "[RESOLVE] All sources exhausted");
        Err(AppError::Resolution {
            locator: locator.to_string(),
            reason: failures.join("; "),
        })
    }

    /// Apply the per-source time bound and record latency.
    async fn timed<T>(
        &self,
        source: &str,
        call: impl std::future::Future<Output = std::result::Result<T, SourceError>>,
    ) -> std::result::Result<T, SourceError> {
        let started = Instant::now();
        let out = match tokio::time::timeout(self.source_timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::Timeout),
        };
        self.latency.record(source, started.elapsed());
        out
    }
}

fn snapshot(locator: &str, in_stock: bool, raw_status: String, fields: Probe) -> StockSnapshot {
    StockSnapshot {
        in_stock,
        price: fields.price,
        display_name: fields.name.unwrap_or_else(|| locator.to_string()),
        image: fields.image,
        raw_status,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::fetch::{HttpFetch, SourceError};

    /// Canned responses by URL; unknown URLs answer 404.
    #[derive(Default)]
    pub struct FakeFetch {
        pub json: HashMap<String, std::result::Result<Value, SourceError>>,
        pub pages: HashMap<String, std::result::Result<String, SourceError>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeFetch {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpFetch for FakeFetch {
        async fn get_json(&self, url: &str) -> std::result::Result<Value, SourceError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.json.get(url).cloned().unwrap_or(Err(SourceError::Status(404)))
        }

        async fn get_text(&self, url: &str) -> std::result::Result<String, SourceError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().unwrap_or(Err(SourceError::Status(404)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeFetch;
    use super::*;
    use serde_json::json;

    fn source(name: &'static str) -> SourceSpec {
        SourceSpec { name, url: format!("https://api.example/{name}") }
    }

    fn resolver(fetch: FakeFetch) -> (Resolver, Arc<FakeFetch>) {
        let fetch = Arc::new(fetch);
        let r = Resolver::new(fetch.clone(), Arc::new(LatencyStats::new()), HashMap::new());
        (r, fetch)
    }

    #[tokio::test]
    async fn price_without_fulfillment_infers_in_stock() {
        let mut fake = FakeFetch::default();
        fake.json.insert("https://api.example/a".into(), Err(SourceError::Timeout));
        fake.json.insert("https://api.example/b".into(), Err(SourceError::RateLimited));
        fake.json.insert("https://api.example/c".into(), Err(SourceError::Status(500)));
        fake.json.insert("https://api.example/d".into(), Ok(json!({ "price": 19.99 })));
        let (r, fetch) = resolver(fake);

        let sources = [source("a"), source("b"), source("c"), source("d")];
        let snap = r.resolve_ranked("https://shop.example/p/1", &sources, "https://shop.example/p/1").await.unwrap();

        assert!(snap.in_stock);
        assert_eq!(snap.price, Some(19.99));
        assert!(snap.raw_status.contains("inferred"));
        assert!(!fetch.calls().iter().any(|c| c.starts_with("https://shop.example")));
    }

    #[tokio::test]
    async fn availability_from_first_signal_fields_from_richest() {
        let mut fake = FakeFetch::default();
        fake.json.insert(
            "https://api.example/fulfillment".into(),
            Ok(json!({ "shipping": { "availability_status": "OUT_OF_STOCK" } })),
        );
        fake.json.insert(
            "https://api.example/pdp".into(),
            Ok(json!({ "availability_status": "IN_STOCK", "title": "Card Pack",
                       "price": "$4.99", "image_url": "https://img/p.png" })),
        );
        let (r, _) = resolver(fake);

        let snap = r
            .resolve_ranked("https://shop.example/p/2", &[source("fulfillment"), source("pdp")], "https://shop.example/p/2")
            .await
            .unwrap();
        assert!(!snap.in_stock);
        assert_eq!(snap.raw_status, "structured:fulfillment:OUT_OF_STOCK");
        assert_eq!(snap.display_name, "Card Pack");
        assert_eq!(snap.price, Some(4.99));
    }

    #[tokio::test]
    async fn explicit_out_of_stock_blocks_price_inference() {
        let mut fake = FakeFetch::default();
        fake.json.insert(
            "https://api.example/mixed".into(),
            Ok(json!({ "a": { "stock_status": "OUT_OF_STOCK" }, "b": { "stock_status": "IN_STOCK" }, "price": 5 })),
        );
        fake.pages.insert("https://shop.example/p/3".into(), Ok("<div>Sold out</div>".into()));
        let (r, _) = resolver(fake);

        let snap = r
            .resolve_ranked("https://shop.example/p/3", &[source("mixed")], "https://shop.example/p/3")
            .await
            .unwrap();
        assert!(!snap.in_stock);
        assert_eq!(snap.raw_status, "text:sold out");
        assert_eq!(snap.price, Some(5.0));
    }

    #[tokio::test]
    async fn exhausted_sources_error_and_record_latency() {
        let (r, _) = resolver(FakeFetch::default());
        let err = r
            .resolve_ranked("https://shop.example/p/4", &[source("a")], "https://shop.example/p/4")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Resolution { .. }));
        let sources: Vec<String> = r.latency().summaries().into_iter().map(|s| s.source).collect();
        assert_eq!(sources, vec!["a", "page"]);
    }

    #[tokio::test]
    async fn generic_locator_goes_straight_to_the_page() {
        let mut fake = FakeFetch::default();
        fake.pages.insert(
            "https://shop.example/products/widget".into(),
            Ok(r#"<meta property="og:availability" content="in stock"><meta property="og:title" content="Widget">"#.into()),
        );
        let (r, fetch) = resolver(fake);

        let snap = r.resolve("https://shop.example/products/widget").await.unwrap();
        assert!(snap.in_stock);
        assert_eq!(snap.raw_status, "metadata:IN_STOCK");
        assert_eq!(snap.display_name, "Widget");
        assert_eq!(fetch.calls().len(), 1);
    }
}
