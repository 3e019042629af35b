//! Unstructured page extraction: embedded state blobs, then structured
//! metadata, then literal text heuristics.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::resolver::probe::{classify_status, decode_entities, parse_price, probe, Probe};

static NEXT_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]*id=["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).expect("valid next data regex")
});

static WINDOW_STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)window\.(__PRELOADED_STATE__|__INITIAL_STATE__|__APOLLO_STATE__)\s*=\s*(.*?)</script>")
        .expect("valid window state regex")
});

static JSON_LD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]*type=["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .expect("valid json-ld regex")
});

static META_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<(?:meta|link)\s[^>]*>").expect("valid meta regex"));

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)([a-z:_-]+)\s*=\s*["']([^"']*)["']"#).expect("valid attribute regex"));

static STRIP_BLOCKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").expect("valid block regex"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag regex"));

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

const OUT_OF_STOCK_PHRASES: &[&str] = &[
    "out of stock",
    "sold out",
    "currently unavailable",
    "temporarily unavailable",
    "no longer available",
    "coming soon",
];

const IN_STOCK_PHRASES: &[&str] = &["add to cart", "add to bag", "buy now", "in stock", "ship it"];

/// Which extraction tier decided availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    EmbeddedState,
    Metadata,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageFinding {
    pub in_stock: bool,
    pub tier: Tier,
    /// `<tier>:<label>`, ready for `StockSnapshot::raw_status`.
    pub raw_status: String,
    /// Product fields gathered across every tier that ran.
    pub fields: Probe,
}

/// Walk the tiers in order and return the first availability verdict.
/// Product fields found by earlier tiers carry through to the verdict.
pub fn extract(html: &str) -> Option<PageFinding> {
    let mut fields = Probe::default();

    for blob in embedded_state(html) {
        let p = probe(&blob);
        if let Some(m) = p.availability() {
            let raw_status = format!("embedded_state:{}", m.label);
            let in_stock = m.in_stock;
            let mut merged = p.clone();
            merged.backfill(&fields);
            merged.backfill(&metadata(html));
            return Some(PageFinding { in_stock, tier: Tier::EmbeddedState, raw_status, fields: merged });
        }
        fields.backfill(&p);
    }

    let meta = metadata(html);
    fields.backfill(&meta);
    if let Some(m) = meta.availability() {
        return Some(PageFinding {
            in_stock: m.in_stock,
            tier: Tier::Metadata,
            raw_status: format!("metadata:{}", m.label),
            fields,
        });
    }

    let (in_stock, phrase) = text_heuristic(html)?;
    Some(PageFinding {
        in_stock,
        tier: Tier::Text,
        raw_status: format!("text:{phrase}"),
        fields,
    })
}

/// Parsed page-state blobs in document order.
fn embedded_state(html: &str) -> Vec<Value> {
    let mut blobs = Vec::new();
    for caps in NEXT_DATA_RE.captures_iter(html) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            blobs.push(v);
        }
    }
    for caps in WINDOW_STATE_RE.captures_iter(html) {
        let body = caps[2].trim().trim_end_matches(';').trim();
        if let Some(v) = parse_state_literal(body) {
            blobs.push(v);
        }
    }
    blobs
}

/// State assignments are either a JSON object literal or `JSON.parse("...")`
/// over an escaped string.
fn parse_state_literal(body: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        return Some(v);
    }
    let inner = body.strip_prefix("JSON.parse(")?.strip_suffix(')')?;
    let unescaped: String = serde_json::from_str(inner).ok()?;
    serde_json::from_str(&unescaped).ok()
}

/// JSON-LD blocks plus `og:`/`product:` meta tags and `itemprop` attributes,
/// folded into one probe.
fn metadata(html: &str) -> Probe {
    let mut out = Probe::default();

    for caps in JSON_LD_RE.captures_iter(html) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            let p = probe(&v);
            out.markers.extend(p.markers.iter().cloned());
            out.backfill(&p);
        }
    }

    for tag in META_TAG_RE.find_iter(html) {
        let attrs: HashMap<String, String> = ATTR_RE
            .captures_iter(tag.as_str())
            .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
            .collect();
        let key = attrs
            .get("property")
            .or_else(|| attrs.get("name"))
            .or_else(|| attrs.get("itemprop"))
            .map(|k| k.to_ascii_lowercase());
        let Some(key) = key else { continue };
        let Some(content) = attrs.get("content").or_else(|| attrs.get("href")) else {
            continue;
        };

        match key.as_str() {
            "og:availability" | "product:availability" | "availability" => {
                if let Some(m) = classify_status(content) {
                    out.markers.push(m);
                }
            }
            "product:price:amount" | "og:price:amount" | "price" => {
                if out.price.is_none() {
                    out.price = parse_price(&Value::String(content.clone()));
                }
            }
            "og:title" => {
                if out.name.is_none() && !content.trim().is_empty() {
                    out.name = Some(decode_entities(content.trim()));
                }
            }
            "og:image" => {
                if out.image.is_none() && content.starts_with("http") {
                    out.image = Some(content.clone());
                }
            }
            _ => {}
        }
    }
    out
}

/// Out-of-stock phrases are checked first: most sold-out pages still carry
/// an add-to-cart string somewhere.
fn text_heuristic(html: &str) -> Option<(bool, &'static str)> {
    let text = visible_text(html).to_lowercase();
    if let Some(p) = OUT_OF_STOCK_PHRASES.iter().find(|p| text.contains(*p)) {
        return Some((false, *p));
    }
    IN_STOCK_PHRASES.iter().find(|p| text.contains(*p)).map(|p| (true, *p))
}

fn visible_text(html: &str) -> String {
    let without_blocks = STRIP_BLOCKS_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, " ");
    SPACE_RE.replace_all(&decode_entities(&without_tags), " ").into_owned()
}
