//! Bounded breadth-first walk over a JSON payload collecting availability
//! markers and product fields. Shared by structured sources and embedded
//! page-state blobs, whose shapes differ per retailer and drift over time.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

const MAX_NODES: usize = 20_000;
const MAX_DEPTH: usize = 24;

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d{1,2}))?").expect("valid price regex"));

const STATUS_KEYS: &[&str] = &[
    "availability_status",
    "availabilitystatus",
    "availability",
    "stock_status",
    "stockstatus",
    "inventory_status",
    "inventorystatus",
    "buttonstate",
    "button_state",
    "purchasable_status",
];

/// Boolean keys where `true` means purchasable.
const POSITIVE_FLAGS: &[&str] = &[
    "in_stock",
    "instock",
    "isinstock",
    "is_in_stock",
    "available",
    "isavailable",
    "onlineavailability",
    "purchasable",
];

/// Boolean keys where `true` means not purchasable.
const NEGATIVE_FLAGS: &[&str] = &["is_out_of_stock", "isoutofstock", "out_of_stock", "soldout", "sold_out"];

const PRICE_KEYS: &[&str] = &[
    "current_retail",
    "currentprice",
    "current_price",
    "saleprice",
    "sale_price",
    "offerprice",
    "offer_price",
    "formatted_current_price",
    "lowprice",
    "price",
];

const NAME_KEYS: &[&str] = &["title", "product_name", "productname", "display_name", "displayname", "name"];

const IMAGE_KEYS: &[&str] = &[
    "primary_image_url",
    "image_url",
    "imageurl",
    "largeimage",
    "thumbnailimage",
    "image",
];

/// One availability marker: the normalized label and what it means.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub in_stock: bool,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probe {
    pub markers: Vec<Marker>,
    pub price: Option<f64>,
    pub name: Option<String>,
    pub image: Option<String>,
}

impl Probe {
    /// The availability verdict if every marker agrees; None when there are no
    /// markers or they conflict.
    pub fn availability(&self) -> Option<&Marker> {
        let first = self.markers.first()?;
        self.markers
            .iter()
            .all(|m| m.in_stock == first.in_stock)
            .then_some(first)
    }

    pub fn has_out_of_stock_marker(&self) -> bool {
        self.markers.iter().any(|m| !m.in_stock)
    }

    /// Number of product fields found; used to pick the richest payload.
    pub fn richness(&self) -> usize {
        usize::from(self.price.is_some()) + usize::from(self.name.is_some()) + usize::from(self.image.is_some())
    }

    /// Fill fields this probe lacks from `other`.
    pub fn backfill(&mut self, other: &Probe) {
        if self.price.is_none() {
            self.price = other.price;
        }
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        if self.image.is_none() {
            self.image = other.image.clone();
        }
    }
}

pub fn probe(root: &Value) -> Probe {
    let mut out = Probe::default();
    let mut queue: VecDeque<(&Value, usize)> = VecDeque::from([(root, 0)]);
    let mut visited = 0usize;

    while let Some((node, depth)) = queue.pop_front() {
        visited += 1;
        if visited > MAX_NODES {
            break;
        }
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    inspect(&key.to_ascii_lowercase(), value, &mut out);
                    if depth < MAX_DEPTH && (value.is_object() || value.is_array()) {
                        queue.push_back((value, depth + 1));
                    }
                }
            }
            Value::Array(items) if depth < MAX_DEPTH => {
                for item in items {
                    queue.push_back((item, depth + 1));
                }
            }
            _ => {}
        }
    }
    out
}

fn inspect(key: &str, value: &Value, out: &mut Probe) {
    if STATUS_KEYS.contains(&key) {
        if let Some(marker) = value.as_str().and_then(classify_status) {
            out.markers.push(marker);
        }
    } else if let Some(b) = value.as_bool() {
        if POSITIVE_FLAGS.contains(&key) {
            out.markers.push(Marker { in_stock: b, label: flag_label(key, b) });
        } else if NEGATIVE_FLAGS.contains(&key) {
            out.markers.push(Marker { in_stock: !b, label: flag_label(key, b) });
        }
    }

    if out.price.is_none() && PRICE_KEYS.contains(&key) {
        out.price = parse_price(value);
    }
    if out.name.is_none() && NAME_KEYS.contains(&key) {
        out.name = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() < 300)
            .map(decode_entities);
    }
    if out.image.is_none() && IMAGE_KEYS.contains(&key) {
        out.image = match value {
            Value::String(s) => Some(s.as_str()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str()),
            _ => None,
        }
        .filter(|s| s.starts_with("http"))
        .map(str::to_string);
    }
}

fn flag_label(key: &str, value: bool) -> String {
    format!("{}={value}", key.to_ascii_uppercase())
}

/// Map a retailer status string (or schema.org availability URL) to a marker.
/// Unrecognised strings yield no marker.
pub fn classify_status(raw: &str) -> Option<Marker> {
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    let label: String = tail
        .trim()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    let compact = label.replace('_', "");

    let in_stock = match compact.as_str() {
        "INSTOCK" | "AVAILABLE" | "ADDTOCART" | "LIMITEDSTOCK" | "LIMITEDAVAILABILITY" | "ONLINEONLY"
        | "INSTOREONLY" | "PREORDER" | "PREORDERABLE" | "INSTOCKONLINE" => true,
        "OUTOFSTOCK" | "SOLDOUT" | "UNAVAILABLE" | "NOTAVAILABLE" | "DISCONTINUED" | "COMINGSOON"
        | "BACKORDER" | "OUTOFSTOCKONLINE" | "NOTSOLD" | "SOLDOUTONLINE" => false,
        _ => return None,
    };
    Some(Marker { in_stock, label })
}

/// Price from a number or currency string. Non-positive values are ignored.
pub fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let caps = PRICE_RE.captures(s)?;
            let whole = caps[1].replace(',', "");
            let cents = caps.get(2).map(|m| m.as_str()).unwrap_or("0");
            format!("{whole}.{cents}").parse::<f64>().ok()
        }
        _ => None,
    }?;
    (price.is_finite() && price > 0.0).then_some(price)
}

pub(crate) fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}
