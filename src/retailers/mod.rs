//! Retailer capability adapters, resolved through a static first-match
//! registry. The registry order matters: the generic adapter matches every
//! http(s) URL and must stay last.

pub mod bestbuy;
pub mod generic;
pub mod target;
pub mod walmart;

use crate::playbook::actions::Action;

/// A ranked structured data source for one product.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: &'static str,
    pub url: String,
}

pub trait RetailerAdapter: Send + Sync {
    /// Stable retailer key stored on watch items and playbooks.
    fn key(&self) -> &'static str;

    fn matches(&self, url: &str) -> bool;

    fn extract_id(&self, url: &str) -> Option<String>;

    /// Structured endpoints in priority order. Endpoints needing an API key
    /// are omitted when none is configured.
    fn sources(&self, product_id: &str, api_key: Option<&str>) -> Vec<SourceSpec>;

    /// Page fetched for the unstructured fallback.
    fn page_url(&self, locator: &str, _product_id: &str) -> String {
        locator.to_string()
    }

    fn login_url(&self) -> String;

    /// Instruction given to the vision agent when re-confirming stock and
    /// price on the product page.
    fn stock_prompt(&self) -> String {
        "Look at the product page. Report whether the item can be added to the cart right now \
         and the current unit price. Treat 'sold out', 'out of stock', 'coming soon' and \
         disabled add-to-cart buttons as not available."
            .to_string()
    }

    /// Standard purchase flow, recorded as a playbook after an agent success.
    fn checkout_steps(&self) -> Vec<Action>;

    /// Case-insensitive regexes identifying an order confirmation page.
    fn confirmation_markers(&self) -> &'static [&'static str] {
        &[
            r"thank you for your order",
            r"order (has been )?(placed|confirmed|received)",
            r"order (number|#)\s*[:#]?\s*[A-Z0-9-]{5,}",
        ]
    }
}

static REGISTRY: [&dyn RetailerAdapter; 4] = [
    &target::TargetAdapter,
    &walmart::WalmartAdapter,
    &bestbuy::BestBuyAdapter,
    &generic::GenericAdapter,
];

/// First adapter whose `matches` accepts the URL.
pub fn adapter_for(url: &str) -> Option<&'static dyn RetailerAdapter> {
    REGISTRY.iter().copied().find(|a| a.matches(url))
}

pub fn adapter_by_key(key: &str) -> Option<&'static dyn RetailerAdapter> {
    REGISTRY.iter().copied().find(|a| a.key() == key)
}

/// Lower-cased host of an http(s) URL.
pub(crate) fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    match parsed.scheme() {
        "http" | "https" => parsed.host_str().map(|h| h.to_ascii_lowercase()),
        _ => None,
    }
}

/// True if `url`'s host is `domain` or a subdomain of it.
pub(crate) fn host_is(url: &str, domain: &str) -> bool {
    host_of(url).is_some_and(|h| h == domain || h.ends_with(&format!(".{domain}")))
}

/// Overlay close buttons common across storefronts.
pub(crate) fn common_overlay_selectors() -> Vec<String> {
    [
        "button[aria-label='close']",
        "button[aria-label='Close']",
        "[data-test='modal-close-button']",
        "#onetrust-accept-btn-handler",
        ".modal-close",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_and_generic_catches_the_rest() {
        let cases = [
            ("https://www.target.com/p/thing/-/A-87654321", "target"),
            ("https://www.walmart.com/ip/Some-Item/123456789", "walmart"),
            ("https://www.bestbuy.com/site/gpu/6568291.p?skuId=6568291", "bestbuy"),
            ("https://shop.example.org/products/widget", "generic"),
        ];
        for (url, key) in cases {
            assert_eq!(adapter_for(url).map(|a| a.key()), Some(key), "{url}");
        }
    }

    #[test]
    fn lookalike_hosts_do_not_match() {
        assert_eq!(
            adapter_for("https://target.com.evil.example/p/-/A-1").map(|a| a.key()),
            Some("generic")
        );
        assert!(adapter_for("ftp://www.target.com/x").is_none());
        assert!(adapter_for("not a url").is_none());
    }

    #[test]
    fn every_adapter_has_a_checkout_template() {
        for adapter in REGISTRY.iter() {
            let steps = adapter.checkout_steps();
            assert!(!steps.is_empty(), "{} has no steps", adapter.key());
            assert!(matches!(steps[0], Action::Navigate { .. }));
        }
    }

    #[test]
    fn lookup_by_key() {
        assert_eq!(adapter_by_key("walmart").map(|a| a.key()), Some("walmart"));
        assert!(adapter_by_key("nowhere").is_none());
    }
}
