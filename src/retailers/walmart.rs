use std::sync::LazyLock;

use regex::Regex;

use crate::playbook::actions::Action;
use crate::retailers::{common_overlay_selectors, host_is, RetailerAdapter, SourceSpec};

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/ip/(?:[^/?#]+/)?(\d{5,14})").expect("valid walmart item regex"));

pub struct WalmartAdapter;

impl RetailerAdapter for WalmartAdapter {
    fn key(&self) -> &'static str {
        "walmart"
    }

    fn matches(&self, url: &str) -> bool {
        host_is(url, "walmart.com")
    }

    fn extract_id(&self, url: &str) -> Option<String> {
        ITEM_RE.captures(url).map(|c| c[1].to_string())
    }

    fn sources(&self, item_id: &str, api_key: Option<&str>) -> Vec<SourceSpec> {
        let mut ranked = Vec::new();
        if let Some(key) = api_key {
            ranked.push(SourceSpec {
                name: "walmart_affiliate",
                url: format!(
                    "https://developer.api.walmart.com/api-proxy/service/affil/product/v2/items/{item_id}?publisherId={key}"
                ),
            });
        }
        ranked.push(SourceSpec {
            name: "walmart_terra",
            url: format!("https://www.walmart.com/terra-firma/item/{item_id}"),
        });
        ranked
    }

    fn page_url(&self, _locator: &str, item_id: &str) -> String {
        format!("https://www.walmart.com/ip/{item_id}")
    }

    fn login_url(&self) -> String {
        "https://www.walmart.com/account/login".to_string()
    }

    fn checkout_steps(&self) -> Vec<Action> {
        vec![
            Action::Navigate { url: "{{product_url}}".to_string() },
            Action::DismissOverlays { selectors: common_overlay_selectors() },
            Action::AssertText {
                pattern: r"out of stock|unavailable".to_string(),
                fail_if: true,
                message: "item is out of stock".to_string(),
            },
            Action::Click {
                selector: "button[data-automation-id='atc']".to_string(),
                fallbacks: vec!["button[aria-label^='Add to cart']".to_string()],
                optional: false,
            },
            Action::Wait { ms: 1_000, jitter_ms: 700 },
            Action::Navigate { url: "https://www.walmart.com/checkout".to_string() },
            Action::Fill { selector: "input[name='email']".to_string(), value: "{{username}}".to_string(), optional: true },
            Action::Fill { selector: "input[name='password']".to_string(), value: "{{password}}".to_string(), optional: true },
            Action::Click { selector: "button[type='submit']".to_string(), fallbacks: vec![], optional: true },
            Action::Click {
                selector: "button[data-automation-id='continue-button']".to_string(),
                fallbacks: vec![],
                optional: true,
            },
            Action::Fill {
                selector: "input[data-automation-id='cvv-verify-cc-0']".to_string(),
                value: "{{cvv}}".to_string(),
                optional: true,
            },
            Action::Click {
                selector: "button[data-automation-id='place-order-button']".to_string(),
                fallbacks: vec!["button[aria-label='Place order']".to_string()],
                optional: false,
            },
            Action::AssertText {
                pattern: r"thank you|order (number|#)".to_string(),
                fail_if: false,
                message: "order confirmation not shown".to_string(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_item_id_with_and_without_slug() {
        let a = WalmartAdapter;
        assert_eq!(a.extract_id("https://www.walmart.com/ip/Nintendo-Switch/123456789"), Some("123456789".to_string()));
        assert_eq!(a.extract_id("https://www.walmart.com/ip/987654321?x=1"), Some("987654321".to_string()));
    }

    #[test]
    fn keyless_source_always_present() {
        let ranked = WalmartAdapter.sources("42424242", None);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "walmart_terra");
    }
}
