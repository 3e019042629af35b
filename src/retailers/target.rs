use std::sync::LazyLock;

use regex::Regex;

use crate::playbook::actions::Action;
use crate::retailers::{common_overlay_selectors, host_is, RetailerAdapter, SourceSpec};

static TCIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/A-(\d{6,10})").expect("valid tcin regex"));

const REDSKY_BASE: &str = "https://redsky.target.com/redsky_aggregations/v1/web";

pub struct TargetAdapter;

impl RetailerAdapter for TargetAdapter {
    fn key(&self) -> &'static str {
        "target"
    }

    fn matches(&self, url: &str) -> bool {
        host_is(url, "target.com")
    }

    fn extract_id(&self, url: &str) -> Option<String> {
        TCIN_RE.captures(url).map(|c| c[1].to_string())
    }

    fn sources(&self, tcin: &str, api_key: Option<&str>) -> Vec<SourceSpec> {
        let Some(key) = api_key else {
            return Vec::new();
        };
        vec![
            SourceSpec {
                name: "redsky_fulfillment",
                url: format!("{REDSKY_BASE}/product_fulfillment_v1?key={key}&tcin={tcin}&is_bot=false"),
            },
            SourceSpec {
                name: "redsky_pdp",
                url: format!("{REDSKY_BASE}/pdp_client_v1?key={key}&tcin={tcin}&pricing_store_id=3991"),
            },
            SourceSpec {
                name: "redsky_summary",
                url: format!("{REDSKY_BASE}/product_summary_with_fulfillment_v1?key={key}&tcins={tcin}"),
            },
        ]
    }

    fn page_url(&self, _locator: &str, tcin: &str) -> String {
        format!("https://www.target.com/p/-/A-{tcin}")
    }

    fn login_url(&self) -> String {
        "https://www.target.com/login".to_string()
    }

    fn checkout_steps(&self) -> Vec<Action> {
        vec![
            Action::Navigate { url: "{{product_url}}".to_string() },
            Action::DismissOverlays { selectors: common_overlay_selectors() },
            Action::AssertText {
                pattern: r"out of stock|sold out".to_string(),
                fail_if: true,
                message: "item is out of stock".to_string(),
            },
            Action::Click {
                selector: "button[data-test='shippingButton']".to_string(),
                fallbacks: vec![
                    "button[data-test='shipItButton']".to_string(),
                    "button[data-test='orderPickupButton']".to_string(),
                ],
                optional: false,
            },
            Action::Click {
                selector: "button[data-test='espModalContent-declineCoverageButton']".to_string(),
                fallbacks: vec![],
                optional: true,
            },
            Action::Wait { ms: 800, jitter_ms: 600 },
            Action::Navigate { url: "https://www.target.com/cart".to_string() },
            Action::Click {
                selector: "button[data-test='checkout-button']".to_string(),
                fallbacks: vec!["button[data-test='checkoutButton']".to_string()],
                optional: false,
            },
            Action::Fill { selector: "#username".to_string(), value: "{{username}}".to_string(), optional: true },
            Action::Fill { selector: "#password".to_string(), value: "{{password}}".to_string(), optional: true },
            Action::Click { selector: "#login".to_string(), fallbacks: vec![], optional: true },
            Action::AssertUrl {
                contains: "/login".to_string(),
                fail_if: true,
                message: "login did not complete".to_string(),
            },
            Action::Fill {
                selector: "input#creditCardInput-cvv".to_string(),
                value: "{{cvv}}".to_string(),
                optional: true,
            },
            Action::Click {
                selector: "button[data-test='placeOrderButton']".to_string(),
                fallbacks: vec![],
                optional: false,
            },
            Action::WaitForVisible {
                selector: "[data-test='order-confirmation']".to_string(),
                timeout_ms: 20_000,
                optional: true,
            },
            Action::AssertUrl {
                contains: "order-confirmation".to_string(),
                fail_if: false,
                message: "order confirmation page not reached".to_string(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tcin() {
        let a = TargetAdapter;
        assert_eq!(
            a.extract_id("https://www.target.com/p/pokemon-booster/-/A-88897904#lnk=sametab"),
            Some("88897904".to_string())
        );
        assert_eq!(a.extract_id("https://www.target.com/c/toys"), None);
    }

    #[test]
    fn sources_require_key() {
        let a = TargetAdapter;
        assert!(a.sources("1234567", None).is_empty());
        let ranked = a.sources("1234567", Some("k"));
        assert_eq!(ranked[0].name, "redsky_fulfillment");
        assert!(ranked.iter().all(|s| s.url.contains("1234567")));
    }
}
