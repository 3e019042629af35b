use crate::playbook::actions::Action;
use crate::retailers::{common_overlay_selectors, host_of, RetailerAdapter, SourceSpec};

/// Any other storefront: no structured sources, page scrape only.
pub struct GenericAdapter;

impl RetailerAdapter for GenericAdapter {
    fn key(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, url: &str) -> bool {
        host_of(url).is_some()
    }

    fn extract_id(&self, url: &str) -> Option<String> {
        host_of(url).map(|_| url.to_string())
    }

    fn sources(&self, _product_id: &str, _api_key: Option<&str>) -> Vec<SourceSpec> {
        Vec::new()
    }

    fn login_url(&self) -> String {
        "{{product_url}}".to_string()
    }

    fn checkout_steps(&self) -> Vec<Action> {
        vec![
            Action::Navigate { url: "{{product_url}}".to_string() },
            Action::DismissOverlays { selectors: common_overlay_selectors() },
            Action::Click {
                selector: "button[name='add']".to_string(),
                fallbacks: vec![
                    "button[name='add-to-cart']".to_string(),
                    "#add-to-cart".to_string(),
                    "button.add-to-cart".to_string(),
                ],
                optional: false,
            },
            Action::Wait { ms: 800, jitter_ms: 400 },
            Action::Click {
                selector: "button[name='checkout']".to_string(),
                fallbacks: vec!["a[href*='checkout']".to_string()],
                optional: false,
            },
            Action::Fill {
                selector: "input[name='verification_value']".to_string(),
                value: "{{cvv}}".to_string(),
                optional: true,
            },
            Action::Click {
                selector: "button#checkout-pay-button".to_string(),
                fallbacks: vec!["button[type='submit']".to_string()],
                optional: false,
            },
            Action::AssertText {
                pattern: r"thank you|order (confirmed|#)".to_string(),
                fail_if: false,
                message: "order confirmation not shown".to_string(),
            },
        ]
    }
}
