use std::sync::LazyLock;

use regex::Regex;

use crate::playbook::actions::Action;
use crate::retailers::{common_overlay_selectors, host_is, RetailerAdapter, SourceSpec};

static SKU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:skuId=(\d{6,8}))|(?:/(\d{6,8})\.p)").expect("valid bestbuy sku regex")
});

pub struct BestBuyAdapter;

impl RetailerAdapter for BestBuyAdapter {
    fn key(&self) -> &'static str {
        "bestbuy"
    }

    fn matches(&self, url: &str) -> bool {
        host_is(url, "bestbuy.com")
    }

    fn extract_id(&self, url: &str) -> Option<String> {
        let caps = SKU_RE.captures(url)?;
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
    }

    fn sources(&self, sku: &str, api_key: Option<&str>) -> Vec<SourceSpec> {
        let mut ranked = vec![SourceSpec {
            name: "bestbuy_button_state",
            url: format!("https://www.bestbuy.com/button-state/api/v5/button-state?skus={sku}&context=pdp"),
        }];
        if let Some(key) = api_key {
            ranked.push(SourceSpec {
                name: "bestbuy_products",
                url: format!(
                    "https://api.bestbuy.com/v1/products/{sku}.json?apiKey={key}&show=sku,name,salePrice,onlineAvailability,image"
                ),
            });
        }
        ranked
    }

    fn page_url(&self, _locator: &str, sku: &str) -> String {
        format!("https://www.bestbuy.com/site/{sku}.p?skuId={sku}")
    }

    fn login_url(&self) -> String {
        "https://www.bestbuy.com/identity/global/signin".to_string()
    }

    fn checkout_steps(&self) -> Vec<Action> {
        vec![
            Action::Navigate { url: "{{product_url}}".to_string() },
            Action::DismissOverlays { selectors: common_overlay_selectors() },
            Action::Click {
                selector: "button.add-to-cart-button".to_string(),
                fallbacks: vec!["button[data-button-state='ADD_TO_CART']".to_string()],
                optional: false,
            },
            Action::Wait { ms: 900, jitter_ms: 500 },
            Action::Navigate { url: "https://www.bestbuy.com/checkout/r/fast-track".to_string() },
            Action::Fill { selector: "#fld-e".to_string(), value: "{{username}}".to_string(), optional: true },
            Action::Fill { selector: "#fld-p1".to_string(), value: "{{password}}".to_string(), optional: true },
            Action::Click { selector: "button.cia-form__controls__submit".to_string(), fallbacks: vec![], optional: true },
            Action::Fill { selector: "#cvv".to_string(), value: "{{cvv}}".to_string(), optional: true },
            Action::Click {
                selector: "button.button__fast-track".to_string(),
                fallbacks: vec!["button[data-track='Place your Order - Contact Card']".to_string()],
                optional: false,
            },
            Action::AssertUrl {
                contains: "thank-you".to_string(),
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
    fn extracts_sku_from_query_or_path() {
        let a = BestBuyAdapter;
        assert_eq!(a.extract_id("https://www.bestbuy.com/site/x/6568291.p"), Some("6568291".to_string()));
        assert_eq!(a.extract_id("https://www.bestbuy.com/site/x?skuId=6568292"), Some("6568292".to_string()));
    }
}
