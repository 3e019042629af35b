//! Page-state classification shared by replay confirmation and the agent's
//! stop conditions.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::resolver::probe::parse_price;

static ORDER_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)order\s*(?:number|#|no\.?|id)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{4,})").expect("valid order ref regex")
});

static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:order\s+|estimated\s+)?total[^$\d\n]{0,24}\$?\s*(\d[\d,]*\.\d{2})").expect("valid total regex")
});

const CONFIRMATION_URL_HINTS: &[&str] = &["order-confirmation", "orderconfirmation", "thank-you", "thankyou", "/confirmation"];

const LOGIN_URL_HINTS: &[&str] = &["/login", "/signin", "/sign-in", "/identity/", "/account/login"];

const MFA_PHRASES: &[&str] = &[
    "two-step verification",
    "2-step verification",
    "one-time code",
    "one-time passcode",
    "we sent a code",
    "we've sent a code",
    "enter the code",
    "verify your identity",
    "verify it's you",
];

const CVV_PHRASES: &[&str] = &["cvv", "cvc", "security code", "card verification"];

const ERROR_PHRASES: &[&str] = &[
    "something went wrong",
    "unable to process",
    "payment was declined",
    "card was declined",
    "there was a problem",
    "error processing",
    "no longer available",
    "exceeds the purchase limit",
    "quantity limit",
];

#[derive(Debug, Clone, PartialEq)]
pub enum PageState {
    Confirmed { order_ref: Option<String>, total: Option<f64> },
    LoginRequired,
    MfaRequired,
    ErrorText(String),
    CvvRequired,
    Other,
}

/// Classify the current page. `markers` are the retailer's confirmation
/// regexes, matched case-insensitively against the visible text.
pub fn classify(url: &str, text: &str, markers: &[&str]) -> PageState {
    let lower_url = url.to_ascii_lowercase();
    let lower = text.to_lowercase();

    let order_ref = ORDER_REF_RE
        .captures(text)
        .map(|c| c[1].to_string())
        .filter(|r| r.chars().any(|ch| ch.is_ascii_digit()));
    let text_confirms = markers.iter().any(|m| {
        RegexBuilder::new(m)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    });
    let url_confirms = CONFIRMATION_URL_HINTS.iter().any(|h| lower_url.contains(h));
    if text_confirms || (url_confirms && order_ref.is_some()) {
        return PageState::Confirmed { order_ref, total: extract_total(text) };
    }

    if LOGIN_URL_HINTS.iter().any(|h| lower_url.contains(h)) {
        return PageState::LoginRequired;
    }
    if MFA_PHRASES.iter().any(|p| lower.contains(p)) {
        return PageState::MfaRequired;
    }
    if let Some(p) = ERROR_PHRASES.iter().find(|p| lower.contains(*p)) {
        return PageState::ErrorText((*p).to_string());
    }
    if CVV_PHRASES.iter().any(|p| lower.contains(p)) {
        return PageState::CvvRequired;
    }
    PageState::Other
}

/// Order or checkout total printed on the page.
pub fn extract_total(text: &str) -> Option<f64> {
    TOTAL_RE
        .captures_iter(text)
        .filter_map(|c| parse_price(&Value::String(c[1].to_string())))
        .last()
}
