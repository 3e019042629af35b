use std::time::Duration;

use rand::Rng;
use regex::RegexBuilder;
use tracing::{debug, info, warn};

use crate::automation::browser::{BrowserError, BrowserSession};
use crate::playbook::actions::{Action, TemplateVars};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub success: bool,
    /// 1-based index of the step that aborted the replay.
    pub failed_at: Option<usize>,
    pub steps_completed: Vec<String>,
    pub error: Option<String>,
}

enum StepResult {
    Done,
    Skipped(String),
}

/// Run `steps` strictly in order. The first non-optional failure aborts the
/// replay; optional misses are logged and skipped. A randomized pause drawn
/// from `pause_ms` separates consecutive actions.
pub async fn replay(
    session: &dyn BrowserSession,
    steps: &[Action],
    vars: &TemplateVars,
    pause_ms: (u64, u64),
) -> ReplayReport {
    let mut completed = Vec::with_capacity(steps.len());

    for (idx, step) in steps.iter().enumerate() {
        if idx > 0 {
            pause(pause_ms).await;
        }
        let label = step.describe();
        match run_step(session, step, vars).await {
            Ok(StepResult::Done) => {
                debug!(step = idx + 1, "[REPLAY] {label}");
                completed.push(label);
            }
            Ok(StepResult::Skipped(why)) => {
                debug!(step = idx + 1, "[REPLAY] {label} skipped: {why}");
                completed.push(format!("{label} (skipped: {why})"));
            }
            Err(e) if step.is_optional() => {
                debug!(step = idx + 1, "[REPLAY] optional {label} missed: {e}");
                completed.push(format!("{label} (skipped: {e})"));
            }
            Err(e) => {
                warn!(step = idx + 1, total = steps.len(), "[REPLAY] Aborted at {label}: {e}");
                return ReplayReport {
                    success: false,
                    failed_at: Some(idx + 1),
                    steps_completed: completed,
                    error: Some(e),
                };
            }
        }
    }

    info!(steps = steps.len(), "[REPLAY] All steps completed");
    ReplayReport {
        success: true,
        failed_at: None,
        steps_completed: completed,
        error: None,
    }
}

async fn pause((lo, hi): (u64, u64)) {
    if hi == 0 {
        return;
    }
    let ms = rand::thread_rng().gen_range(lo.min(hi)..=hi);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn run_step(
    session: &dyn BrowserSession,
    step: &Action,
    vars: &TemplateVars,
) -> Result<StepResult, String> {
    match step {
        Action::Navigate { url } => {
            session.navigate(&vars.render(url)).await.map_err(|e| e.to_string())?;
            Ok(StepResult::Done)
        }

        Action::Click { selector, fallbacks, .. } => {
            for candidate in std::iter::once(selector).chain(fallbacks.iter()) {
                match session.click(candidate).await {
                    Ok(()) => return Ok(StepResult::Done),
                    Err(BrowserError::NotFound(_)) => continue,
                    Err(e) => return Err(e.to_string()),
                }
            }
            Err(format!("no visible element for {selector} or {} fallbacks", fallbacks.len()))
        }

        Action::Fill { selector, value, .. } => {
            let value = vars.render(value);
            if value.is_empty() {
                return Ok(StepResult::Skipped("empty value".to_string()));
            }
            session.fill(selector, &value).await.map_err(|e| e.to_string())?;
            Ok(StepResult::Done)
        }

        Action::Wait { ms, jitter_ms } => {
            let extra = if *jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=*jitter_ms)
            } else {
                0
            };
            tokio::time::sleep(Duration::from_millis(ms + extra)).await;
            Ok(StepResult::Done)
        }

        Action::WaitForVisible { selector, timeout_ms, .. } => {
            session
                .wait_for_visible(selector, Duration::from_millis(*timeout_ms))
                .await
                .map_err(|e| e.to_string())?;
            Ok(StepResult::Done)
        }

        Action::DismissOverlays { selectors } => {
            for selector in selectors {
                if let Ok(true) = session.is_visible(selector).await {
                    if session.click(selector).await.is_ok() {
                        return Ok(StepResult::Done);
                    }
                }
            }
            Ok(StepResult::Skipped("no overlay".to_string()))
        }

        Action::AssertUrl { contains, fail_if, message } => {
            let url = session.current_url().await.map_err(|e| e.to_string())?;
            let matched = url.contains(&vars.render(contains));
            if matched == *fail_if {
                return Err(format!("{message} (url {url})"));
            }
            Ok(StepResult::Done)
        }

        Action::AssertText { pattern, fail_if, message } => {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("bad pattern {pattern}: {e}"))?;
            let text = session.page_text().await.map_err(|e| e.to_string())?;
            if re.is_match(&text) == *fail_if {
                return Err(message.clone());
            }
            Ok(StepResult::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::browser::testing::{ClickEffect, ScriptedBrowser};

    fn click(selector: &str) -> Action {
        Action::Click { selector: selector.to_string(), fallbacks: vec![], optional: false }
    }

    #[tokio::test]
    async fn aborts_at_first_required_miss_with_one_based_index() {
        let browser = ScriptedBrowser::new("https://shop.example/p/1", "Add to cart");
        browser.show("#add").show("#cart");
        let steps = vec![
            Action::Navigate { url: "{{product_url}}".to_string() },
            click("#add"),
            click("#checkout"),
            click("#cart"),
            click("#place"),
        ];
        let mut vars = TemplateVars::new();
        vars.set("product_url", "https://shop.example/p/1");

        let report = replay(&browser, &steps, &vars, (0, 0)).await;
        assert!(!report.success);
        assert_eq!(report.failed_at, Some(3));
        assert_eq!(report.steps_completed.len(), 2);
        assert!(!browser.log().iter().any(|l| l.contains("#cart")));
    }

    #[tokio::test]
    async fn fallback_selector_and_optional_miss() {
        let browser = ScriptedBrowser::new("https://shop.example/p/1", "");
        browser.show("#buy-alt");
        let steps = vec![
            Action::Click {
                selector: "#buy".to_string(),
                fallbacks: vec!["#buy-alt".to_string()],
                optional: false,
            },
            Action::Click { selector: "#warranty-no".to_string(), fallbacks: vec![], optional: true },
        ];
        let report = replay(&browser, &steps, &TemplateVars::new(), (0, 0)).await;
        assert!(report.success);
        assert_eq!(browser.log(), vec!["click #buy-alt"]);
        assert!(report.steps_completed[1].contains("skipped"));
    }

    #[tokio::test]
    async fn empty_fill_is_skipped_not_typed() {
        let browser = ScriptedBrowser::new("https://shop.example/checkout", "");
        browser.show("#cvv");
        let steps = vec![Action::Fill {
            selector: "#cvv".to_string(),
            value: "{{cvv}}".to_string(),
            optional: false,
        }];
        let report = replay(&browser, &steps, &TemplateVars::new(), (0, 0)).await;
        assert!(report.success);
        assert!(browser.log().is_empty());
    }

    #[tokio::test]
    async fn assertion_polarity() {
        let browser = ScriptedBrowser::new("https://shop.example/login?next=cart", "Sold out");
        let must_not_be_login = Action::AssertUrl {
            contains: "/login".to_string(),
            fail_if: true,
            message: "session expired".to_string(),
        };
        let report = replay(&browser, &[must_not_be_login], &TemplateVars::new(), (0, 0)).await;
        assert_eq!(report.failed_at, Some(1));
        assert!(report.error.unwrap().contains("session expired"));

        let must_say_sold_out = Action::AssertText {
            pattern: "sold OUT".to_string(),
            fail_if: false,
            message: "expected sold out".to_string(),
        };
        let report = replay(&browser, &[must_say_sold_out], &TemplateVars::new(), (0, 0)).await;
        assert!(report.success);
    }

    #[tokio::test]
    async fn dismiss_overlays_clicks_first_visible_only() {
        let browser = ScriptedBrowser::new("https://shop.example/", "");
        browser.on_click("#close-b", ClickEffect::default()).show("#close-c");
        let step = Action::DismissOverlays {
            selectors: vec!["#close-a".to_string(), "#close-b".to_string(), "#close-c".to_string()],
        };
        let report = replay(&browser, &[step], &TemplateVars::new(), (0, 0)).await;
        assert!(report.success);
        assert_eq!(browser.log(), vec!["click #close-b"]);
    }
}
