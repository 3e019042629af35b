//! Vision-driven purchase agent: screenshot, ask the model for one action,
//! execute it, repeat until a stop condition or the step budget runs out.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::automation::browser::BrowserSession;
use crate::automation::page::{classify, extract_total, PageState};
use crate::automation::vision::{AgentAction, AgentDecision, VisionModel, VisionRequest};
use crate::automation::ProgressSink;
use crate::playbook::actions::TemplateVars;
use crate::retailers::RetailerAdapter;
use crate::types::{PurchaseOutcome, PurchaseStatus};

const SYSTEM_PROMPT: &str = "You operate a web browser to buy one product that the account owner has \
authorised. Reply with a single JSON object: {\"action\": \"click|fill|navigate|wait|done|fail\", \
\"selector\": CSS selector or null, \"text\": visible label or URL or null, \"value\": text to type or null, \
\"stage\": \"carted|checkout_started|checkout_payment\" or null, \"in_stock\": true|false|null, \
\"price\": unit price shown or null, \"reason\": short explanation}. \
Use the placeholders {{username}}, {{password}} and {{cvv}} for credentials; never invent values. \
Never edit, add or remove a shipping address or payment method; use the saved defaults. \
Answer done only when an order confirmation is visible, and fail when you cannot continue.";

/// Phrases identifying address or payment-method editing controls. Bare
/// "address" is not one: login forms ask for an email address.
const FORBIDDEN_TARGETS: &[&str] = &[
    "shipping address",
    "delivery address",
    "edit address",
    "change address",
    "add address",
    "add an address",
    "new address",
    "edit-address",
    "add-address",
    "shipping-address",
    "address-edit",
    "address-form",
    "edit payment",
    "change payment",
    "payment method",
    "add card",
    "new card",
    "remove card",
    "add a card",
    "card number",
    "cardnumber",
    "billing",
];

/// Consecutive model failures tolerated before giving up.
const MAX_MODEL_ERRORS: usize = 2;

pub struct AgentTask<'a> {
    pub adapter: &'a dyn RetailerAdapter,
    pub product_url: &'a str,
    pub quantity: i64,
    pub price_ceiling: Option<f64>,
    pub vars: &'a TemplateVars,
    pub has_cvv: bool,
    pub max_steps: usize,
}

pub async fn run_agent(
    session: &dyn BrowserSession,
    model: &dyn VisionModel,
    task: &AgentTask<'_>,
    progress: &dyn ProgressSink,
) -> PurchaseOutcome {
    let mut history: Vec<String> = Vec::new();
    let mut stage = PurchaseStatus::Detected;
    let mut login_submitted = false;
    let mut model_errors = 0usize;

    if let Err(e) = session.navigate(task.product_url).await {
        return PurchaseOutcome::failed(format!("could not open product page: {e}"), history);
    }
    history.push(format!("navigate {}", task.product_url));

    let instruction = format!(
        "Buy {} unit(s) of the product at {}. First confirm it is in stock and note its price. {}",
        task.quantity,
        task.product_url,
        task.adapter.stock_prompt()
    );
    let markers = task.adapter.confirmation_markers();

    for step in 0..task.max_steps {
        let url = session.current_url().await.unwrap_or_default();
        let text = session.page_text().await.unwrap_or_default();

        match classify(&url, &text, markers) {
            PageState::Confirmed { order_ref, total } => {
                info!(step, order_ref = ?order_ref, "[AGENT] Order confirmation reached");
                return PurchaseOutcome::success(order_ref, total, history);
            }
            PageState::LoginRequired if login_submitted => {
                return end_with(stage, "login failed or session expired", history);
            }
            PageState::MfaRequired => {
                return end_with(stage, "MFA or verification prompt requires manual action", history);
            }
            PageState::ErrorText(msg) => {
                return end_with(stage, &format!("retailer reported an error: {msg}"), history);
            }
            PageState::CvvRequired if !task.has_cvv => {
                return end_with(stage, "verification code required", history);
            }
            _ => {}
        }

        if stage.rank() >= PurchaseStatus::CheckoutStarted.rank() {
            if let Some(reason) = post_cart_ceiling_breach(&text, task) {
                return PurchaseOutcome::failed(reason, history);
            }
        }

        let screenshot = match session.screenshot().await {
            Ok(png) => png,
            Err(e) => return end_with(stage, &format!("browser lost: {e}"), history),
        };
        let request = VisionRequest {
            system: SYSTEM_PROMPT.to_string(),
            instruction: instruction.clone(),
            url: url.clone(),
            page_text: text.clone(),
            screenshot_png: screenshot,
            history: history.clone(),
        };
        let decision = match model.decide(request).await {
            Ok(d) => {
                model_errors = 0;
                d
            }
            Err(e) => {
                model_errors += 1;
                warn!(step, "[AGENT] Vision model error: {e}");
                if model_errors >= MAX_MODEL_ERRORS {
                    return end_with(stage, &format!("vision model unavailable: {e}"), history);
                }
                continue;
            }
        };
        debug!(step, action = ?decision.action, reason = %decision.reason, "[AGENT] Decision");

        if let Some(next) = decision.stage.as_deref().and_then(PurchaseStatus::parse) {
            if !next.is_terminal() && next.rank() > stage.rank() {
                stage = next;
                progress.report(stage, &decision.reason).await;
            }
        }

        if stage.rank() < PurchaseStatus::Carted.rank() {
            if decision.in_stock == Some(false) {
                return PurchaseOutcome::failed("item no longer in stock at the retailer", history);
            }
            if let (Some(price), Some(ceiling)) = (decision.price, task.price_ceiling) {
                if price > ceiling {
                    return PurchaseOutcome::failed(
                        format!("price {price:.2} exceeds ceiling {ceiling:.2}"),
                        history,
                    );
                }
            }
        }

        if touches_address_or_payment(&decision) {
            warn!(step, "[AGENT] Refused address or payment edit");
            history.push(format!("refused: {}", describe(&decision)));
            continue;
        }

        match decision.action {
            AgentAction::Done => {
                let url = session.current_url().await.unwrap_or_default();
                let text = session.page_text().await.unwrap_or_default();
                if let PageState::Confirmed { order_ref, total } = classify(&url, &text, markers) {
                    return PurchaseOutcome::success(order_ref, total, history);
                }
                return end_with(stage, "agent reported done but no order confirmation is visible", history);
            }
            AgentAction::Fail => {
                let reason = if decision.reason.is_empty() { "agent could not continue" } else { decision.reason.as_str() };
                return end_with(stage, reason, history);
            }
            _ => {}
        }

        let uses_cvv = decision.value.as_deref().is_some_and(|v| v.contains("{{cvv}}"));
        if uses_cvv && !task.has_cvv {
            return end_with(stage, "verification code required", history);
        }
        if decision.value.as_deref().is_some_and(|v| v.contains("{{password}}")) {
            login_submitted = true;
        }

        match execute(session, &decision, task.vars).await {
            Ok(()) => history.push(describe(&decision)),
            Err(e) => history.push(format!("failed: {} ({e})", describe(&decision))),
        }
    }

    end_with(stage, "agent step budget exhausted", history)
}

/// Terminal outcome for a stop condition. Once the item is in the cart a stop
/// is reported as carted-but-unconfirmed rather than a clean failure.
fn end_with(stage: PurchaseStatus, reason: &str, history: Vec<String>) -> PurchaseOutcome {
    if stage.rank() >= PurchaseStatus::Carted.rank() {
        PurchaseOutcome::carted_unconfirmed(format!("{reason}; item may remain in cart"), history)
    } else {
        PurchaseOutcome::failed(reason, history)
    }
}

fn post_cart_ceiling_breach(text: &str, task: &AgentTask<'_>) -> Option<String> {
    let ceiling = task.price_ceiling?;
    let total = extract_total(text)?;
    let limit = ceiling * task.quantity.max(1) as f64;
    (total > limit).then(|| format!("checkout total {total:.2} exceeds price ceiling {limit:.2}; item left in cart"))
}

fn touches_address_or_payment(d: &AgentDecision) -> bool {
    if !matches!(d.action, AgentAction::Click | AgentAction::Fill | AgentAction::Navigate) {
        return false;
    }
    let value = d.value.as_deref().unwrap_or_default();
    if d.action == AgentAction::Fill && (value.contains("{{username}}") || value.contains("{{password}}")) {
        return false;
    }
    let target = format!(
        "{} {}",
        d.selector.as_deref().unwrap_or_default(),
        d.text.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    FORBIDDEN_TARGETS.iter().any(|k| target.contains(k))
}

fn describe(d: &AgentDecision) -> String {
    let target = d.selector.as_deref().or(d.text.as_deref()).unwrap_or("-");
    format!("{:?} {target}", d.action).to_lowercase()
}

async fn execute(session: &dyn BrowserSession, d: &AgentDecision, vars: &TemplateVars) -> Result<(), String> {
    let selector = || {
        d.selector
            .clone()
            .or_else(|| d.text.as_ref().map(|t| format!("text={t}")))
            .ok_or_else(|| "decision has no target".to_string())
    };
    match d.action {
        AgentAction::Click => session.click(&selector()?).await.map_err(|e| e.to_string()),
        AgentAction::Fill => {
            let value = vars.render(d.value.as_deref().unwrap_or_default());
            if value.is_empty() {
                return Err("empty value".to_string());
            }
            session.fill(&selector()?, &value).await.map_err(|e| e.to_string())
        }
        AgentAction::Navigate => {
            let url = d.text.as_deref().ok_or_else(|| "navigate without url".to_string())?;
            session.navigate(url).await.map_err(|e| e.to_string())
        }
        AgentAction::Wait => {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            Ok(())
        }
        AgentAction::Done | AgentAction::Fail => Ok(()),
    }
}
