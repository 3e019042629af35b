//! Vision-capable model client used by the agent to pick the next browser
//! action from a screenshot and the page text.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Click,
    Fill,
    Navigate,
    Wait,
    /// The model believes the order is placed.
    Done,
    /// The model cannot proceed; `reason` says why.
    Fail,
}

/// One step chosen by the model. Fill values for credentials are
/// placeholders (`{{password}}`) resolved by the engine, so secrets never
/// enter a prompt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentDecision {
    pub action: AgentAction,
    #[serde(default)]
    pub selector: Option<String>,
    /// URL for `navigate`, visible label for `click` when no selector.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    /// Checkout stage the page is in: `carted`, `checkout_started`,
    /// `checkout_payment`.
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub in_stock: Option<bool>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

pub struct VisionRequest {
    pub system: String,
    pub instruction: String,
    pub url: String,
    pub page_text: String,
    pub screenshot_png: Vec<u8>,
    pub history: Vec<String>,
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn decide(&self, req: VisionRequest) -> Result<AgentDecision, LlmError>;
}

/// Maximum page text characters sent per step.
const PAGE_TEXT_LIMIT: usize = 6_000;

/// OpenAI-compatible chat-completions client.
pub struct OpenAiVision {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiVision {
    pub fn new(base_url: &str, api_key: String, model: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiVision {
    async fn decide(&self, req: VisionRequest) -> Result<AgentDecision, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let image = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&req.screenshot_png)
        );
        let page_text: String = req.page_text.chars().take(PAGE_TEXT_LIMIT).collect();
        let user_text = format!(
            "{}\n\nCurrent URL: {}\n\nSteps so far:\n{}\n\nVisible page text:\n{}",
            req.instruction,
            req.url,
            if req.history.is_empty() { "(none)".to_string() } else { req.history.join("\n") },
            page_text
        );
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": 400,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": [
                    { "type": "text", "text": user_text },
                    { "type": "image_url", "image_url": { "url": image } }
                ]}
            ]
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(LlmError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => return Err(LlmError::RateLimited),
            _ => {}
        }
        let status = resp.status();
        let raw = resp.text().await.map_err(|e| LlmError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Http(format!("{} {}", status.as_u16(), raw)));
        }

        let v: Value = serde_json::from_str(&raw)
            .map_err(|e| LlmError::InvalidResponse(format!("json parse failed: {e}")))?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))?;
        parse_decision(content)
    }
}

/// Decode the model's JSON answer, tolerating code fences or prose around
/// the object.
pub fn parse_decision(content: &str) -> Result<AgentDecision, LlmError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let object = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(LlmError::InvalidResponse(format!("no JSON object in: {content}"))),
    };
    serde_json::from_str(object).map_err(|e| LlmError::InvalidResponse(format!("bad decision: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_decision() {
        let d = parse_decision("```json\n{\"action\":\"fill\",\"selector\":\"#pw\",\"value\":\"{{password}}\",\"reason\":\"login\"}\n```")
            .unwrap();
        assert_eq!(d.action, AgentAction::Fill);
        assert_eq!(d.value.as_deref(), Some("{{password}}"));
        assert!(d.stage.is_none());
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(parse_decision(r#"{"action":"edit_address"}"#).is_err());
        assert!(parse_decision("I think you should click buy").is_err());
    }
}
