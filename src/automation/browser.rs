//! Browser session abstraction and the HTTP client for the remote
//! browser-automation service.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("browser service http error: {0}")]
    Http(String),
    #[error("browser service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One live browser tab. Methods take `&self`; implementations serialise
/// access internally.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Click the element. `BrowserError::NotFound` when no visible match.
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError>;

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Visible text of the current page.
    async fn page_text(&self) -> Result<String, BrowserError>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Open a session on a persistent profile so retailer cookies survive
    /// between purchases for the same tenant.
    async fn launch(&self, profile: &str) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

// ---------------------------------------------------------------------------
// Remote service client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RemoteBrowser {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteBrowser {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BrowserError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value, BrowserError> {
        let req = match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        };
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BrowserError::Timeout(what.to_string())
            } else {
                BrowserError::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BrowserError::Http(e.to_string()))?;
        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(BrowserError::NotFound(what.to_string())),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                return Err(BrowserError::Timeout(what.to_string()))
            }
            s => return Err(BrowserError::Service { status: s.as_u16(), body }),
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| BrowserError::InvalidResponse(format!("{what}: {e}")))
    }
}

#[derive(Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[async_trait]
impl BrowserLauncher for RemoteBrowser {
    async fn launch(&self, profile: &str) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let url = format!("{}/sessions", self.base_url);
        let v = self
            .send(self.client.post(url).json(&json!({ "profile": profile })), "create session")
            .await?;
        let created: SessionCreated = serde_json::from_value(v)
            .map_err(|e| BrowserError::InvalidResponse(e.to_string()))?;
        debug!(session = %created.session_id, "Browser session opened");
        Ok(Box::new(RemoteSession {
            remote: self.clone(),
            id: created.session_id,
        }))
    }
}

struct RemoteSession {
    remote: RemoteBrowser,
    id: String,
}

impl RemoteSession {
    fn url(&self, op: &str) -> String {
        format!("{}/sessions/{}/{op}", self.remote.base_url, self.id)
    }

    async fn post(&self, op: &str, body: Value, what: &str) -> Result<Value, BrowserError> {
        let req = self.remote.client.post(self.url(op)).json(&body);
        self.remote.send(req, what).await
    }

    async fn get_field(&self, op: &str, field: &str) -> Result<String, BrowserError> {
        let v = self.remote.send(self.remote.client.get(self.url(op)), op).await?;
        v.get(field)
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .ok_or_else(|| BrowserError::InvalidResponse(format!("{op}: missing {field}")))
    }
}

#[async_trait]
impl BrowserSession for RemoteSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.post("navigate", json!({ "url": url }), url).await.map(|_| ())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.post("click", json!({ "selector": selector }), selector).await.map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.post("fill", json!({ "selector": selector, "value": value }), selector)
            .await
            .map(|_| ())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        let v = self.post("visible", json!({ "selector": selector }), selector).await?;
        Ok(v.get("visible").and_then(|x| x.as_bool()).unwrap_or(false))
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let body = json!({ "selector": selector, "timeout_ms": timeout.as_millis() as u64 });
        self.post("wait", body, selector).await.map(|_| ())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.get_field("url", "url").await
    }

    async fn page_text(&self) -> Result<String, BrowserError> {
        self.get_field("text", "text").await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let data = self.get_field("screenshot", "data").await?;
        base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| BrowserError::InvalidResponse(format!("screenshot: {e}")))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let url = format!("{}/sessions/{}", self.remote.base_url, self.id);
        self.remote
            .send(self.remote.client.delete(url), "close session")
            .await
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Scripted in-memory browser for tests
// ---------------------------------------------------------------------------
