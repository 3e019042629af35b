use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::Result;

/// Failure of one resolution source. Never surfaced on its own: the resolver
/// moves on to the next-ranked source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("rate limited")]
    RateLimited,
    #[error("timed out")]
    Timeout,
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Http(e.to_string())
        }
    }
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get_json(&self, url: &str) -> std::result::Result<Value, SourceError>;
    async fn get_text(&self, url: &str) -> std::result::Result<String, SourceError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, accept: &str) -> std::result::Result<reqwest::Response, SourceError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(SourceError::RateLimited),
            s if !s.is_success() => Err(SourceError::Status(s.as_u16())),
            _ => Ok(resp),
        }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get_json(&self, url: &str) -> std::result::Result<Value, SourceError> {
        let body = self.get(url, "application/json").await?.text().await?;
        serde_json::from_str(&body).map_err(|e| SourceError::Parse(e.to_string()))
    }

    async fn get_text(&self, url: &str) -> std::result::Result<String, SourceError> {
        Ok(self.get(url, "text/html,application/xhtml+xml").await?.text().await?)
    }
}
