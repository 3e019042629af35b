//! Decrypted retailer credentials from the external vault. Plaintext values
//! only ever live inside `Secret`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// A credential value. `Debug` and `Display` print `***`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetailerCredentials {
    pub username: Secret,
    pub password: Secret,
    /// Card verification code, when the tenant chose to store one.
    #[serde(default)]
    pub cvv: Option<Secret>,
}

#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn has_credentials(&self, tenant_id: &str, retailer: &str) -> Result<bool>;
    async fn fetch(&self, tenant_id: &str, retailer: &str) -> Result<Option<RetailerCredentials>>;
}

pub struct HttpVault {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpVault {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get(&self, tenant_id: &str, retailer: &str, probe_only: bool) -> Result<Option<reqwest::Response>> {
        let mut url = format!("{}/credentials/{tenant_id}/{retailer}", self.base_url);
        if probe_only {
            url.push_str("?exists=1");
        }
        let mut req = self.client.get(&url);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp)),
            s => Err(AppError::Vault(format!("vault returned {s} for {tenant_id}/{retailer}"))),
        }
    }
}

#[async_trait]
impl CredentialVault for HttpVault {
    async fn has_credentials(&self, tenant_id: &str, retailer: &str) -> Result<bool> {
        Ok(self.get(tenant_id, retailer, true).await?.is_some())
    }

    async fn fetch(&self, tenant_id: &str, retailer: &str) -> Result<Option<RetailerCredentials>> {
        let Some(resp) = self.get(tenant_id, retailer, false).await? else {
            return Ok(None);
        };
        let creds = resp
            .json::<RetailerCredentials>()
            .await
            .map_err(|e| AppError::Vault(format!("malformed credential record: {e}")))?;
        Ok(Some(creds))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_never_print() {
        let creds: RetailerCredentials =
            serde_json::from_str(r#"{"username":"a@b.c","password":"pw123","cvv":"987"}"#).unwrap();
        let shown = format!("{creds:?} {}", creds.password);
        assert!(!shown.contains("pw123"));
        assert!(!shown.contains("987"));
        assert_eq!(creds.cvv.as_ref().map(Secret::expose), Some("987"));
    }
}
