//! Tokens held by a remote vault service.
//!
//! The vault speaks a small JSON API:
//! - `GET {url}/tokens` → `{"providers": ["github", ...]}`
//! - `GET {url}/tokens/{provider}` → `{"accessToken": "...", "user"?: {...}, "providerName"?: "..."}`,
//!   `404` when the vault holds nothing for that provider.
use async_trait::async_trait;
use keyrelay_config::VaultConfig;
use keyrelay_types::{
    ProviderId, RelayError, TokenResult, TokenSource, TokenSourceDescriptor, UserInfo,
    traits::Result,
};
use serde::Deserialize;
use std::time::Duration;

pub const VAULT_SOURCE_NAME: &str = "vault";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Entries stay untyped so one bad id does not hide the rest of the listing.
#[derive(Debug, Deserialize)]
struct ProviderList {
    #[serde(default)]
    providers: Vec<serde_json::Value>,
}

impl ProviderList {
    fn into_ids(self) -> Vec<ProviderId> {
        let mut ids = Vec::with_capacity(self.providers.len());
        for entry in self.providers {
            match entry.as_str().map(ProviderId::new) {
                Some(id) if !id.is_empty() => ids.push(id),
                _ => tracing::debug!(entry = %entry, "skipping unusable vault provider entry"),
            }
        }
        ids
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultToken {
    access_token: String,
    #[serde(default)]
    user: Option<UserInfo>,
    #[serde(default)]
    provider_name: Option<String>,
}

pub struct VaultSource {
    http: rquest::Client,
    base_url: String,
    token: Option<String>,
    priority: i32,
}

impl VaultSource {
    pub fn new(http: rquest::Client, config: &VaultConfig) -> Self {
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            priority: config.priority,
        }
    }

    /// Use `token` as the vault bearer unless one was configured explicitly.
    #[must_use]
    pub fn with_fallback_token(mut self, token: Option<String>) -> Self {
        if self.token.is_none() {
            self.token = token;
        }
        self
    }

    async fn get(&self, path: &str) -> Result<rquest::Response> {
        let mut req = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        tokio::time::timeout(REQUEST_TIMEOUT, req.send())
            .await
            .map_err(|_| self.unavailable(format!("request to {path} timed out")))?
            .map_err(Into::into)
    }

    fn unavailable(&self, message: String) -> RelayError {
        RelayError::SourceUnavailable {
            source_name: VAULT_SOURCE_NAME.into(),
            message,
        }
    }
}

#[async_trait]
impl TokenSource for VaultSource {
    fn descriptor(&self) -> TokenSourceDescriptor {
        TokenSourceDescriptor::new(VAULT_SOURCE_NAME, self.priority)
    }

    async fn can_provide(&self, provider: &ProviderId) -> Result<bool> {
        match self.list_providers().await {
            Ok(ids) => Ok(ids.contains(provider)),
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "vault listing failed");
                Ok(false)
            }
        }
    }

    async fn resolve(&self, provider: &ProviderId) -> Result<TokenResult> {
        let resp = self.get(&format!("/tokens/{provider}")).await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(TokenResult::failure(format!("vault has no token for {provider}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let token: VaultToken = resp
            .json()
            .await
            .map_err(|e| self.unavailable(format!("invalid token response: {e}")))?;

        let mut result = TokenResult::found(token.access_token).with_user(token.user);
        if let Some(name) = token.provider_name {
            result = result.with_provider_name(name);
        }
        Ok(result)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderId>> {
        let resp = self.get("/tokens").await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let list: ProviderList = resp
            .json()
            .await
            .map_err(|e| self.unavailable(format!("invalid provider list: {e}")))?;
        Ok(list.into_ids())
    }
}
