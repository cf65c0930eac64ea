//! OAuth `refresh_token` grant against per-provider token endpoints.
use async_trait::async_trait;
use keyrelay_config::RefreshEndpoint;
use keyrelay_types::{ProviderId, ProviderToken, RelayError, TokenRefresher, traits::Result};
use std::{collections::HashMap, time::Duration};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Refreshes tokens by posting a `refresh_token` grant to the endpoint
/// configured for each provider.
pub struct OAuthRefresher {
    http: rquest::Client,
    endpoints: HashMap<ProviderId, RefreshEndpoint>,
    timeout: Duration,
}

impl OAuthRefresher {
    pub fn new(http: rquest::Client, endpoints: HashMap<ProviderId, RefreshEndpoint>) -> Self {
        Self {
            http,
            endpoints,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound each refresh exchange, response body included.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(
        &self,
        provider: &ProviderId,
        endpoint: &RefreshEndpoint,
        refresh_token: &str,
    ) -> Result<ProviderToken> {
        let resp = self
            .http
            .post(&endpoint.token_url)
            .header("Accept", "application/json")
            .form(&refresh_form_params(endpoint, refresh_token))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| RelayError::RefreshFailed {
            provider: provider.to_string(),
            message: format!("failed to parse token response: {e}"),
        })?;
        parse_token_response(provider, &json)
    }
}

/// Build the form parameters for a refresh request.
#[must_use]
pub fn refresh_form_params(
    endpoint: &RefreshEndpoint,
    refresh_token: &str,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), refresh_token.to_string()),
        ("client_id".to_string(), endpoint.client_id.clone()),
    ];
    if let Some(secret) = &endpoint.client_secret {
        params.push(("client_secret".to_string(), secret.clone()));
    }
    params
}

/// Parse the token endpoint JSON response into a [`ProviderToken`].
///
/// # Errors
///
/// Returns an error if the response is missing the `access_token` field.
pub fn parse_token_response(
    provider: &ProviderId,
    json: &serde_json::Value,
) -> Result<ProviderToken> {
    let access_token = json
        .get("access_token")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::RefreshFailed {
            provider: provider.to_string(),
            message: "missing access_token in response".into(),
        })?;

    let mut token = ProviderToken::new(provider.clone(), access_token);
    if let Some(refresh) = json
        .get("refresh_token")
        .and_then(serde_json::Value::as_str)
    {
        token = token.with_refresh(refresh);
    }
    if let Some(expires_in) = json.get("expires_in").and_then(serde_json::Value::as_u64) {
        token = token.with_expiry(expires_in);
    }
    Ok(token)
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, provider: &ProviderId, refresh_token: &str) -> Result<ProviderToken> {
        let endpoint = self
            .endpoints
            .get(provider)
            .ok_or_else(|| RelayError::RefreshFailed {
                provider: provider.to_string(),
                message: "no refresh endpoint configured".into(),
            })?;

        tokio::time::timeout(self.timeout, self.exchange(provider, endpoint, refresh_token))
            .await
            .map_err(|_| RelayError::RefreshFailed {
                provider: provider.to_string(),
                message: format!("token endpoint timed out after {:?}", self.timeout),
            })?
    }
}
