//! Enumerating remote execution environments.
use async_trait::async_trait;
use keyrelay_types::{RelayError, traits::Result};
use serde::Deserialize;
use std::time::Duration;

use crate::target::ConnectionTarget;

/// A remote environment as reported by the discovery API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEnvironment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    /// Duplex endpoint; environments without one cannot host a connection.
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl RemoteEnvironment {
    #[must_use]
    pub fn into_target(self) -> Option<ConnectionTarget> {
        let ws_url = self.ws_url.filter(|u| !u.is_empty())?;
        let mut target = ConnectionTarget::remote(self.url, self.id).with_ws_url(ws_url);
        target.name = self.name;
        Some(target)
    }
}

/// First environment that exposes a duplex endpoint.
#[must_use]
pub fn select_target(envs: Vec<RemoteEnvironment>) -> Option<ConnectionTarget> {
    envs.into_iter().find_map(RemoteEnvironment::into_target)
}

#[async_trait]
pub trait RemoteDiscovery: Send + Sync {
    async fn discover(&self, credential: &str) -> Result<Vec<RemoteEnvironment>>;
}

#[derive(Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    environments: Vec<RemoteEnvironment>,
}

/// `GET {url}` with the executor credential as bearer, answering
/// `{"environments": [...]}`.
pub struct HttpDiscovery {
    http: rquest::Client,
    url: String,
    timeout: Duration,
}

impl HttpDiscovery {
    pub fn new(http: rquest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RemoteDiscovery for HttpDiscovery {
    async fn discover(&self, credential: &str) -> Result<Vec<RemoteEnvironment>> {
        let send = self
            .http
            .get(&self.url)
            .header("Authorization", format!("Bearer {credential}"))
            .header("Accept", "application/json")
            .send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                RelayError::Http(format!("discovery request to {} timed out", self.url))
            })??;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: DiscoveryResponse = resp.json().await?;
        Ok(parsed.environments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::get};
    use serde_json::json;

    fn env(id: &str, ws: Option<&str>) -> RemoteEnvironment {
        RemoteEnvironment {
            id: id.into(),
            name: Some(format!("env {id}")),
            url: format!("https://{id}.example.com"),
            ws_url: ws.map(String::from),
        }
    }

    #[test]
    fn test_select_first_with_duplex() {
        let t = select_target(vec![
            env("a", None),
            env("b", Some("")),
            env("c", Some("wss://c.example.com/ws")),
            env("d", Some("wss://d.example.com/ws")),
        ])
        .unwrap();
        assert_eq!(t.remote_id.as_deref(), Some("c"));
        assert_eq!(t.name.as_deref(), Some("env c"));
        assert_eq!(t.ws_endpoint(), "wss://c.example.com/ws");
    }

    #[test]
    fn test_select_none() {
        assert!(select_target(vec![env("a", None)]).is_none());
        assert!(select_target(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_http_discovery() {
        let app = Router::new().route(
            "/environments",
            get(|headers: HeaderMap| async move {
                assert_eq!(headers["authorization"], "Bearer cred");
                Json(json!({"environments": [
                    {"id": "e1", "url": "https://e1.example.com", "wsUrl": "wss://e1.example.com/ws"}
                ]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let d = HttpDiscovery::new(
            rquest::Client::new(),
            format!("http://{addr}/environments"),
            Duration::from_secs(5),
        );
        let envs = d.discover("cred").await.unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].ws_url.as_deref(), Some("wss://e1.example.com/ws"));
    }

    #[tokio::test]
    async fn test_http_discovery_unreachable() {
        let d = HttpDiscovery::new(
            rquest::Client::new(),
            "http://127.0.0.1:1/environments",
            Duration::from_secs(5),
        );
        assert!(d.discover("cred").await.is_err());
    }
}
