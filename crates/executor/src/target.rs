//! Where the executor connection points.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Localhost,
    Remote,
}

impl TargetKind {
    /// Value of the `encryptionMethod` field for credentials sealed for this kind of target.
    #[must_use]
    pub fn encryption_method(self) -> &'static str {
        match self {
            Self::Localhost => "rsa-pkcs1v15-localhost",
            Self::Remote => "rsa-pkcs1v15-remote",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Localhost => f.write_str("localhost"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A concrete executor endpoint.
///
/// `url` is the HTTP base used for side requests such as the public-key
/// fetch. The duplex endpoint is `ws_url` when given, otherwise `url` with
/// its scheme switched to `ws`/`wss` and `/ws` appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTarget {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl ConnectionTarget {
    pub fn localhost(url: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Localhost,
            url: url.into(),
            ws_url: None,
            name: Some("localhost".into()),
            remote_id: None,
        }
    }

    pub fn remote(url: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Remote,
            url: url.into(),
            ws_url: None,
            name: None,
            remote_id: Some(remote_id.into()),
        }
    }

    #[must_use]
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// HTTP base without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    #[must_use]
    pub fn public_key_url(&self) -> String {
        format!("{}/crypto/public-key", self.base_url())
    }

    /// Duplex endpoint for this target.
    #[must_use]
    pub fn ws_endpoint(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        let base = self.base_url();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/ws")
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {name} ({})", self.kind, self.url),
            None => write!(f, "{} {}", self.kind, self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_endpoint_derived() {
        assert_eq!(
            ConnectionTarget::localhost("http://127.0.0.1:8765/").ws_endpoint(),
            "ws://127.0.0.1:8765/ws"
        );
        assert_eq!(
            ConnectionTarget::remote("https://env.example.com", "env-1").ws_endpoint(),
            "wss://env.example.com/ws"
        );
    }

    #[test]
    fn test_ws_endpoint_explicit() {
        let t = ConnectionTarget::remote("https://env.example.com", "env-1")
            .with_ws_url("wss://duplex.example.com/socket");
        assert_eq!(t.ws_endpoint(), "wss://duplex.example.com/socket");
        assert_eq!(t.public_key_url(), "https://env.example.com/crypto/public-key");
    }

    #[test]
    fn test_encryption_method() {
        assert_eq!(
            ConnectionTarget::localhost("http://x").kind.encryption_method(),
            "rsa-pkcs1v15-localhost"
        );
        assert_eq!(TargetKind::Remote.encryption_method(), "rsa-pkcs1v15-remote");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(ConnectionTarget::remote("https://e", "r1")).unwrap();
        assert_eq!(json["type"], "remote");
        assert_eq!(json["remoteId"], "r1");
        assert!(json.get("wsUrl").is_none());
    }
}
