//! JSON envelopes exchanged with the executor.
//!
//! Every frame is an object with a `type` discriminator. Inbound frames are
//! first decoded into the loose [`Envelope`] shape, then classified into
//! [`Inbound`]. Outbound frames are the typed [`Outbound`] variants.
use keyrelay_types::{UserInfo, epoch_ms};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const REQUEST_PROVIDER_TOKEN: &str = "request-provider-token";
pub const REQUEST_USER_TOKENS: &str = "request-user-tokens";
pub const PING: &str = "ping";

/// Generic wire envelope `{type, id?, data?, requestId?, timestamp?, ...}`.
///
/// Only `type` has a fixed shape. The optional fields stay untyped so an
/// unusual `id` or `timestamp` never prevents a request from being answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Any other top-level fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Correlation ids may arrive as strings or numbers.
fn correlation_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Envelope {
    fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `requestId` as a string, if it is a non-empty string or a number.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        correlation_id(self.request_id.as_ref())
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The executor needs the credential for `provider_id`. A missing
    /// provider id still requires an (error) answer.
    RequestProviderToken {
        provider_id: Option<String>,
        request_id: String,
    },
    RequestUserTokens {
        request_id: Option<String>,
    },
    Ping {
        request_id: Option<String>,
    },
    Other(Envelope),
}

/// Why an inbound frame was dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} envelope without requestId")]
    MissingRequestId(&'static str),
}

/// Decode and classify one text frame.
///
/// # Errors
///
/// Returns [`DecodeError`] when the frame is not an envelope, or when a
/// credential request carries no `requestId` to answer to.
pub fn parse_inbound(text: &str) -> Result<Inbound, DecodeError> {
    let env: Envelope = serde_json::from_str(text)?;
    Ok(match env.kind.as_str() {
        REQUEST_PROVIDER_TOKEN => {
            let request_id = env
                .request_id()
                .ok_or(DecodeError::MissingRequestId(REQUEST_PROVIDER_TOKEN))?;
            let provider_id = env
                .extra_str("providerId")
                .map(String::from)
                .or_else(|| {
                    env.data
                        .as_ref()
                        .and_then(|d| d.get("providerId"))
                        .and_then(Value::as_str)
                        .map(String::from)
                });
            Inbound::RequestProviderToken {
                provider_id,
                request_id,
            }
        }
        REQUEST_USER_TOKENS => Inbound::RequestUserTokens {
            request_id: env.request_id(),
        },
        PING => Inbound::Ping {
            request_id: env.request_id().or_else(|| correlation_id(env.id.as_ref())),
        },
        _ => Inbound::Other(env),
    })
}

/// Answer to a `request-provider-token` envelope. Carries either `token` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_method: Option<String>,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub request_id: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CredentialResponse {
    pub fn delivered(
        provider_id: impl Into<String>,
        request_id: impl Into<String>,
        ciphertext: String,
        encryption_method: &str,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            token: Some(ciphertext),
            encrypted: true,
            encryption_method: Some(encryption_method.to_string()),
            authenticated: true,
            user: None,
            provider_name: None,
            source: None,
            request_id: request_id.into(),
            timestamp: epoch_ms(),
            error: None,
        }
    }

    pub fn failed(
        provider_id: impl Into<String>,
        request_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            token: None,
            encrypted: false,
            encryption_method: None,
            authenticated: false,
            user: None,
            provider_name: None,
            source: None,
            request_id: request_id.into(),
            timestamp: epoch_ms(),
            error: Some(error.into()),
        }
    }
}

/// Frames the broker sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Outbound {
    ProviderAuthToken(CredentialResponse),
    UserTokensAvailable {
        tokens_available: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: u64,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: u64,
    },
}

impl Outbound {
    #[must_use]
    pub fn tokens_available(tokens: Vec<String>, request_id: Option<String>) -> Self {
        Self::UserTokensAvailable {
            tokens_available: tokens,
            request_id,
            timestamp: epoch_ms(),
        }
    }

    #[must_use]
    pub fn pong(request_id: Option<String>) -> Self {
        Self::Pong {
            request_id,
            timestamp: epoch_ms(),
        }
    }
}
