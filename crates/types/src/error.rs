//! Unified error type for the keyrelay workspace.

use std::time::Duration;

use thiserror::Error;

/// Enumerates all error kinds that can occur across keyrelay crates.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Credential authentication failure (bad or missing bearer credential).
    #[error("authentication error: {0}")]
    Auth(String),

    /// A single token source could not answer. Non-fatal: the registry
    /// falls through to the next source.
    #[error("token source '{source_name}' unavailable: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    /// Every registered source was exhausted without producing a token.
    #[error("no source provided a token for {0}")]
    NoTokenFound(String),

    /// An expired token could not be refreshed.
    #[error("token refresh failed for {provider}: {message}")]
    RefreshFailed { provider: String, message: String },

    /// Fetching the target's public key or encrypting the token failed.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// The duplex transport to the executor closed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Automatic reconnection gave up after the configured number of attempts.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistent storage (`SQLite`) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A collaborator service returned a non-success status.
    #[error("upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },
}

/// Failure while preparing a credential for delivery to an executor target.
///
/// Any of these is fatal for the single delivery it belongs to; the plaintext
/// token is never sent as a fallback.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The public-key request could not be sent or answered.
    #[error("failed to fetch public key from {url}: {cause}")]
    KeyFetch { url: String, cause: String },

    /// The public-key endpoint answered, but not with a usable key.
    #[error("invalid public key response from {url}: {cause}")]
    InvalidResponse { url: String, cause: String },

    /// The key material could not be parsed as an RSA public key.
    #[error("unparseable public key: {0}")]
    InvalidKey(String),

    /// The RSA operation itself failed (e.g. payload too large for the key).
    #[error("encryption failed: {0}")]
    Cipher(String),

    /// The public-key fetch did not complete within the allotted time.
    #[error("public key fetch from {url} timed out after {elapsed:?}")]
    Timeout { url: String, elapsed: Duration },
}

// ── Feature-gated From impls ─────────────────────────────────────────────

#[cfg(feature = "rquest")]
impl From<rquest::Error> for RelayError {
    fn from(e: rquest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl RelayError {
    /// Returns `true` if the error is likely transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            Self::Http(_) | Self::ConnectionLost(_) | Self::SourceUnavailable { .. } => true,
            Self::Encryption(
                EncryptionError::KeyFetch { .. } | EncryptionError::Timeout { .. },
            ) => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_no_token() {
        let err = RelayError::NoTokenFound("google".to_string());
        assert_eq!(err.to_string(), "no source provided a token for google");
    }

    #[test]
    fn test_error_display_source_unavailable() {
        let err = RelayError::SourceUnavailable {
            source_name: "vault".into(),
            message: "connection refused".into(),
        };
        let s = err.to_string();
        assert!(s.contains("vault"));
        assert!(s.contains("connection refused"));
    }

    #[test]
    fn test_encryption_error_is_transparent() {
        let err: RelayError = EncryptionError::Cipher("message too long".into()).into();
        assert_eq!(err.to_string(), "encryption failed: message too long");
        assert!(matches!(err, RelayError::Encryption(_)));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid {{{").unwrap_err();
        let err: RelayError = json_err.into();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_is_retryable_upstream() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = RelayError::Upstream {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404] {
            let err = RelayError::Upstream {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn test_is_retryable_encryption() {
        let fetch: RelayError = EncryptionError::KeyFetch {
            url: "http://x".into(),
            cause: "refused".into(),
        }
        .into();
        assert!(fetch.is_retryable());
        let cipher: RelayError = EncryptionError::Cipher("bad".into()).into();
        assert!(!cipher.is_retryable());
    }

    #[test]
    fn test_is_retryable_other_errors() {
        assert!(!RelayError::Auth("bad".into()).is_retryable());
        assert!(!RelayError::Config("bad".into()).is_retryable());
        assert!(!RelayError::NoTokenFound("gh".into()).is_retryable());
        assert!(!RelayError::ReconnectExhausted { attempts: 10 }.is_retryable());
    }
}
