//! Sealing provider tokens for a specific executor target.
//!
//! The target publishes an RSA public key at `{url}/crypto/public-key`; the
//! token's UTF-8 bytes are encrypted with PKCS#1 v1.5 padding and the
//! ciphertext is sent base64-encoded. Nothing is ever sent in plaintext:
//! every failure surfaces as an [`EncryptionError`].
use base64::{Engine as _, engine::general_purpose::STANDARD};
use keyrelay_types::EncryptionError;
use rsa::{
    Pkcs1v15Encrypt, RsaPublicKey, pkcs1::DecodeRsaPublicKey as _, pkcs8::DecodePublicKey as _,
};
use serde::Deserialize;
use std::time::Duration;

use crate::target::ConnectionTarget;

/// Body of `GET {target}/crypto/public-key`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Parse a PEM public key, accepting SPKI (`BEGIN PUBLIC KEY`) or PKCS#1
/// (`BEGIN RSA PUBLIC KEY`).
///
/// # Errors
///
/// Returns [`EncryptionError::InvalidKey`] if neither encoding parses.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, EncryptionError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|spki_err| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| spki_err.to_string())
        })
        .map_err(EncryptionError::InvalidKey)
}

/// Encrypt `plain` with `key` and base64-encode the result.
///
/// # Errors
///
/// Returns [`EncryptionError::Cipher`] if the payload does not fit the key.
pub fn encrypt_with_key(plain: &str, key: &RsaPublicKey) -> Result<String, EncryptionError> {
    let mut rng = rand::thread_rng();
    let ciphertext = key
        .encrypt(&mut rng, Pkcs1v15Encrypt, plain.as_bytes())
        .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
    Ok(STANDARD.encode(ciphertext))
}

#[derive(Clone)]
pub struct CredentialEncryptionBridge {
    http: rquest::Client,
    timeout: Duration,
}

impl CredentialEncryptionBridge {
    pub fn new(http: rquest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Fetch and parse the target's public key.
    ///
    /// # Errors
    ///
    /// Returns an [`EncryptionError`] if the request fails or times out, the
    /// response is not `success` with a non-empty key, or the key does not parse.
    pub async fn fetch_public_key(
        &self,
        target: &ConnectionTarget,
        credential: Option<&str>,
    ) -> Result<RsaPublicKey, EncryptionError> {
        let url = target.public_key_url();
        let mut req = self.http.get(&url).header("Accept", "application/json");
        if let Some(credential) = credential {
            req = req.header("Authorization", format!("Bearer {credential}"));
        }

        let resp = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| EncryptionError::Timeout {
                url: url.clone(),
                elapsed: self.timeout,
            })?
            .map_err(|e| EncryptionError::KeyFetch {
                url: url.clone(),
                cause: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EncryptionError::KeyFetch {
                url,
                cause: format!("status {status}"),
            });
        }
        let body: PublicKeyResponse =
            resp.json().await.map_err(|e| EncryptionError::InvalidResponse {
                url: url.clone(),
                cause: e.to_string(),
            })?;
        if !body.success {
            return Err(EncryptionError::InvalidResponse {
                url,
                cause: "success is false".into(),
            });
        }
        let pem = body
            .public_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EncryptionError::InvalidResponse {
                url: url.clone(),
                cause: "empty publicKey".into(),
            })?;
        tracing::debug!(
            url = %url,
            algorithm = body.algorithm.as_deref().unwrap_or("unknown"),
            fingerprint = body.fingerprint.as_deref().unwrap_or("-"),
            "fetched executor public key"
        );
        parse_public_key(&pem)
    }

    /// Encrypt `plain` for `target`, returning base64 ciphertext. `key` skips
    /// the fetch when the caller already holds the target's key.
    ///
    /// # Errors
    ///
    /// Returns an [`EncryptionError`] if the key fetch or the cipher fails.
    pub async fn encrypt_for_target(
        &self,
        plain: &str,
        target: &ConnectionTarget,
        credential: Option<&str>,
        key: Option<&RsaPublicKey>,
    ) -> Result<String, EncryptionError> {
        match key {
            Some(key) => encrypt_with_key(plain, key),
            None => {
                let key = self.fetch_public_key(target, credential).await?;
                encrypt_with_key(plain, &key)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::get};
    use rsa::{
        RsaPrivateKey,
        pkcs1::EncodeRsaPublicKey as _,
        pkcs8::{EncodePublicKey as _, LineEnding},
    };
    use serde_json::json;

    pub(crate) fn keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }

    pub(crate) fn decrypt(private: &RsaPrivateKey, b64: &str) -> String {
        let bytes = STANDARD.decode(b64).unwrap();
        String::from_utf8(private.decrypt(Pkcs1v15Encrypt, &bytes).unwrap()).unwrap()
    }

    /// Serve `body` at `/crypto/public-key`, requiring `Bearer cred`.
    pub(crate) async fn serve_key(body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/crypto/public-key",
            get(move |headers: HeaderMap| {
                let body = body.clone();
                async move {
                    assert_eq!(headers["authorization"], "Bearer cred");
                    Json(body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn bridge() -> CredentialEncryptionBridge {
        CredentialEncryptionBridge::new(rquest::Client::new(), Duration::from_secs(5))
    }

    #[test]
    fn test_parse_pkcs1_and_spki() {
        let (private, spki) = keypair();
        assert!(parse_public_key(&spki).is_ok());
        let pkcs1 = RsaPublicKey::from(&private)
            .to_pkcs1_pem(LineEnding::LF)
            .unwrap();
        assert!(parse_public_key(&pkcs1).is_ok());
        assert!(matches!(
            parse_public_key("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----"),
            Err(EncryptionError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_encrypt_roundtrip() {
        let (private, pem) = keypair();
        let key = parse_public_key(&pem).unwrap();
        let b64 = encrypt_with_key("ghp_secret", &key).unwrap();
        assert_eq!(decrypt(&private, &b64), "ghp_secret");
    }

    #[test]
    fn test_payload_too_large() {
        let (_, pem) = keypair();
        let key = parse_public_key(&pem).unwrap();
        let big = "x".repeat(512);
        assert!(matches!(
            encrypt_with_key(&big, &key),
            Err(EncryptionError::Cipher(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypt_for_target_fetches_key() {
        let (private, pem) = keypair();
        let url = serve_key(json!({
            "success": true,
            "publicKey": pem,
            "algorithm": "RSA-2048",
            "createdAt": "2026-01-01T00:00:00Z",
            "fingerprint": "ab:cd"
        }))
        .await;
        let target = ConnectionTarget::localhost(url);
        let b64 = bridge()
            .encrypt_for_target("tok", &target, Some("cred"), None)
            .await
            .unwrap();
        assert_eq!(decrypt(&private, &b64), "tok");
    }

    #[tokio::test]
    async fn test_supplied_key_skips_fetch() {
        let (private, pem) = keypair();
        let key = parse_public_key(&pem).unwrap();
        let target = ConnectionTarget::localhost("http://127.0.0.1:1");
        let b64 = bridge()
            .encrypt_for_target("tok", &target, None, Some(&key))
            .await
            .unwrap();
        assert_eq!(decrypt(&private, &b64), "tok");
    }

    #[tokio::test]
    async fn test_unsuccessful_response() {
        let url = serve_key(json!({"success": false, "publicKey": "x"})).await;
        let err = bridge()
            .fetch_public_key(&ConnectionTarget::localhost(url), Some("cred"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_empty_key() {
        let url = serve_key(json!({"success": true, "publicKey": ""})).await;
        let err = bridge()
            .fetch_public_key(&ConnectionTarget::localhost(url), Some("cred"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let err = bridge()
            .encrypt_for_target(
                "tok",
                &ConnectionTarget::localhost("http://127.0.0.1:1"),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::KeyFetch { .. }));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = listener.accept().await {
                held.push(s);
            }
        });
        let bridge =
            CredentialEncryptionBridge::new(rquest::Client::new(), Duration::from_millis(100));
        let err = bridge
            .fetch_public_key(&ConnectionTarget::localhost(format!("http://{addr}")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Timeout { .. }));
    }
}
