//! Resolve, seal and answer credential requests from the executor.
use keyrelay_auth::SourceRegistry;
use keyrelay_types::{RelayError, traits::Result};
use rsa::RsaPublicKey;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    crypto::CredentialEncryptionBridge,
    envelope::{CredentialResponse, Outbound},
    target::ConnectionTarget,
};

/// Turns a `request-provider-token` into exactly one `provider-auth-token`
/// answer. Public keys are cached per target URL until [`forget`](Self::forget).
pub struct CredentialHandoff {
    registry: Arc<SourceRegistry>,
    bridge: CredentialEncryptionBridge,
    keys: Mutex<HashMap<String, RsaPublicKey>>,
}

impl CredentialHandoff {
    pub fn new(registry: Arc<SourceRegistry>, bridge: CredentialEncryptionBridge) -> Self {
        Self {
            registry,
            bridge,
            keys: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Answer one credential request for `target`. Never fails: resolution
    /// and encryption problems become an error response with the same id.
    pub async fn respond(
        &self,
        provider_id: Option<&str>,
        request_id: &str,
        target: &ConnectionTarget,
        credential: Option<&str>,
    ) -> CredentialResponse {
        let Some(raw) = provider_id.filter(|p| !p.trim().is_empty()) else {
            return CredentialResponse::failed("", request_id, "missing providerId");
        };

        let resolved = self.registry.resolve(raw).await;
        let Some(token) = resolved.usable_token() else {
            let error = resolved
                .error
                .unwrap_or_else(|| RelayError::NoTokenFound(raw.to_string()).to_string());
            tracing::warn!(
                provider = raw,
                request_id,
                error = %error,
                "credential request unresolved"
            );
            return CredentialResponse::failed(raw, request_id, error);
        };

        match self.seal(token, target, credential).await {
            Ok(ciphertext) => {
                tracing::info!(
                    provider = raw,
                    request_id,
                    source = resolved.source.as_deref().unwrap_or("-"),
                    target = %target,
                    "credential delivered"
                );
                let mut response = CredentialResponse::delivered(
                    raw,
                    request_id,
                    ciphertext,
                    target.kind.encryption_method(),
                );
                response.user = resolved.user;
                response.provider_name = resolved.provider_name;
                response.source = resolved.source;
                response
            }
            Err(e) => {
                tracing::warn!(
                    provider = raw,
                    request_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "credential encryption failed"
                );
                CredentialResponse::failed(raw, request_id, e.to_string())
            }
        }
    }

    /// Status envelope listing every credential the registry could supply.
    pub async fn tokens_available(&self, request_id: Option<String>) -> Outbound {
        Outbound::tokens_available(self.registry.list_all_token_names().await, request_id)
    }

    /// Drop the cached key for `target`.
    pub fn forget(&self, target: &ConnectionTarget) {
        self.lock_keys().remove(target.base_url());
    }

    fn cached_key(&self, target: &ConnectionTarget) -> Option<RsaPublicKey> {
        self.lock_keys().get(target.base_url()).cloned()
    }

    async fn seal(
        &self,
        token: &str,
        target: &ConnectionTarget,
        credential: Option<&str>,
    ) -> Result<String> {
        let key = match self.cached_key(target) {
            Some(key) => key,
            None => {
                let key = self.bridge.fetch_public_key(target, credential).await?;
                self.lock_keys()
                    .insert(target.base_url().to_string(), key.clone());
                key
            }
        };
        let sealed = self
            .bridge
            .encrypt_for_target(token, target, credential, Some(&key))
            .await
            .map_err(RelayError::from);
        if sealed.is_err() {
            self.forget(target);
        }
        sealed
    }

    fn lock_keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, RsaPublicKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
