//! Async traits shared across all keyrelay crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `keyrelay-types`, not on each other.

use crate::{ProviderId, ProviderToken, TokenResult, TokenSourceDescriptor, TokenStatus, epoch_ms};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;

pub use crate::error::Result;

/// Durable per-provider credential records.
///
/// Implementations hold at most one record per [`ProviderId`].
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the record for `provider`. No side effects.
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderToken>>;

    /// Insert or replace the record for `token.provider_id`.
    ///
    /// Stamps `updated_at`; an existing record's `stored_at` is preserved.
    /// Returns the record as stored.
    async fn put(&self, token: ProviderToken) -> Result<ProviderToken>;

    /// Remove the record for `provider`. Removing a missing record is not an error.
    async fn remove(&self, provider: &ProviderId) -> Result<()>;

    /// All stored records, ordered by provider id.
    async fn list(&self) -> Result<Vec<ProviderToken>>;

    /// Status map over every stored record, evaluated against the wall clock.
    async fn status(&self) -> Result<BTreeMap<ProviderId, TokenStatus>> {
        let now = epoch_ms();
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|t| (t.provider_id.clone(), t.status_at(now)))
            .collect())
    }
}

/// A pluggable backend that can answer "do you have a credential for this
/// provider, and what is it".
///
/// `can_provide` is meant to be cheap and should report internal problems as
/// `Ok(false)`. Callers still treat an `Err` (or a panic) from any method as
/// that source being unavailable and move on.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Name and priority used for ordering inside a registry.
    fn descriptor(&self) -> TokenSourceDescriptor;

    /// Fast existence check for `provider`.
    async fn can_provide(&self, provider: &ProviderId) -> Result<bool>;

    /// Fetch the credential for `provider`.
    async fn resolve(&self, provider: &ProviderId) -> Result<TokenResult>;

    /// Providers this source can currently serve. Best effort.
    async fn list_providers(&self) -> Result<Vec<ProviderId>>;
}

/// Exchanges a refresh token for a fresh [`ProviderToken`].
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: &ProviderId, refresh_token: &str) -> Result<ProviderToken>;
}

#[async_trait]
impl<F, Fut> TokenRefresher for F
where
    F: Fn(ProviderId, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProviderToken>> + Send,
{
    async fn refresh(&self, provider: &ProviderId, refresh_token: &str) -> Result<ProviderToken> {
        (self)(provider.clone(), refresh_token.to_owned()).await
    }
}
