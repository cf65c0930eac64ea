//! In-memory token store backed by a `BTreeMap` behind a `RwLock`.

use async_trait::async_trait;
use keyrelay_types::{ProviderId, ProviderToken, TokenStore, epoch_ms, traits::Result};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// An in-memory [`TokenStore`] implementation for testing and ephemeral use.
#[derive(Default)]
pub struct InMemoryTokenStore {
    data: RwLock<BTreeMap<ProviderId, ProviderToken>>,
}

impl InMemoryTokenStore {
    /// Creates a new empty in-memory token store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderToken>> {
        Ok(self.data.read().await.get(provider).cloned())
    }

    async fn put(&self, mut token: ProviderToken) -> Result<ProviderToken> {
        let mut data = self.data.write().await;
        let now = epoch_ms();
        if let Some(existing) = data.get(&token.provider_id) {
            token.stored_at = existing.stored_at;
        } else if token.stored_at == 0 {
            token.stored_at = now;
        }
        token.updated_at = now;
        data.insert(token.provider_id.clone(), token.clone());
        Ok(token)
    }

    async fn remove(&self, provider: &ProviderId) -> Result<()> {
        self.data.write().await.remove(provider);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProviderToken>> {
        Ok(self.data.read().await.values().cloned().collect())
    }
}
