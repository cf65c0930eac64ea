use async_trait::async_trait;
use keyrelay_types::{
    ProviderId, TokenRefresher, TokenResult, TokenSource, TokenSourceDescriptor, traits::Result,
};
use std::sync::Arc;

use crate::AuthManager;

pub const LOCAL_SOURCE_NAME: &str = "local";
pub const LOCAL_SOURCE_PRIORITY: i32 = 10;

/// Serves tokens owned by the local [`AuthManager`], refreshing expired
/// ones on the way out.
pub struct LocalStoreSource {
    manager: Arc<AuthManager>,
    refresher: Arc<dyn TokenRefresher>,
    priority: i32,
}

impl LocalStoreSource {
    pub fn new(manager: Arc<AuthManager>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            manager,
            refresher,
            priority: LOCAL_SOURCE_PRIORITY,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl TokenSource for LocalStoreSource {
    fn descriptor(&self) -> TokenSourceDescriptor {
        TokenSourceDescriptor::new(LOCAL_SOURCE_NAME, self.priority)
    }

    async fn can_provide(&self, provider: &ProviderId) -> Result<bool> {
        // An expired record still counts when it carries a refresh token.
        Ok(self
            .manager
            .get(provider)
            .await?
            .is_some_and(|t| !t.is_expired() || t.can_refresh()))
    }

    async fn resolve(&self, provider: &ProviderId) -> Result<TokenResult> {
        let Some(access) = self
            .manager
            .valid_access_token(provider, self.refresher.as_ref())
            .await
        else {
            return Ok(TokenResult::failure(format!(
                "no valid local token for {provider}"
            )));
        };
        let user = self.manager.get(provider).await?.and_then(|t| t.user);
        Ok(TokenResult::found(access).with_user(user))
    }

    async fn list_providers(&self) -> Result<Vec<ProviderId>> {
        self.manager.providers().await
    }
}
