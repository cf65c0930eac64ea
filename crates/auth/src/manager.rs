//! Lifecycle manager for locally-owned provider tokens.
//!
//! Responsibilities:
//! - Load tokens from a [`TokenStore`].
//! - Detect expiration and refresh through a caller-supplied [`TokenRefresher`].
//! - Serialize refreshes per provider so two callers never race a
//!   read-modify-write of the same record.
//! - Cooldown between refresh attempts for one provider (30 s by default).
//! - Track consecutive refresh failures as a dismissible per-provider status.
use futures_util::FutureExt as _;
use keyrelay_types::{
    ProviderId, ProviderToken, RelayError, TokenRefresher, TokenStatus, TokenStore, epoch_ms,
    traits::Result,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ProviderState {
    last_refresh_attempt: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_retryable: bool,
    last_failure_at: u64,
    dismissed: bool,
}

/// Repeated refresh failures for one provider, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshFailure {
    pub provider_id: ProviderId,
    pub consecutive_failures: u32,
    pub last_error: String,
    /// Whether the last error looked transient (network, 5xx, rate limit).
    pub retryable: bool,
    pub last_failure_at: u64,
}

pub struct AuthManager {
    store: Arc<dyn TokenStore>,
    refresh_cooldown: Duration,
    refresh_locks: Mutex<HashMap<ProviderId, Arc<tokio::sync::Mutex<()>>>>,
    state: Mutex<HashMap<ProviderId, ProviderState>>,
}

impl AuthManager {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
            refresh_locks: Mutex::new(HashMap::new()),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Override the minimum spacing between refresh attempts for one provider.
    #[must_use]
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Load the raw record for `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderToken>> {
        self.store.get(provider).await
    }

    /// Save a new or updated token.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails to persist the token.
    pub async fn save_token(&self, token: ProviderToken) -> Result<ProviderToken> {
        let provider = token.provider_id.clone();
        let stored = self.store.put(token).await?;
        self.clear_failure(&provider);
        Ok(stored)
    }

    /// Remove a token (logout).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails to remove the token.
    pub async fn remove_token(&self, provider: &ProviderId) -> Result<()> {
        self.store.remove(provider).await?;
        self.lock_state().remove(provider);
        Ok(())
    }

    /// Status of every stored credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub async fn status(&self) -> Result<BTreeMap<ProviderId, TokenStatus>> {
        self.store.status().await
    }

    /// Providers with stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub async fn providers(&self) -> Result<Vec<ProviderId>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|t| t.provider_id)
            .collect())
    }

    /// Return a usable access token for `provider`, refreshing it first if it
    /// has expired.
    ///
    /// Returns `None` when there is no record, when the record is expired and
    /// cannot be refreshed, or when the refresh fails. A failed refresh leaves
    /// the stale record untouched so a later call can try again.
    pub async fn valid_access_token(
        &self,
        provider: &ProviderId,
        refresher: &dyn TokenRefresher,
    ) -> Option<String> {
        let token = self.load_logged(provider).await?;
        if !token.is_expired() {
            return Some(token.access_token);
        }
        if !token.can_refresh() {
            tracing::debug!(provider = %provider, "token expired and has no refresh token");
            return None;
        }

        let lock = self.refresh_lock(provider);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        let token = self.load_logged(provider).await?;
        if !token.is_expired() {
            return Some(token.access_token);
        }
        let refresh_token = token.refresh_token.clone()?;

        if !self.begin_refresh_attempt(provider) {
            tracing::debug!(provider = %provider, "refresh cooldown active");
            return None;
        }

        let attempt = AssertUnwindSafe(refresher.refresh(provider, &refresh_token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::RefreshFailed {
                    provider: provider.to_string(),
                    message: "refresh callback panicked".into(),
                })
            });

        match attempt {
            Ok(mut fresh) => {
                fresh.provider_id = provider.clone();
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = token.refresh_token;
                }
                if fresh.user.is_none() {
                    fresh.user = token.user;
                }
                let access = fresh.access_token.clone();
                if let Err(e) = self.store.put(fresh).await {
                    tracing::warn!(
                        provider = %provider,
                        error = %e,
                        "refreshed token could not be persisted"
                    );
                }
                self.clear_failure(provider);
                tracing::info!(provider = %provider, "token refreshed");
                Some(access)
            }
            Err(e) => {
                tracing::warn!(
                    provider = %provider,
                    error = %e,
                    retryable = e.is_retryable(),
                    "token refresh failed"
                );
                self.record_failure(provider, &e);
                None
            }
        }
    }

    /// Providers whose refreshes keep failing and whose status has not been dismissed.
    #[must_use]
    pub fn failures(&self) -> Vec<RefreshFailure> {
        let state = self.lock_state();
        let mut out: Vec<_> = state
            .iter()
            .filter(|(_, s)| s.consecutive_failures > 0 && !s.dismissed)
            .map(|(id, s)| RefreshFailure {
                provider_id: id.clone(),
                consecutive_failures: s.consecutive_failures,
                last_error: s.last_error.clone().unwrap_or_default(),
                retryable: s.last_retryable,
                last_failure_at: s.last_failure_at,
            })
            .collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    /// Hide the failure status for `provider` until the next failure.
    pub fn dismiss_failure(&self, provider: &ProviderId) {
        if let Some(s) = self.lock_state().get_mut(provider) {
            s.dismissed = true;
        }
    }

    async fn load_logged(&self, provider: &ProviderId) -> Option<ProviderToken> {
        match self.store.get(provider).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "token store read failed");
                None
            }
        }
    }

    fn refresh_lock(&self, provider: &ProviderId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(provider.clone()).or_default())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderId, ProviderState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an attempt unless one happened within the cooldown window.
    fn begin_refresh_attempt(&self, provider: &ProviderId) -> bool {
        let mut state = self.lock_state();
        let ps = state.entry(provider.clone()).or_default();
        if let Some(last) = ps.last_refresh_attempt
            && last.elapsed() < self.refresh_cooldown
        {
            return false;
        }
        ps.last_refresh_attempt = Some(Instant::now());
        true
    }

    fn record_failure(&self, provider: &ProviderId, err: &RelayError) {
        let mut state = self.lock_state();
        let ps = state.entry(provider.clone()).or_default();
        ps.consecutive_failures += 1;
        ps.last_error = Some(err.to_string());
        ps.last_retryable = err.is_retryable();
        ps.last_failure_at = epoch_ms();
        ps.dismissed = false;
    }

    fn clear_failure(&self, provider: &ProviderId) {
        if let Some(ps) = self.lock_state().get_mut(provider) {
            ps.consecutive_failures = 0;
            ps.last_error = None;
            ps.dismissed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_store::InMemoryTokenStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_manager() -> AuthManager {
        AuthManager::new(Arc::new(InMemoryTokenStore::new()))
    }

    fn gh() -> ProviderId {
        ProviderId::new("gh")
    }

    /// Refresher returning a fresh hour-long token and counting calls.
    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingRefresher {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: false,
            }
        }
        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: true,
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(
            &self,
            provider: &ProviderId,
            refresh_token: &str,
        ) -> Result<ProviderToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(RelayError::Auth(format!("revoked {refresh_token}")));
            }
            Ok(ProviderToken::new(provider.clone(), "new-access")
                .with_expires_at(epoch_ms() + 3_600_000))
        }
    }

    async fn store_expired(m: &AuthManager) {
        m.save_token(
            ProviderToken::new(gh(), "old-access")
                .with_expires_at(epoch_ms() - 1000)
                .with_refresh("r"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let m = make_manager();
        m.save_token(ProviderToken::new(gh(), "valid").with_expiry(3600))
            .await
            .unwrap();
        let r = CountingRefresher::ok();
        assert_eq!(m.valid_access_token(&gh(), &r).await.as_deref(), Some("valid"));
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let m = make_manager();
        assert!(m.valid_access_token(&gh(), &CountingRefresher::ok()).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_persisted() {
        let m = make_manager();
        store_expired(&m).await;
        let r = CountingRefresher::ok();

        let got = m.valid_access_token(&gh(), &r).await;
        assert_eq!(got.as_deref(), Some("new-access"));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);

        let stored = m.get(&gh()).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert!(!stored.is_expired());
        // refresh token carried over when the refresher omits one
        assert_eq!(stored.refresh_token.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let m = make_manager();
        m.save_token(ProviderToken::new(gh(), "old").with_expires_at(1))
            .await
            .unwrap();
        let r = CountingRefresher::ok();
        assert!(m.valid_access_token(&gh(), &r).await.is_none());
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_record_untouched() {
        let m = make_manager().with_refresh_cooldown(Duration::ZERO);
        store_expired(&m).await;
        let before = m.get(&gh()).await.unwrap().unwrap();

        assert!(m
            .valid_access_token(&gh(), &CountingRefresher::failing())
            .await
            .is_none());
        let after = m.get(&gh()).await.unwrap().unwrap();
        assert_eq!(before, after);

        // A later attempt may still succeed.
        let got = m.valid_access_token(&gh(), &CountingRefresher::ok()).await;
        assert_eq!(got.as_deref(), Some("new-access"));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_serialized() {
        let m = Arc::new(make_manager());
        store_expired(&m).await;
        let r = Arc::new(CountingRefresher::ok());

        let (a, b) = tokio::join!(
            m.valid_access_token(&gh(), r.as_ref()),
            m.valid_access_token(&gh(), r.as_ref()),
        );
        assert_eq!(a.as_deref(), Some("new-access"));
        assert_eq!(b.as_deref(), Some("new-access"));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_cooldown() {
        let m = make_manager();
        store_expired(&m).await;
        let r = CountingRefresher::failing();

        assert!(m.valid_access_token(&gh(), &r).await.is_none());
        // Second attempt immediately hits the cooldown and skips the refresher.
        assert!(m.valid_access_token(&gh(), &r).await.is_none());
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_refresher_is_contained() {
        let m = make_manager();
        store_expired(&m).await;
        let refresher = |_p: ProviderId, r: String| async move {
            if !r.is_empty() {
                panic!("refresher bug");
            }
            Err::<ProviderToken, _>(RelayError::Auth("unreachable".into()))
        };
        assert!(m.valid_access_token(&gh(), &refresher).await.is_none());
        assert_eq!(m.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_status_and_dismiss() {
        let m = make_manager().with_refresh_cooldown(Duration::ZERO);
        store_expired(&m).await;
        let r = CountingRefresher::failing();
        m.valid_access_token(&gh(), &r).await;
        m.valid_access_token(&gh(), &r).await;

        let failures = m.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].consecutive_failures, 2);
        assert!(failures[0].last_error.contains("revoked"));
        assert!(!failures[0].retryable);

        m.dismiss_failure(&gh());
        assert!(m.failures().is_empty());

        // A new failure resurfaces the status.
        m.valid_access_token(&gh(), &r).await;
        assert_eq!(m.failures()[0].consecutive_failures, 3);

        // Success clears it.
        m.valid_access_token(&gh(), &CountingRefresher::ok()).await;
        assert!(m.failures().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_marked_retryable() {
        let m = make_manager();
        store_expired(&m).await;
        let refresher = |_p: ProviderId, _r: String| async move {
            Err::<ProviderToken, _>(RelayError::Upstream {
                status: 503,
                body: "maintenance".into(),
            })
        };
        assert!(m.valid_access_token(&gh(), &refresher).await.is_none());
        let failures = m.failures();
        assert!(failures[0].retryable);
        assert!(failures[0].last_error.contains("503"));
    }

    #[tokio::test]
    async fn test_remove_token() {
        let m = make_manager();
        m.save_token(ProviderToken::new(gh(), "tok")).await.unwrap();
        m.remove_token(&gh()).await.unwrap();
        assert!(m.get(&gh()).await.unwrap().is_none());
        assert!(m.status().await.unwrap().is_empty());
    }
}
