//! One-shot refresh of expired local credentials at process start.
use keyrelay_types::{ProviderId, TokenRefresher};
use serde::Serialize;

use crate::AuthManager;

/// What the startup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<ProviderId>,
    pub failed: Vec<ProviderId>,
}

impl RefreshReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.refreshed.len() + self.failed.len()
    }
}

/// Refresh every authenticated-but-expired token, one provider at a time.
///
/// Never fails: a store error or an individual refresh failure is logged
/// and the pass moves on.
pub async fn refresh_expired_tokens(
    manager: &AuthManager,
    refresher: &dyn TokenRefresher,
) -> RefreshReport {
    let mut report = RefreshReport::default();
    let status = match manager.status().await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "startup refresh skipped: token status unavailable");
            return report;
        }
    };

    let expired: Vec<_> = status
        .into_iter()
        .filter(|(_, s)| s.authenticated && s.expired)
        .map(|(id, _)| id)
        .collect();
    if expired.is_empty() {
        return report;
    }
    tracing::info!(count = expired.len(), "refreshing expired tokens");

    // Sequential to stay under provider rate limits.
    for id in expired {
        if manager.valid_access_token(&id, refresher).await.is_some() {
            report.refreshed.push(id);
        } else {
            report.failed.push(id);
        }
    }
    tracing::info!(
        refreshed = report.refreshed.len(),
        failed = report.failed.len(),
        "startup refresh finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_store::InMemoryTokenStore;
    use keyrelay_types::{ProviderToken, RelayError, epoch_ms};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_refreshes_only_expired_sequentially() {
        let m = AuthManager::new(Arc::new(InMemoryTokenStore::new()));
        let past = epoch_ms() - 1000;
        for (id, refresh) in [("a", "good"), ("b", "bad"), ("c", "good")] {
            m.save_token(
                ProviderToken::new(ProviderId::new(id), "old")
                    .with_expires_at(past)
                    .with_refresh(refresh),
            )
            .await
            .unwrap();
        }
        m.save_token(ProviderToken::new(ProviderId::new("fresh"), "valid").with_expiry(3600))
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let refresher = move |p: ProviderId, r: String| {
            seen.lock().unwrap().push(p.to_string());
            async move {
                if r == "good" {
                    Ok(ProviderToken::new(p, "new").with_expiry(3600))
                } else {
                    Err(RelayError::Auth("revoked".into()))
                }
            }
        };

        let report = refresh_expired_tokens(&m, &refresher).await;
        assert_eq!(report.refreshed, vec![ProviderId::new("a"), ProviderId::new("c")]);
        assert_eq!(report.failed, vec![ProviderId::new("b")]);
        assert_eq!(report.attempted(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);

        let status = m.status().await.unwrap();
        assert!(!status[&ProviderId::new("a")].expired);
        assert!(status[&ProviderId::new("b")].expired);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let m = AuthManager::new(Arc::new(InMemoryTokenStore::new()));
        let refresher = |_p: ProviderId, _r: String| async {
            Err::<ProviderToken, _>(RelayError::Auth("unused".into()))
        };
        assert_eq!(refresh_expired_tokens(&m, &refresher).await, RefreshReport::default());
    }
}
