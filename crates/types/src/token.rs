//! Stored provider credential records and expiry logic.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ProviderId;

/// Return current epoch millis.
#[must_use]
pub fn epoch_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Opaque display information about the account a token belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A locally-owned credential for one provider.
///
/// At most one record exists per [`ProviderId`]. A record without
/// `expires_at` never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderToken {
    pub provider_id: ProviderId,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub stored_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl ProviderToken {
    /// Create a non-expiring token stamped with the current time.
    pub fn new(provider_id: ProviderId, access_token: impl Into<String>) -> Self {
        let now = epoch_ms();
        Self {
            provider_id,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            user: None,
            stored_at: now,
            updated_at: now,
        }
    }

    /// Set the expiry to `expires_in_secs` seconds from now.
    #[must_use]
    pub fn with_expiry(mut self, expires_in_secs: u64) -> Self {
        self.expires_at = Some(epoch_ms().saturating_add(expires_in_secs.saturating_mul(1000)));
        self
    }

    /// Set an absolute expiry in epoch milliseconds.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at_ms: u64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    /// Attach a refresh token.
    #[must_use]
    pub fn with_refresh(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Attach account display information.
    #[must_use]
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    /// `now >= expires_at` when an expiry is set; never expired otherwise.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|exp| now_ms >= exp)
    }

    /// [`ProviderToken::is_expired_at`] against the wall clock.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(epoch_ms())
    }

    /// Whether a refresh can be attempted for this record.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Status snapshot of this record at `now_ms`.
    #[must_use]
    pub fn status_at(&self, now_ms: u64) -> TokenStatus {
        TokenStatus {
            authenticated: !self.access_token.is_empty(),
            expired: self.is_expired_at(now_ms),
            user: self.user.clone(),
            stored_at: self.stored_at,
            updated_at: self.updated_at,
        }
    }
}

/// Per-provider entry of the token store status map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub authenticated: bool,
    pub expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    pub stored_at: u64,
    pub updated_at: u64,
}
