//! Resolution outcomes and source descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::UserInfo;

/// Name and ordering key of a token source. Lower `priority` is asked first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSourceDescriptor {
    pub name: String,
    pub priority: i32,
}

impl TokenSourceDescriptor {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Outcome of one resolution attempt.
///
/// `success == true` always comes with a non-empty `token`; build values
/// through [`TokenResult::found`] and [`TokenResult::failure`] to keep it so.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    /// Human-readable provider name (e.g. "GitHub").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    /// Name of the source that produced the token; filled in by the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenResult {
    /// A successful result. An empty token degrades to a failure.
    pub fn found(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.is_empty() {
            return Self::failure("source returned an empty token");
        }
        Self {
            success: true,
            token: Some(token),
            ..Self::default()
        }
    }

    /// A failed result carrying a reason.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<UserInfo>) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The token, if this is a usable success.
    #[must_use]
    pub fn usable_token(&self) -> Option<&str> {
        if self.success {
            self.token.as_deref().filter(|t| !t.is_empty())
        } else {
            None
        }
    }
}
