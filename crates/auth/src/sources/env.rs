use async_trait::async_trait;
use keyrelay_types::{ProviderId, TokenResult, TokenSource, TokenSourceDescriptor, traits::Result};
use std::collections::BTreeMap;

pub const ENV_SOURCE_NAME: &str = "env";
pub const ENV_SOURCE_PRIORITY: i32 = 30;

/// Secret-manager style source reading `PROVIDER_TOKEN_FOR_<ID>` entries
/// from a captured environment map.
///
/// Keys are normalized like any provider id, so `PROVIDER_TOKEN_FOR_GitHub`
/// and `PROVIDER_TOKEN_FOR_GITHUB_VAULT` both serve `github`. When several
/// keys collapse onto one provider, the canonical spelling wins.
pub struct EnvSource {
    tokens: BTreeMap<ProviderId, String>,
    priority: i32,
}

impl EnvSource {
    /// Build from an explicit map. Entries without the token prefix are ignored.
    pub fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut tokens = BTreeMap::new();
        for (key, value) in vars {
            if value.is_empty() {
                continue;
            }
            let Some(id) = ProviderId::from_token_name(&key).filter(|id| !id.is_empty()) else {
                continue;
            };
            if key == id.token_name() || !tokens.contains_key(&id) {
                tokens.insert(id, value);
            }
        }
        Self {
            tokens,
            priority: ENV_SOURCE_PRIORITY,
        }
    }

    /// Snapshot the current process environment.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::new(std::env::vars())
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn lookup(&self, provider: &ProviderId) -> Option<&str> {
        self.tokens.get(provider).map(String::as_str)
    }
}

#[async_trait]
impl TokenSource for EnvSource {
    fn descriptor(&self) -> TokenSourceDescriptor {
        TokenSourceDescriptor::new(ENV_SOURCE_NAME, self.priority)
    }

    async fn can_provide(&self, provider: &ProviderId) -> Result<bool> {
        Ok(self.lookup(provider).is_some())
    }

    async fn resolve(&self, provider: &ProviderId) -> Result<TokenResult> {
        Ok(match self.lookup(provider) {
            Some(token) => TokenResult::found(token),
            None => TokenResult::failure(format!("{} is not set", provider.token_name())),
        })
    }

    async fn list_providers(&self) -> Result<Vec<ProviderId>> {
        Ok(self.tokens.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source() -> EnvSource {
        EnvSource::new([
            ("PROVIDER_TOKEN_FOR_GOOGLE_DRIVE".to_string(), "gd".to_string()),
            ("PROVIDER_TOKEN_FOR_SLACK".to_string(), String::new()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_resolve_by_token_name() {
        let s = make_source();
        let id = ProviderId::new("Google_Drive");
        assert!(s.can_provide(&id).await.unwrap());
        assert_eq!(s.resolve(&id).await.unwrap().usable_token(), Some("gd"));
    }

    #[tokio::test]
    async fn test_empty_value_ignored() {
        let s = make_source();
        let id = ProviderId::new("slack");
        assert!(!s.can_provide(&id).await.unwrap());
        assert!(!s.resolve(&id).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_loosely_spelled_keys_are_served() {
        let s = EnvSource::new([
            ("PROVIDER_TOKEN_FOR_GitHub".to_string(), "gh".to_string()),
            ("PROVIDER_TOKEN_FOR_SLACK_REMOTE".to_string(), "sl".to_string()),
        ]);
        let listed = s.list_providers().await.unwrap();
        assert_eq!(listed, vec![ProviderId::new("github"), ProviderId::new("slack")]);
        for id in &listed {
            assert!(s.can_provide(id).await.unwrap(), "{id}");
        }
        let gh = s.resolve(&ProviderId::new("github")).await.unwrap();
        assert_eq!(gh.usable_token(), Some("gh"));
    }

    #[tokio::test]
    async fn test_canonical_key_wins_collision() {
        let s = EnvSource::new([
            ("PROVIDER_TOKEN_FOR_GITHUB_VAULT".to_string(), "hinted".to_string()),
            ("PROVIDER_TOKEN_FOR_GITHUB".to_string(), "canonical".to_string()),
            ("PROVIDER_TOKEN_FOR_GitHub".to_string(), "mixed".to_string()),
        ]);
        let r = s.resolve(&ProviderId::new("github")).await.unwrap();
        assert_eq!(r.usable_token(), Some("canonical"));
    }

    #[tokio::test]
    async fn test_list_providers() {
        let ids = make_source().list_providers().await.unwrap();
        assert_eq!(ids, vec![ProviderId::new("google-drive")]);
    }
}
