//! Priority-ordered chain of token sources.
//!
//! Sources are consulted one at a time in ascending priority order (ties keep
//! registration order). The first source that both claims the provider and
//! returns a usable token wins. A source that errors or panics is logged and
//! skipped so it cannot block the rest of the chain.
use futures_util::FutureExt as _;
use keyrelay_types::{
    NormalizedId, ProviderId, RelayError, TokenResult, TokenSource, TokenSourceDescriptor,
    normalize, traits::Result,
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

/// One entry of [`SourceRegistry::list_all_providers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderListing {
    pub provider_id: ProviderId,
    pub source_name: String,
}

struct Entry {
    descriptor: TokenSourceDescriptor,
    source: Arc<dyn TokenSource>,
}

struct ResolutionCache {
    ttl: Duration,
    entries: Mutex<HashMap<ProviderId, (Instant, TokenResult)>>,
}

impl ResolutionCache {
    fn get(&self, id: &ProviderId) -> Option<TokenResult> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(id) {
            Some((at, result)) if at.elapsed() < self.ttl => Some(result.clone()),
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    fn insert(&self, id: ProviderId, result: TokenResult) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (Instant::now(), result));
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<Vec<Entry>>,
    cache: Option<ResolutionCache>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache successful resolutions for `ttl`. Without this every call walks
    /// the chain from the top.
    #[must_use]
    pub fn with_resolution_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(ResolutionCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        });
        self
    }

    /// Add a source. A source with the same name replaces the earlier one.
    pub fn register(&self, source: Arc<dyn TokenSource>) {
        let descriptor = source.descriptor();
        {
            let mut entries = self.write_entries();
            entries.retain(|e| e.descriptor.name != descriptor.name);
            tracing::debug!(
                source = %descriptor.name,
                priority = descriptor.priority,
                "token source registered"
            );
            entries.push(Entry { descriptor, source });
            // Stable: equal priorities keep registration order.
            entries.sort_by_key(|e| e.descriptor.priority);
        }
        self.invalidate_all();
    }

    /// Remove the source called `name`. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.write_entries();
            let before = entries.len();
            entries.retain(|e| e.descriptor.name != name);
            entries.len() != before
        };
        if removed {
            self.invalidate_all();
        }
        removed
    }

    /// Registered descriptors in consultation order.
    #[must_use]
    pub fn sources(&self) -> Vec<TokenSourceDescriptor> {
        self.read_entries()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    #[must_use]
    pub fn normalize(&self, raw: &str) -> NormalizedId {
        normalize(raw)
    }

    /// Drop any cached resolution for `provider`.
    pub fn invalidate(&self, provider: &ProviderId) {
        if let Some(cache) = &self.cache {
            cache
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(provider);
        }
    }

    fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Resolve `raw_id` to a token. Never returns an error: exhaustion and
    /// source failures are reported inside the [`TokenResult`].
    pub async fn resolve(&self, raw_id: &str) -> TokenResult {
        let NormalizedId { id, hints } = self.normalize(raw_id);
        if id.is_empty() {
            return TokenResult::failure(format!("invalid provider id '{raw_id}'"));
        }
        if !hints.is_empty() {
            tracing::debug!(
                provider = %id,
                hints = ?hints,
                "source hints stripped from provider id"
            );
        }

        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&id)) {
            tracing::debug!(provider = %id, "resolution cache hit");
            return hit;
        }

        for (descriptor, source) in self.snapshot() {
            let name = descriptor.name.as_str();
            match guarded(name, source.can_provide(&id)).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(source = name, provider = %id, error = %e, "can_provide failed");
                    continue;
                }
            }
            match guarded(name, source.resolve(&id)).await {
                Ok(mut result) if result.usable_token().is_some() => {
                    result.source = Some(descriptor.name.clone());
                    if !hints.is_empty() {
                        let joined = hints.iter().map(ToString::to_string).collect::<Vec<_>>();
                        result.metadata.insert("hint".into(), joined.join(","));
                    }
                    tracing::debug!(source = name, provider = %id, "token resolved");
                    if let Some(cache) = &self.cache {
                        cache.insert(id.clone(), result.clone());
                    }
                    return result;
                }
                Ok(result) => {
                    tracing::debug!(
                        source = name,
                        provider = %id,
                        error = result.error.as_deref().unwrap_or("empty token"),
                        "source claimed provider but returned no token"
                    );
                }
                Err(e) => {
                    tracing::warn!(source = name, provider = %id, error = %e, "resolve failed");
                }
            }
        }

        TokenResult::failure(RelayError::NoTokenFound(id.to_string()).to_string())
    }

    /// Every provider any source can serve, tagged with the source name.
    /// Failing sources contribute nothing.
    pub async fn list_all_providers(&self) -> Vec<ProviderListing> {
        let mut out = Vec::new();
        for (descriptor, source) in self.snapshot() {
            match guarded(&descriptor.name, source.list_providers()).await {
                Ok(ids) => out.extend(ids.into_iter().map(|provider_id| ProviderListing {
                    provider_id,
                    source_name: descriptor.name.clone(),
                })),
                Err(e) => {
                    tracing::warn!(source = %descriptor.name, error = %e, "list_providers failed");
                }
            }
        }
        out
    }

    /// Wire-level names (`PROVIDER_TOKEN_FOR_<ID>`) of every available
    /// provider, sorted and deduplicated.
    pub async fn list_all_token_names(&self) -> Vec<String> {
        self.list_all_providers()
            .await
            .into_iter()
            .map(|l| l.provider_id.token_name())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn snapshot(&self) -> Vec<(TokenSourceDescriptor, Arc<dyn TokenSource>)> {
        self.read_entries()
            .iter()
            .map(|e| (e.descriptor.clone(), Arc::clone(&e.source)))
            .collect()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a source call, turning a panic into [`RelayError::SourceUnavailable`].
async fn guarded<T>(name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(RelayError::SourceUnavailable {
                source_name: name.to_string(),
                message: "source panicked".into(),
            })
        })
}
