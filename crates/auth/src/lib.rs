//! Credential resolution for the keyrelay broker.
//!
//! [`AuthManager`] owns the lifecycle of locally-stored tokens (expiry,
//! refresh, per-provider failure status). Concrete [`sources`] adapt the
//! local store, a remote vault and the environment to the shared
//! `TokenSource` trait, and [`SourceRegistry`] chains them by priority.

pub mod manager;
pub mod refresh;
pub mod registry;
pub mod sources;
pub mod startup;

pub use manager::{AuthManager, RefreshFailure};
pub use refresh::OAuthRefresher;
pub use registry::{ProviderListing, SourceRegistry};
pub use sources::{EnvSource, LocalStoreSource, VaultSource};
pub use startup::{RefreshReport, refresh_expired_tokens};
