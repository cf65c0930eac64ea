//! Core types and traits for the keyrelay workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! credential broker: error types, canonical provider identifiers, stored
//! token records, resolution results, and the async traits implemented by
//! token stores, token sources and refreshers.

pub mod error;
pub mod provider;
pub mod result;
pub mod token;
pub mod traits;

pub use error::{EncryptionError, RelayError};
pub use provider::{NormalizedId, ProviderId, SourceHint, normalize};
pub use result::{TokenResult, TokenSourceDescriptor};
pub use token::{ProviderToken, TokenStatus, UserInfo, epoch_ms};
pub use traits::{TokenRefresher, TokenSource, TokenStore};
