//! Concrete [`TokenSource`](keyrelay_types::TokenSource) backends.
//!
//! | Source  | Default priority | Backing                                  |
//! |---------|------------------|------------------------------------------|
//! | `local` | 10               | [`AuthManager`](crate::AuthManager) store |
//! | `vault` | 20               | remote HTTP vault                        |
//! | `env`   | 30               | `PROVIDER_TOKEN_FOR_<ID>` variables       |

pub mod env;
pub mod local;
pub mod vault;

pub use env::EnvSource;
pub use local::LocalStoreSource;
pub use vault::VaultSource;
