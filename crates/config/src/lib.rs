//! Configuration loading and hot-reloading for the keyrelay broker.
//!
//! Uses figment for YAML + environment configuration with sensible defaults,
//! and notify + arc-swap for live file watching.

pub mod paths;
pub mod schema;
pub mod watcher;

pub use schema::{
    Config, EnvSourceConfig, ExecutorConfig, LogConfig, RefreshConfig, RefreshEndpoint,
    VaultConfig,
};
pub use watcher::ConfigWatcher;
