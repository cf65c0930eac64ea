use keyrelay_types::ProviderId;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Prefix for environment overrides, e.g. `KEYRELAY_EXECUTOR__CREDENTIAL`.
pub const ENV_PREFIX: &str = "KEYRELAY_";

fn default_true() -> bool {
    true
}

fn default_localhost_url() -> String {
    "http://127.0.0.1:8765".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_public_key_timeout_ms() -> u64 {
    5_000
}

/// Where and how to reach the task-execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Fallback endpoint used when no remote environment is discovered.
    #[serde(default = "default_localhost_url")]
    pub localhost_url: String,
    /// Remote environment discovery API. Discovery is skipped when unset.
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Bearer credential presented to the executor and the discovery API.
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_public_key_timeout_ms")]
    pub public_key_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            localhost_url: default_localhost_url(),
            discovery_url: None,
            credential: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            public_key_timeout_ms: default_public_key_timeout_ms(),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn public_key_timeout(&self) -> Duration {
        Duration::from_millis(self.public_key_timeout_ms)
    }
}

fn default_vault_priority() -> i32 {
    20
}

/// Remote vault token source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Base URL of the vault service.
    pub url: String,
    /// Bearer token for the vault. Falls back to the executor credential.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_vault_priority")]
    pub priority: i32,
}

fn default_env_priority() -> i32 {
    30
}

/// Environment-variable token source (`PROVIDER_TOKEN_FOR_<ID>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_env_priority")]
    pub priority: i32,
}

impl Default for EnvSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_env_priority(),
        }
    }
}

/// OAuth refresh-token grant endpoint for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshEndpoint {
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_cooldown_secs() -> u64 {
    30
}
fn default_refresh_timeout_ms() -> u64 {
    15_000
}

/// Token refresh settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Minimum spacing between refresh attempts for one provider.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Upper bound on one refresh request, response body included.
    #[serde(default = "default_refresh_timeout_ms")]
    pub timeout_ms: u64,
    /// Refresh endpoints keyed by provider id.
    #[serde(default)]
    pub endpoints: HashMap<ProviderId, RefreshEndpoint>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            timeout_ms: default_refresh_timeout_ms(),
            endpoints: HashMap::new(),
        }
    }
}

impl RefreshConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated log files into this directory.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_dir: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub vault: Option<VaultConfig>,
    #[serde(default)]
    pub env_source: EnvSourceConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Lifetime of cached resolutions in the source registry; `0` disables caching.
    #[serde(default)]
    pub resolution_cache_ttl_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration from a file path, merged with defaults and then
    /// with `KEYRELAY_`-prefixed environment variables (`__` separates levels).
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: &std::path::Path) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Defaults overlaid with environment variables only.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if an environment value has the wrong type.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Serialized},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    #[must_use]
    pub fn resolution_cache_ttl(&self) -> Option<Duration> {
        (self.resolution_cache_ttl_secs > 0)
            .then(|| Duration::from_secs(self.resolution_cache_ttl_secs))
    }
}
