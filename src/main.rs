use anyhow::Result;
use clap::{Parser, Subcommand};
use keyrelay_auth::{
    AuthManager, EnvSource, LocalStoreSource, OAuthRefresher, SourceRegistry, VaultSource,
    refresh_expired_tokens,
};
use keyrelay_config::{Config, ConfigWatcher, LogConfig, paths};
use keyrelay_executor::{
    ConnectionEvent, ConnectionOptions, CredentialEncryptionBridge, CredentialHandoff,
    ExecutorConnection, HttpDiscovery,
};
use keyrelay_store::SqliteTokenStore;
use keyrelay_types::{ProviderId, ProviderToken, TokenRefresher, UserInfo};
use std::{path::PathBuf, sync::Arc};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "keyrelay", about = "Provider credential broker for task executors")]
struct Cli {
    /// Path to the YAML configuration file (default: ~/.config/keyrelay/config.yaml).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// SQLite database path (default: ~/.keyrelay/tokens.db).
    #[arg(long, global = true, value_name = "PATH", env = "KEYRELAY_DB")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh expired tokens, connect to the executor and serve credential requests.
    Run,
    /// Show stored credentials and their expiry state.
    Status,
    /// Store a credential obtained elsewhere.
    Import {
        /// Provider id (any spelling; it is normalized).
        provider: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Lifetime of the access token in seconds.
        #[arg(long)]
        expires_in: Option<u64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Remove stored credentials for a provider.
    Logout {
        provider: String,
    },
    /// Resolve a provider through every configured source.
    Resolve {
        provider: String,
        /// Print the token itself instead of a masked preview.
        #[arg(long)]
        show: bool,
    },
    /// List the credential names the executor would be offered.
    Tokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(paths::config_path);
    let config = load_config(&config_path)?;
    // Only the long-running broker writes log files by default.
    let file_dir = if matches!(cli.command, Commands::Run) {
        Some(config.log.file_dir.clone().unwrap_or_else(paths::log_dir))
    } else {
        config.log.file_dir.clone()
    };
    let _guard = init_tracing(&config.log, file_dir.as_deref());

    match cli.command {
        Commands::Run => cmd_run(config_path, config, cli.db).await,
        Commands::Status => cmd_status(cli.db).await,
        Commands::Import {
            provider,
            access_token,
            refresh_token,
            expires_in,
            name,
            email,
        } => {
            let user = (name.is_some() || email.is_some()).then_some(UserInfo { name, email });
            cmd_import(cli.db, &provider, access_token, refresh_token, expires_in, user).await
        }
        Commands::Logout { provider } => cmd_logout(cli.db, &provider).await,
        Commands::Resolve { provider, show } => cmd_resolve(&config, cli.db, &provider, show).await,
        Commands::Tokens => cmd_tokens(&config, cli.db).await,
    }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    let config = if path.exists() {
        Config::from_file(path)
    } else {
        Config::from_env()
    };
    config.map_err(|e| anyhow::anyhow!("config error: {e}"))
}

fn init_tracing(log: &LogConfig, file_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::{EnvFilter, Layer as _, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = if log.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "keyrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .with(filter)
        .init();
    guard
}

async fn cmd_run(config_path: PathBuf, config: Config, db: Option<PathBuf>) -> Result<()> {
    let http = rquest::Client::new();
    let auth = open_auth(db, &config).await?;
    let refresher: Arc<dyn TokenRefresher> = Arc::new(
        OAuthRefresher::new(http.clone(), config.refresh.endpoints.clone())
            .with_timeout(config.refresh.timeout()),
    );

    let report = refresh_expired_tokens(&auth, refresher.as_ref()).await;
    if !report.failed.is_empty() {
        tracing::warn!(providers = ?report.failed, "some expired tokens could not be refreshed");
    }

    let registry = Arc::new(build_registry(&config, Arc::clone(&auth), refresher, &http));
    let bridge =
        CredentialEncryptionBridge::new(http.clone(), config.executor.public_key_timeout());
    let handoff = Arc::new(CredentialHandoff::new(registry, bridge));

    let mut connection = ExecutorConnection::spawn(
        ConnectionOptions::from(&config.executor),
        handoff,
        config.executor.credential.clone(),
    );
    if let Some(url) = &config.executor.discovery_url {
        connection = connection.with_discovery(Arc::new(HttpDiscovery::new(
            http.clone(),
            url.clone(),
            config.executor.connect_timeout(),
        )));
    }

    spawn_event_log(&connection, Arc::clone(&auth));
    if config_path.exists() {
        watch_credential(config_path, &connection)?;
    }

    let target = connection.auto_connect().await;
    eprintln!("keyrelay relaying credentials to {target}");

    tokio::signal::ctrl_c().await?;
    let mut target_rx = connection.watch_target();
    connection.disconnect();
    // Let the actor close the socket before the runtime goes away.
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        target_rx.wait_for(Option::is_none),
    )
    .await;
    eprintln!("keyrelay stopped");
    Ok(())
}

/// Log connection events; surface refresh failures when the executor drops.
fn spawn_event_log(connection: &ExecutorConnection, auth: Arc<AuthManager>) {
    let mut events = connection.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::ReconnectExhausted { target, attempts }) => {
                    eprintln!(
                        "disconnected from {target} after {attempts} attempts; \
                         waiting for a new credential"
                    );
                    for failure in auth.failures() {
                        eprintln!(
                            "  {}: {} refresh failures ({})",
                            failure.provider_id, failure.consecutive_failures, failure.last_error
                        );
                    }
                }
                Ok(event) => tracing::debug!(event = ?event, "connection event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "connection event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Push executor credential changes from the config file into the connection.
fn watch_credential(path: PathBuf, connection: &ExecutorConnection) -> Result<()> {
    let watcher =
        Arc::new(ConfigWatcher::new(path).map_err(|e| anyhow::anyhow!("config error: {e}"))?);
    let mut generations = watcher.subscribe();
    Arc::clone(&watcher).watch()?;

    let connection = connection.clone();
    tokio::spawn(async move {
        while generations.changed().await.is_ok() {
            let credential = watcher.load().executor.credential.clone();
            connection.set_credential(credential);
        }
    });
    Ok(())
}

async fn cmd_status(db: Option<PathBuf>) -> Result<()> {
    let store = open_store(db).await?;
    let auth = AuthManager::new(Arc::new(store));
    let status = auth
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("status failed: {e}"))?;
    if status.is_empty() {
        println!("no stored credentials");
    }
    for (provider, s) in status {
        let state = if s.expired { "expired" } else { "valid" };
        let who = s
            .user
            .and_then(|u| u.email.or(u.name))
            .map(|u| format!(" ({u})"))
            .unwrap_or_default();
        println!("{provider}: {state}{who}");
    }
    Ok(())
}

async fn cmd_import(
    db: Option<PathBuf>,
    provider_str: &str,
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    user: Option<UserInfo>,
) -> Result<()> {
    let provider = parse_provider(provider_str)?;
    let mut token = ProviderToken::new(provider.clone(), access_token);
    if let Some(refresh) = refresh_token {
        token = token.with_refresh(refresh);
    }
    if let Some(secs) = expires_in {
        token = token.with_expiry(secs);
    }
    if let Some(user) = user {
        token = token.with_user(user);
    }

    let auth = AuthManager::new(Arc::new(open_store(db).await?));
    auth.save_token(token)
        .await
        .map_err(|e| anyhow::anyhow!("import failed: {e}"))?;
    eprintln!("{provider} stored");
    Ok(())
}

async fn cmd_logout(db: Option<PathBuf>, provider_str: &str) -> Result<()> {
    let provider = parse_provider(provider_str)?;
    let auth = AuthManager::new(Arc::new(open_store(db).await?));
    auth.remove_token(&provider)
        .await
        .map_err(|e| anyhow::anyhow!("logout failed: {e}"))?;
    eprintln!("{provider} logged out");
    Ok(())
}

async fn cmd_resolve(
    config: &Config,
    db: Option<PathBuf>,
    provider: &str,
    show: bool,
) -> Result<()> {
    let registry = open_registry(config, db).await?;
    let result = registry.resolve(provider).await;
    match result.usable_token() {
        Some(token) => {
            let shown = if show { token.to_string() } else { mask(token) };
            println!(
                "{}: {shown} (source: {})",
                registry.normalize(provider).id,
                result.source.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        None => anyhow::bail!(
            "{}",
            result.error.unwrap_or_else(|| "resolution failed".into())
        ),
    }
}

async fn cmd_tokens(config: &Config, db: Option<PathBuf>) -> Result<()> {
    let registry = open_registry(config, db).await?;
    for listing in registry.list_all_providers().await {
        println!(
            "{}\t{}",
            listing.provider_id.token_name(),
            listing.source_name
        );
    }
    Ok(())
}

fn parse_provider(raw: &str) -> Result<ProviderId> {
    let provider = ProviderId::new(raw);
    if provider.is_empty() {
        anyhow::bail!("invalid provider '{raw}'");
    }
    Ok(provider)
}

fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…")
}

fn build_registry(
    config: &Config,
    auth: Arc<AuthManager>,
    refresher: Arc<dyn TokenRefresher>,
    http: &rquest::Client,
) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    if let Some(ttl) = config.resolution_cache_ttl() {
        registry = registry.with_resolution_cache(ttl);
    }
    registry.register(Arc::new(LocalStoreSource::new(auth, refresher)));
    if let Some(vault) = &config.vault {
        registry.register(Arc::new(
            VaultSource::new(http.clone(), vault)
                .with_fallback_token(config.executor.credential.clone()),
        ));
    }
    if config.env_source.enabled {
        registry.register(Arc::new(
            EnvSource::from_process_env().with_priority(config.env_source.priority),
        ));
    }
    registry
}

async fn open_registry(config: &Config, db: Option<PathBuf>) -> Result<SourceRegistry> {
    let http = rquest::Client::new();
    let auth = open_auth(db, config).await?;
    let refresher = Arc::new(
        OAuthRefresher::new(http.clone(), config.refresh.endpoints.clone())
            .with_timeout(config.refresh.timeout()),
    );
    Ok(build_registry(config, auth, refresher, &http))
}

async fn open_auth(db: Option<PathBuf>, config: &Config) -> Result<Arc<AuthManager>> {
    let store = open_store(db).await?;
    Ok(Arc::new(
        AuthManager::new(Arc::new(store)).with_refresh_cooldown(config.refresh.cooldown()),
    ))
}

async fn open_store(db: Option<PathBuf>) -> Result<SqliteTokenStore> {
    let path = db.unwrap_or_else(paths::db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let url = format!("sqlite://{}", path.display());
    SqliteTokenStore::new(&url)
        .await
        .map_err(|e| anyhow::anyhow!("database error: {e}"))
}
