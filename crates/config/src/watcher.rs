use crate::schema::Config;
use arc_swap::ArcSwap;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::watch;

/// Errors raised while starting the file watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create file watcher")]
    Create(#[source] notify::Error),
    #[error("failed to watch {path}")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Watches a configuration file for changes and hot-reloads on modification.
pub struct ConfigWatcher {
    /// Current configuration, atomically swappable.
    current: ArcSwap<Config>,
    /// Path to the configuration file.
    path: PathBuf,
    /// Bumped after every successful reload.
    generation: watch::Sender<u64>,
}

impl ConfigWatcher {
    /// Creates a new watcher from a file path, loading the initial configuration immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the configuration file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn new(path: PathBuf) -> Result<Self, figment::Error> {
        let config = Config::from_file(&path)?;
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            path,
            generation: watch::Sender::new(0),
        })
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn load(&self) -> arc_swap::Guard<Arc<Config>> {
        self.current.load()
    }

    /// Receiver that changes after each successful reload.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Manually reloads the configuration from disk.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the configuration file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn reload(&self) -> Result<(), figment::Error> {
        let new_config = Config::from_file(&self.path)?;
        self.current.store(Arc::new(new_config));
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Starts background file watching (spawns a blocking tokio task) that
    /// automatically reloads the configuration when the file changes.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the OS file watcher cannot be created or the
    /// config file path cannot be registered for watching.
    pub fn watch(self: Arc<Self>) -> Result<(), WatchError> {
        use notify::{RecursiveMode, Watcher as _};

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })
        .map_err(WatchError::Create)?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: self.path.clone(),
                source,
            })?;

        tokio::task::spawn_blocking(move || {
            // The watcher stops when dropped; keep it alive with the loop.
            let _watcher = watcher;
            for () in rx {
                match self.reload() {
                    Ok(()) => tracing::info!(path = %self.path.display(), "configuration reloaded"),
                    Err(e) => tracing::warn!(error = %e, "configuration reload failed"),
                }
            }
        });
        Ok(())
    }
}
