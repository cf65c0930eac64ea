//! Default filesystem locations.

use std::path::PathBuf;

/// Return the user's home directory, falling back to the working directory.
#[must_use]
pub fn home_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

/// `~/.keyrelay`
#[must_use]
pub fn data_dir() -> PathBuf {
    home_dir().join(".keyrelay")
}

#[must_use]
pub fn db_path() -> PathBuf {
    data_dir().join("tokens.db")
}

#[must_use]
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// `$XDG_CONFIG_HOME/keyrelay/config.yaml`, defaulting to `~/.config`.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map_or_else(|_| home_dir().join(".config"), PathBuf::from)
        .join("keyrelay")
        .join("config.yaml")
}
