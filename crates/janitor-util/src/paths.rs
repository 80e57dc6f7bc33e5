//! Default paths for janitor components
//!
//! - Config: `$JANITOR_CONFIG` or `$XDG_CONFIG_HOME/janitor/config.toml` or `~/.config/janitor/config.toml`
//! - Data: `$XDG_DATA_HOME/janitor` or `~/.local/share/janitor` (the daemon also honors `--data-dir`)

use std::path::PathBuf;

/// Environment variable for overriding the config file path
pub const JANITOR_CONFIG_ENV: &str = "JANITOR_CONFIG";

/// Application subdirectory name
const APP_DIR: &str = "janitor";

/// Config filename within the config directory
const CONFIG_FILENAME: &str = "config.toml";

/// Database filename within the data directory
pub const DB_FILENAME: &str = "janitor.db";

/// Get the default config file path.
///
/// Order of precedence:
/// 1. `$JANITOR_CONFIG` environment variable (if set)
/// 2. `$XDG_CONFIG_HOME/janitor/config.toml` (if XDG_CONFIG_HOME is set)
/// 3. `~/.config/janitor/config.toml` (fallback)
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(JANITOR_CONFIG_ENV) {
        return PathBuf::from(path);
    }

    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(CONFIG_FILENAME);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILENAME);
    }

    PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILENAME)
}

/// Get the data directory used when the config does not name one.
///
/// `JANITOR_DATA_DIR` is not consulted here; the service applies it as a
/// command-line override on top of the config.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join("data")
}
