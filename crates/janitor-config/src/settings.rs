//! Validated configuration ready for use by the service

use crate::schema::{RawConfig, RawRemoteConfig, RawServiceConfig, RawStoreConfig};
use janitor_util::DB_FILENAME;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default control-plane port
pub const DEFAULT_PORT: u16 = 6300;

/// Default bound on the initial handshake with the orchestration service
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single action round-trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Validated configuration
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub service: ServiceConfig,
    pub remote: RemoteConfig,
    pub store: StoreConfig,
}

impl JanitorConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let service = ServiceConfig::from_raw(raw.service);
        let store = StoreConfig::from_raw(raw.store, &service.data_dir);

        Self {
            remote: RemoteConfig::from_raw(raw.remote),
            service,
            store,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            port: raw.port.unwrap_or(DEFAULT_PORT),
            data_dir: raw
                .data_dir
                .unwrap_or_else(janitor_util::data_dir_without_env),
        }
    }
}

/// Orchestration service connection
#[derive(Clone)]
pub struct RemoteConfig {
    pub address: String,
    pub secret_key: String,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    fn from_raw(raw: RawRemoteConfig) -> Self {
        Self {
            address: raw.address,
            secret_key: raw.secret_key,
            dial_timeout: raw
                .dial_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DIAL_TIMEOUT),
            request_timeout: raw
                .request_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("address", &self.address)
            .field("secret_key", &"<redacted>")
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl StoreConfig {
    fn from_raw(raw: RawStoreConfig, data_dir: &std::path::Path) -> Self {
        Self {
            path: raw.path.unwrap_or_else(|| data_dir.join(DB_FILENAME)),
        }
    }

    /// Point the store at a different data directory, keeping an explicit path
    pub fn relocate(&mut self, old_data_dir: &std::path::Path, new_data_dir: &std::path::Path) {
        if self.path == old_data_dir.join(DB_FILENAME) {
            self.path = new_data_dir.join(DB_FILENAME);
        }
    }
}
