//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Control-plane and process settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Orchestration service connection
    pub remote: RawRemoteConfig,

    /// Data-access settings
    #[serde(default)]
    pub store: RawStoreConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// Port for /version and /healthCheck
    pub port: Option<u16>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,
}

/// Orchestration service connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRemoteConfig {
    /// host:port of the orchestration endpoint
    pub address: String,

    /// Secret presented with the `janitor` credential kind
    pub secret_key: String,

    /// Bound on the initial handshake, in seconds
    pub dial_timeout_seconds: Option<u64>,

    /// Bound on a single action round-trip, in seconds
    pub request_timeout_seconds: Option<u64>,
}

/// Store settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawStoreConfig {
    /// Database file (default: `<data_dir>/janitor.db`)
    pub path: Option<PathBuf>,
}
