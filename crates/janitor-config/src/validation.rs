//! Configuration validation

use crate::schema::{RawConfig, RawRemoteConfig};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("service.port must be non-zero")]
    ZeroPort,

    #[error("remote.address '{value}': {message}")]
    InvalidAddress { value: String, message: String },

    #[error("remote.secret_key cannot be empty")]
    EmptySecret,

    #[error("remote.{field} must be at least 1 second")]
    ZeroTimeout { field: &'static str },
}

/// Validate a raw configuration, collecting every problem
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.service.port == Some(0) {
        errors.push(ValidationError::ZeroPort);
    }

    errors.extend(validate_remote(&config.remote));

    errors
}

fn validate_remote(remote: &RawRemoteConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(message) = parse_endpoint(&remote.address) {
        errors.push(ValidationError::InvalidAddress {
            value: remote.address.clone(),
            message,
        });
    }

    if remote.secret_key.trim().is_empty() {
        errors.push(ValidationError::EmptySecret);
    }

    if remote.dial_timeout_seconds == Some(0) {
        errors.push(ValidationError::ZeroTimeout {
            field: "dial_timeout_seconds",
        });
    }

    if remote.request_timeout_seconds == Some(0) {
        errors.push(ValidationError::ZeroTimeout {
            field: "request_timeout_seconds",
        });
    }

    errors
}

/// Parse a `host:port` endpoint
pub fn parse_endpoint(s: &str) -> Result<(&str, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| "Expected host:port format".to_string())?;

    if host.is_empty() {
        return Err("Host cannot be empty".into());
    }

    let port: u16 = port.parse().map_err(|_| "Invalid port".to_string())?;
    if port == 0 {
        return Err("Port must be 1-65535".into());
    }

    Ok((host, port))
}
