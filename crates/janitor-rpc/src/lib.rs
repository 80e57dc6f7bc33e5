//! RPC layer between the janitor and the orchestration service
//!
//! Provides:
//! - `RemoteClient`: authenticated TCP client speaking NDJSON, with automatic reconnect
//! - `RemoteActions`: the seam policy checks issue actions through
//! - `MockOrchestrator`: an in-process orchestration server for tests

mod client;
mod mock;

pub use client::*;
pub use mock::*;

use async_trait::async_trait;
use janitor_api::{Action, ActionReceipt, ErrorCode};
use std::time::Duration;
use thiserror::Error;

/// RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot reach orchestration service at {endpoint}: {reason}. Is the orchestration service running?")]
    Unreachable { endpoint: String, reason: String },

    #[error("credential rejected: {0}")]
    Unauthorized(String),

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("action rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("remote client is closed")]
    Closed,
}

impl RpcError {
    /// True when the failure came from a reconnect window and a later tick may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transient(_))
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Something that can carry actions to the orchestration service.
///
/// Policy checks only see this trait, so tests can substitute a recording double.
#[async_trait]
pub trait RemoteActions: Send + Sync {
    async fn issue(&self, action: Action) -> RpcResult<ActionReceipt>;
}
