//! The contract every policy check satisfies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use janitor_rpc::{RemoteActions, RpcError};
use janitor_store::{Store, StoreError};
use janitor_util::TickId;
use std::sync::Arc;
use thiserror::Error;

use crate::ErrorKind;

/// Everything a check may consult or act through during one tick
#[derive(Clone)]
pub struct CheckContext {
    pub store: Arc<dyn Store>,
    pub remote: Arc<dyn RemoteActions>,
    /// Wall-clock instant the tick started; checks measure ages against it
    pub now: DateTime<Utc>,
    pub tick: TickId,
}

/// What a check accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub affected: usize,
    pub failed: usize,
    pub message: String,
}

impl CheckOutcome {
    pub fn new(affected: usize, message: impl Into<String>) -> Self {
        Self {
            affected,
            failed: 0,
            message: message.into(),
        }
    }
}

/// Check failures
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RpcError),

    #[error("{0}")]
    Failed(String),
}

impl CheckError {
    /// How the pipeline reports this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::Remote(e) if e.is_transient() => ErrorKind::TransientRemoteFailure,
            _ => ErrorKind::ExecutionFailure,
        }
    }
}

/// One independently evaluated lifecycle rule.
///
/// Implementations hold only immutable configuration. Anything that changes
/// while a check runs lives inside `evaluate`, so one tick can never observe
/// state left behind by the previous one.
#[async_trait]
pub trait PolicyCheck: Send + Sync {
    /// Unique, human-readable name used in result reporting
    fn name(&self) -> &str;

    async fn evaluate(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError>;
}
