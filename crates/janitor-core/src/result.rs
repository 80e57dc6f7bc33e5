//! Outcome of one check during one tick

use std::fmt;
use std::time::Duration;

/// Why a check's result carries an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The check failed, returned an error or panicked
    ExecutionFailure,
    /// The orchestration service was unreachable while the check ran
    TransientRemoteFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ExecutionFailure => write!(f, "execution_failure"),
            ErrorKind::TransientRemoteFailure => write!(f, "transient_remote_failure"),
        }
    }
}

/// Produced once per check per tick, logged, then discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    pub check_name: String,
    /// Users or machines acted upon successfully
    pub affected_count: usize,
    /// Users or machines the check attempted but could not act upon
    pub failed_count: usize,
    pub message: String,
    pub error: Option<ErrorKind>,
    pub elapsed: Duration,
}

impl PolicyResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
