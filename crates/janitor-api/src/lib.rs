//! Protocol types for talking to the orchestration service
//!
//! The janitor speaks newline-delimited JSON over a single TCP connection:
//! - Commands (requests from the janitor)
//! - Responses (correlated by request id)
//! - Actions (what the orchestration service is asked to do to a machine or its owner)
//! - Versioning

mod commands;
mod types;

pub use commands::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
