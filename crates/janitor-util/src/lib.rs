//! Shared utilities for the janitor
//!
//! This crate provides:
//! - ID types (Username, MachineId, TickId)
//! - Clock helpers (UTC now with debug mock time, day arithmetic)
//! - Default paths for config and data directories

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
