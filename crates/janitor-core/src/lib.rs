//! Scheduled policy enforcement for the janitor
//!
//! This crate is the heart of the janitor, containing:
//! - Policy checks and the results they produce
//! - The fault-isolated pipeline that runs every check once per tick
//! - The warning catalogue (notify, then delete, inactive and blocked users' machines)
//! - The daily schedule and the scheduler that drives the pipeline
//! - Ordered, run-once shutdown

mod check;
mod pipeline;
mod result;
mod schedule;
mod scheduler;
mod shutdown;
mod warnings;

pub use check::*;
pub use pipeline::*;
pub use result::*;
pub use schedule::*;
pub use scheduler::*;
pub use shutdown::*;
pub use warnings::*;

#[cfg(test)]
mod testing;
