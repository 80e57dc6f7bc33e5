//! janitord - the janitor service
//!
//! The binary wires configuration, the store, the orchestration client, the
//! policy pipeline and its scheduler together. This library half holds the
//! pieces that are exercised directly by tests:
//! - The HTTP control plane (`/version`, `/healthCheck`)

pub mod http;

pub use http::*;
