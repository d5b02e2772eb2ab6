//! WebSocket signaling relay between one server role and many clients.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
mod page;
pub mod peer;
pub mod router;
/// HTTP acceptor and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
