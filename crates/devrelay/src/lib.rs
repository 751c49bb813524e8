//! devrelay: WebSocket relay between IoT devices and their controllers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Shared-secret handshake on new connections.
pub mod auth;
/// CLI argument parsing and server configuration.
pub mod config;
/// Connection handles and the per-connection task.
pub mod connection;
/// Error types for relay server operations.
pub mod error;
/// Periodic liveness probing and eviction.
pub mod liveness;
/// Health endpoint and Prometheus metrics.
pub mod metrics;
/// Device map and controller set.
pub mod registry;
/// Per-message dispatch by role and type.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
