//! Rust client core for the Discord gateway and REST API.
//!
//! The crate is organized by transport surface:
//! - `gateway`: websocket session state machine, heartbeat monitor, and
//!   event dispatcher.
//! - `rest`: bucketed rate limiter and request executor for the HTTP API.
//! - `config`: credentials and tunables shared by both surfaces.
//! - `validate`: outgoing payload validation helpers.
//! - `retry`: shared retry, backoff and timeout utilities.

/// Client configuration shared by the gateway and REST surfaces.
pub mod config;
/// Gateway session, heartbeat, and event dispatch.
pub mod gateway;
/// Rate-limited REST request execution.
pub mod rest;
/// Retry, backoff and timeout helpers used across the crate.
pub mod retry;
/// Payload validation returning structured violations.
pub mod validate;

pub use config::{ClientConfig, GatewayOptions, RestOptions};
pub use gateway::client::{GatewayClient, GatewayConnection, GatewayError, GatewaySender};
pub use rest::executor::{RequestExecutor, RestError};
