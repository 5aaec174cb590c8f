//! Gateway modules.
//!
//! - `client`: consumer API, command sender, and the gateway error type.
//! - `session`: connection state machine and reconnect worker.
//! - `heartbeat`: timer-driven liveness tracking.
//! - `dispatch`: inbound frame decoding and routing.
//! - `proto`: opcodes, close codes, and frame payloads.
//! - `transport`: websocket boundary.

/// Consumer-facing connection handles.
pub mod client;
/// Inbound frame decoding.
pub mod dispatch;
/// Heartbeat timer and zombie detection.
pub mod heartbeat;
/// Gateway wire protocol.
pub mod proto;
/// Session state machine.
pub mod session;
/// Websocket transport boundary.
pub mod transport;

pub use client::{GatewayClient, GatewayCommand, GatewayConnection, GatewayError, GatewaySender};
pub use dispatch::DispatchEvent;
pub use session::{SessionPhase, SessionState};
