//! Consumer-facing gateway client and outbound command sender.
//!
//! [`GatewayClient::connect`] spawns the session worker and resolves once
//! the first session is ready. From then on the worker reconnects and
//! resumes on its own; the [`GatewayConnection`] keeps receiving events in
//! order across reconnects.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::gateway::dispatch::DispatchEvent;
use crate::gateway::proto::{Opcode, PresenceUpdate, RequestGuildMembers, VoiceStateUpdate};
use crate::gateway::session::{SessionPhase, SessionWorker, WorkerChannels};
use crate::gateway::transport::{Connector, WsConnector};
use crate::validate::Validate;

/// Entry point for opening gateway connections.
#[derive(Clone)]
pub struct GatewayClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
}

impl GatewayClient {
    /// Creates a client that connects over `tokio-tungstenite`.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Creates a client with a custom transport, e.g. an in-memory one.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Configuration every connection from this client uses.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a session and waits until it is ready.
    ///
    /// Fatal close codes are returned here. Other failures before the first
    /// ready reconnect with backoff, up to `max_initial_attempts` when set.
    /// Dropping the returned future stops the worker.
    pub async fn connect(&self) -> Result<GatewayConnection, GatewayError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let worker = SessionWorker::new(
            self.config.clone(),
            Arc::clone(&self.connector),
            WorkerChannels {
                phase: phase_tx,
                events: event_tx,
                commands: command_rx,
                shutdown: shutdown.clone(),
                ready: ready_tx,
            },
        );
        let handle = tokio::spawn(worker.run());
        let guard = shutdown.clone().drop_guard();

        match ready_rx.await {
            Ok(Ok(())) => {
                guard.disarm();
                Ok(GatewayConnection {
                    events: event_rx,
                    sender: GatewaySender { tx: command_tx },
                    phase: phase_rx,
                    shutdown,
                    worker: Some(handle),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(GatewayError::WorkerStopped),
        }
    }
}

/// Handle on a running gateway session.
///
/// Dropping the connection stops its worker.
#[derive(Debug)]
pub struct GatewayConnection {
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    sender: GatewaySender,
    phase: watch::Receiver<SessionPhase>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<Result<(), GatewayError>>>,
}

impl GatewayConnection {
    /// Receives the next dispatch event; `None` once the worker stopped and
    /// every buffered event was consumed.
    pub async fn recv(&mut self) -> Option<DispatchEvent> {
        self.events.recv().await
    }

    /// Returns a cloneable sender for consumer commands.
    pub fn sender(&self) -> GatewaySender {
        self.sender.clone()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Watch channel publishing every phase change.
    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Closes the connection cleanly and waits for the worker to finish.
    ///
    /// Returns the error that stopped the worker, if a fatal close ended it
    /// before this call.
    pub async fn disconnect(&mut self) -> Result<(), GatewayError> {
        self.shutdown.cancel();
        match self.worker.take() {
            Some(worker) => worker.await.map_err(|_| GatewayError::WorkerStopped)?,
            None => Ok(()),
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Non-lifecycle frame queued by a consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayCommand {
    opcode: Opcode,
    payload: Value,
}

impl GatewayCommand {
    /// Builds a command for any consumer opcode (3, 4 or 8).
    pub fn new<T: Serialize>(opcode: Opcode, payload: &T) -> Result<Self, GatewayError> {
        if !opcode.is_consumer_command() {
            return Err(GatewayError::InvalidCommand(format!(
                "opcode {} is reserved for the session",
                opcode.code()
            )));
        }
        Ok(Self {
            opcode,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn presence_update(presence: &PresenceUpdate) -> Result<Self, GatewayError> {
        Self::new(Opcode::PresenceUpdate, presence)
    }

    pub fn voice_state_update(voice_state: &VoiceStateUpdate) -> Result<Self, GatewayError> {
        Self::new(Opcode::VoiceStateUpdate, voice_state)
    }

    /// Validates the request before encoding it.
    pub fn request_guild_members(request: &RequestGuildMembers) -> Result<Self, GatewayError> {
        let violations = request.validate();
        if !violations.is_empty() {
            return Err(GatewayError::InvalidCommand(
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }
        Self::new(Opcode::RequestGuildMembers, request)
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Cloneable sender for consumer commands.
///
/// Commands are written in order once the session is steady; anything sent
/// while the worker is reconnecting waits for the next ready session.
#[derive(Clone, Debug)]
pub struct GatewaySender {
    tx: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewaySender {
    pub fn send(&self, command: GatewayCommand) -> Result<(), GatewayError> {
        self.tx
            .send(command)
            .map_err(|_| GatewayError::SendQueueClosed)
    }

    pub fn update_presence(&self, presence: &PresenceUpdate) -> Result<(), GatewayError> {
        self.send(GatewayCommand::presence_update(presence)?)
    }

    pub fn update_voice_state(&self, voice_state: &VoiceStateUpdate) -> Result<(), GatewayError> {
        self.send(GatewayCommand::voice_state_update(voice_state)?)
    }

    pub fn request_guild_members(&self, request: &RequestGuildMembers) -> Result<(), GatewayError> {
        self.send(GatewayCommand::request_guild_members(request)?)
    }
}

/// Errors produced by the gateway transport and session handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid gateway url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The server sent a frame that does not follow the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("session invalidated by server (resumable: {resumable})")]
    SessionInvalidated { resumable: bool },

    #[error("no hello within {0:?}")]
    HelloTimeout(Duration),

    /// The server closed with a code that reconnecting cannot fix.
    #[error("gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("gateway worker stopped")]
    WorkerStopped,
}

impl GatewayError {
    /// Fatal errors stop the worker instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalClose { .. } | Self::InvalidUrl(_))
    }
}
