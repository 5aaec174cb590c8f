//! Gateway session state machine.
//!
//! One [`SessionWorker`] task owns the transport for the lifetime of a
//! [`GatewayConnection`](super::client::GatewayConnection). It performs the
//! hello/identify/resume handshake, answers heartbeat signals, forwards
//! dispatch events in arrival order, and reconnects with backoff until it is
//! cancelled or the server closes with a fatal code.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::gateway::client::{GatewayCommand, GatewayError};
use crate::gateway::dispatch::{self, ControlFrame, Decoded, DispatchEvent};
use crate::gateway::heartbeat::{HeartbeatMonitor, HeartbeatSignal};
use crate::gateway::proto::{
    self, classify_close, CloseDisposition, EventName, Frame, Hello, Identify, Opcode, Ready,
    Resume,
};
use crate::gateway::transport::{CloseKind, Connector, Inbound, Transport};
use crate::retry::{jitter_duration, with_timeout, ReconnectBackoff};

/// Data that identifies one logical gateway session across connections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: Option<String>,
    /// Highest dispatch sequence number seen.
    pub sequence: Option<u64>,
    pub heartbeat_interval: Option<Duration>,
    pub resume_url: Option<String>,
}

impl SessionState {
    /// Creates an empty session; the first connection identifies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the highest sequence number seen so far.
    pub fn observe_sequence(&mut self, sequence: u64) {
        self.sequence = Some(self.sequence.map_or(sequence, |seen| seen.max(sequence)));
    }

    /// A session can be resumed once it has both an id and a sequence.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Stores the session id and resume URL from READY.
    pub fn on_ready(&mut self, ready: &Ready) {
        self.session_id = Some(ready.session_id.clone());
        self.resume_url = ready.resume_gateway_url.clone();
    }

    /// Forgets the session so the next connection identifies from scratch.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }

    /// Endpoint for the next connection: the resume URL while a resumable
    /// session is held, `default_url` otherwise.
    pub fn connect_url(&self, default_url: &str, api_version: u8) -> Result<String, GatewayError> {
        let base = match self.resume_url.as_deref() {
            Some(resume_url) if self.can_resume() => resume_url,
            _ => default_url,
        };
        let mut url = Url::parse(base)?;
        url.query_pairs_mut()
            .clear()
            .append_pair("v", &api_version.to_string())
            .append_pair("encoding", "json");
        Ok(url.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Steady,
    Zombied,
    Reconnecting,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Steady => "steady",
            Self::Zombied => "zombied",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

enum SessionOutcome {
    Shutdown,
    Reconnect { cause: &'static str },
    Fatal(GatewayError),
}

/// Channel ends the worker shares with the consumer handles.
pub(crate) struct WorkerChannels {
    pub phase: watch::Sender<SessionPhase>,
    pub events: mpsc::UnboundedSender<DispatchEvent>,
    pub commands: mpsc::UnboundedReceiver<GatewayCommand>,
    pub shutdown: CancellationToken,
    pub ready: oneshot::Sender<Result<(), GatewayError>>,
}

pub(crate) struct SessionWorker {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: SessionState,
    monitor: HeartbeatMonitor,
    backoff: ReconnectBackoff,
    phase: watch::Sender<SessionPhase>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    commands: mpsc::UnboundedReceiver<GatewayCommand>,
    commands_open: bool,
    pending: VecDeque<GatewayCommand>,
    shutdown: CancellationToken,
    ready: Option<oneshot::Sender<Result<(), GatewayError>>>,
    steady_since: Option<Instant>,
}

impl SessionWorker {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        channels: WorkerChannels,
    ) -> Self {
        let gateway = &config.gateway;
        let monitor = HeartbeatMonitor::new(gateway.zombie_tolerance);
        let backoff = ReconnectBackoff::new(
            gateway.min_reconnect_backoff,
            gateway.max_reconnect_backoff,
            gateway.reconnect_jitter,
        );

        Self {
            config,
            connector,
            state: SessionState::new(),
            monitor,
            backoff,
            phase: channels.phase,
            events: channels.events,
            commands: channels.commands,
            commands_open: true,
            pending: VecDeque::new(),
            shutdown: channels.shutdown,
            ready: Some(channels.ready),
            steady_since: None,
        }
    }

    /// Drives connections until shutdown or a fatal error.
    pub(crate) async fn run(mut self) -> Result<(), GatewayError> {
        let result = self.run_connections().await;
        self.monitor.stop();
        self.set_phase(SessionPhase::Idle);
        result
    }

    async fn run_connections(&mut self) -> Result<(), GatewayError> {
        let mut attempts_before_ready = 0u32;

        loop {
            let result = self.run_session().await;
            self.monitor.stop();
            let steady_for = self.steady_since.take().map(|since| since.elapsed());

            let (cause, failure) = match result {
                Ok(SessionOutcome::Shutdown) => return Ok(()),
                Ok(SessionOutcome::Fatal(err)) => return self.stop_with(err),
                Err(err) if err.is_fatal() => return self.stop_with(err),
                Ok(SessionOutcome::Reconnect { cause }) => {
                    info!(
                        event = "gateway_reconnect",
                        cause,
                        resumable = self.state.can_resume()
                    );
                    (cause, None)
                }
                Err(err) => {
                    warn!(
                        event = "gateway_session_failed",
                        error = %err,
                        resumable = self.state.can_resume()
                    );
                    ("session_failed", Some(err))
                }
            };

            if self.ready.is_some() {
                attempts_before_ready += 1;
                let limit = self.config.gateway.max_initial_attempts;
                if limit.is_some_and(|limit| attempts_before_ready >= limit) {
                    let err = failure.unwrap_or_else(|| {
                        GatewayError::TransportFailure(format!("{cause} before first ready"))
                    });
                    return self.stop_with(err);
                }
            }

            if steady_for.is_some_and(|steady| steady >= self.config.gateway.stable_session_threshold)
            {
                self.backoff.reset();
            }
            let delay = self.backoff.next_delay();
            self.set_phase(SessionPhase::Reconnecting);
            debug!(
                event = "gateway_reconnect_wait",
                delay_ms = delay.as_millis() as u64
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Hands a terminal error to the pending `connect()` call, or returns it
    /// from the worker when the connection is already established.
    fn stop_with(&mut self, err: GatewayError) -> Result<(), GatewayError> {
        error!(event = "gateway_stopped", error = %err);
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(err));
                Ok(())
            }
            None => Err(err),
        }
    }

    async fn run_session(&mut self) -> Result<SessionOutcome, GatewayError> {
        let url = self
            .state
            .connect_url(&self.config.gateway.gateway_url, self.config.api_version)?;
        self.set_phase(SessionPhase::Connecting);
        debug!(
            event = "gateway_connecting",
            url = %url,
            resume = self.state.can_resume()
        );

        let mut transport = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(SessionOutcome::Shutdown),
            result = self.connector.connect(&url) => result?,
        };

        self.set_phase(SessionPhase::AwaitingHello);
        let hello_timeout = self.config.gateway.hello_timeout;
        let hello = tokio::select! {
            _ = self.shutdown.cancelled() => {
                let _ = transport.close(CloseKind::Normal).await;
                return Ok(SessionOutcome::Shutdown);
            }
            result = with_timeout(hello_timeout, await_hello(transport.as_mut())) => match result {
                Ok(hello) => hello?,
                Err(_) => {
                    let _ = transport.close(CloseKind::Abnormal).await;
                    return Err(GatewayError::HelloTimeout(hello_timeout));
                }
            },
        };

        let interval = hello.interval();
        self.state.heartbeat_interval = Some(interval);
        let jitter = jitter_duration(self.config.gateway.initial_heartbeat_jitter);
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                let _ = transport.close(CloseKind::Normal).await;
                return Ok(SessionOutcome::Shutdown);
            }
            _ = tokio::time::sleep(jitter) => {}
        }

        let (beat_tx, mut beat_rx) = mpsc::unbounded_channel();
        self.monitor.start(interval, beat_tx);
        self.send_heartbeat(transport.as_mut()).await?;
        self.send_handshake(transport.as_mut()).await?;

        loop {
            let accept_commands = self.steady_since.is_some() && self.commands_open;

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let _ = transport.close(CloseKind::Normal).await;
                    return Ok(SessionOutcome::Shutdown);
                }
                Some(signal) = beat_rx.recv() => match signal {
                    HeartbeatSignal::Beat => self.send_heartbeat(transport.as_mut()).await?,
                    HeartbeatSignal::Zombie => {
                        self.set_phase(SessionPhase::Zombied);
                        let _ = transport.close(CloseKind::Abnormal).await;
                        return Ok(SessionOutcome::Reconnect { cause: "zombie" });
                    }
                },
                inbound = transport.recv() => {
                    if let Some(outcome) = self.handle_inbound(transport.as_mut(), inbound?).await? {
                        return Ok(outcome);
                    }
                }
                command = self.commands.recv(), if accept_commands => match command {
                    Some(command) => self.send_command(transport.as_mut(), command).await?,
                    None => self.commands_open = false,
                },
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        transport: &mut dyn Transport,
        inbound: Inbound,
    ) -> Result<Option<SessionOutcome>, GatewayError> {
        let text = match inbound {
            Inbound::Text(text) => text,
            Inbound::Binary(bytes) => {
                debug!(event = "gateway_binary_ignored", len = bytes.len());
                return Ok(None);
            }
            Inbound::Closed { code, reason } => return self.on_server_close(code, reason),
        };

        match dispatch::decode(&text)? {
            Decoded::Control(ControlFrame::HeartbeatAck) => self.monitor.on_ack(),
            Decoded::Control(ControlFrame::HeartbeatRequest) => {
                self.send_heartbeat(transport).await?;
            }
            Decoded::Control(ControlFrame::Reconnect) => {
                let _ = transport.close(CloseKind::Resumable).await;
                return Ok(Some(SessionOutcome::Reconnect {
                    cause: "server_requested",
                }));
            }
            Decoded::Control(ControlFrame::InvalidSession { resumable }) => {
                warn!(event = "gateway_invalid_session", resumable);
                if !resumable {
                    self.state.invalidate();
                }
                let _ = transport.close(CloseKind::Resumable).await;
                if self.ready.is_some() {
                    return Err(GatewayError::SessionInvalidated { resumable });
                }
                return Ok(Some(SessionOutcome::Reconnect {
                    cause: "invalid_session",
                }));
            }
            Decoded::Control(ControlFrame::Hello(_)) => {
                debug!(event = "gateway_duplicate_hello");
            }
            Decoded::Dispatch(event) => self.on_dispatch(transport, event).await?,
            Decoded::Ignored { .. } => {}
        }

        Ok(None)
    }

    async fn on_dispatch(
        &mut self,
        transport: &mut dyn Transport,
        event: DispatchEvent,
    ) -> Result<(), GatewayError> {
        if let Some(sequence) = event.sequence() {
            self.state.observe_sequence(sequence);
        }

        match event.name() {
            EventName::Ready => {
                let ready = event.decode_as::<Ready>()?;
                self.state.on_ready(&ready);
                info!(
                    event = "gateway_ready",
                    version = ready.v,
                    resume_url = ready.resume_gateway_url.is_some()
                );
                self.become_steady(transport).await?;
            }
            EventName::Resumed => {
                info!(event = "gateway_resumed", sequence = ?self.state.sequence);
                self.become_steady(transport).await?;
            }
            _ => {}
        }

        let _ = self.events.send(event);
        Ok(())
    }

    fn on_server_close(
        &mut self,
        code: Option<u16>,
        reason: String,
    ) -> Result<Option<SessionOutcome>, GatewayError> {
        warn!(event = "gateway_closed_by_server", code = ?code, reason = %reason);

        match (code, classify_close(code)) {
            (Some(code), CloseDisposition::Fatal) => {
                return Ok(Some(SessionOutcome::Fatal(GatewayError::FatalClose {
                    code,
                    reason,
                })));
            }
            (_, CloseDisposition::Reidentify) => self.state.invalidate(),
            _ => {}
        }

        if self.ready.is_some() {
            return Err(GatewayError::TransportFailure(format!(
                "closed before ready (code {code:?}): {reason}"
            )));
        }
        Ok(Some(SessionOutcome::Reconnect {
            cause: "server_closed",
        }))
    }

    async fn become_steady(&mut self, transport: &mut dyn Transport) -> Result<(), GatewayError> {
        self.set_phase(SessionPhase::Steady);
        self.steady_since = Some(Instant::now());
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }

        while let Some(command) = self.pending.pop_front() {
            self.send_command(transport, command).await?;
        }
        Ok(())
    }

    async fn send_heartbeat(&self, transport: &mut dyn Transport) -> Result<(), GatewayError> {
        let frame = proto::heartbeat(self.state.sequence)?;
        transport.send_text(frame).await?;
        self.monitor.record_sent();
        Ok(())
    }

    async fn send_handshake(&self, transport: &mut dyn Transport) -> Result<(), GatewayError> {
        let token = self.config.token.expose_secret().as_str();
        let frame = match (self.state.session_id.as_deref(), self.state.sequence) {
            (Some(session_id), Some(seq)) => {
                self.set_phase(SessionPhase::Resuming);
                Frame::new(
                    Opcode::Resume,
                    Resume {
                        token,
                        session_id,
                        seq,
                    },
                )
                .to_json()?
            }
            _ => {
                self.set_phase(SessionPhase::Identifying);
                Frame::new(
                    Opcode::Identify,
                    Identify {
                        token,
                        intents: self.config.intents,
                        properties: &self.config.properties,
                        shard: self.config.shard,
                    },
                )
                .to_json()?
            }
        };
        transport.send_text(frame).await
    }

    /// Writes one consumer command; on failure it is kept for the next
    /// session.
    async fn send_command(
        &mut self,
        transport: &mut dyn Transport,
        command: GatewayCommand,
    ) -> Result<(), GatewayError> {
        let frame = Frame::new(command.opcode(), command.payload()).to_json()?;
        if let Err(err) = transport.send_text(frame).await {
            self.pending.push_front(command);
            return Err(err);
        }
        Ok(())
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(event = "gateway_phase", from = %previous, to = %phase);
        }
    }
}

async fn await_hello(transport: &mut dyn Transport) -> Result<Hello, GatewayError> {
    loop {
        match transport.recv().await? {
            Inbound::Text(text) => match dispatch::decode(&text)? {
                Decoded::Control(ControlFrame::Hello(hello)) => return Ok(hello),
                other => debug!(event = "gateway_frame_before_hello", frame = ?other),
            },
            Inbound::Binary(_) => {}
            Inbound::Closed { code, reason } => {
                return Err(match (code, classify_close(code)) {
                    (Some(code), CloseDisposition::Fatal) => {
                        GatewayError::FatalClose { code, reason }
                    }
                    _ => GatewayError::TransportFailure(format!(
                        "closed before hello (code {code:?}): {reason}"
                    )),
                });
            }
        }
    }
}
