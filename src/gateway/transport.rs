//! Websocket boundary for the gateway session.
//!
//! The session only talks to [`Transport`]; [`WsConnector`] opens real
//! connections with `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::gateway::client::GatewayError;
use crate::gateway::proto::CloseCodes;

/// One inbound unit after control frames are handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed or the stream ended; `code` is `None` without a
    /// close frame.
    Closed { code: Option<u16>, reason: String },
}

/// How the client ends a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    /// Close handshake with 1000; the server discards the session.
    Normal,
    /// Close handshake with a non-1000 code so the session stays resumable.
    Resumable,
    /// Drop the connection without a close handshake.
    Abnormal,
}

impl CloseKind {
    pub fn code(self) -> Option<u16> {
        match self {
            Self::Normal => Some(CloseCodes::NORMAL),
            Self::Resumable => Some(CloseCodes::RESUMABLE),
            Self::Abnormal => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;

    /// Waits for the next data frame or the end of the connection.
    async fn recv(&mut self) -> Result<Inbound, GatewayError>;

    async fn close(&mut self, kind: CloseKind) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        let (socket, response) = connect_async(url).await?;
        debug!(
            event = "gateway_socket_open",
            status = response.status().as_u16()
        );
        Ok(Box::new(WsTransport { socket }))
    }
}

struct WsTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound, GatewayError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Inbound::Binary(bytes.to_vec())),
                Some(Ok(Message::Ping(payload))) => {
                    self.socket.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return Ok(match frame {
                        Some(frame) => Inbound::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_owned(),
                        },
                        None => Inbound::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    });
                }
                Some(Err(err)) => return Err(GatewayError::WebSocket(err)),
                None => {
                    return Ok(Inbound::Closed {
                        code: None,
                        reason: String::new(),
                    })
                }
            }
        }
    }

    async fn close(&mut self, kind: CloseKind) -> Result<(), GatewayError> {
        let Some(code) = kind.code() else {
            return Ok(());
        };
        self.socket
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            }))
            .await?;
        Ok(())
    }
}
