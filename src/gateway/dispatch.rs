//! Inbound frame decoding and routing.
//!
//! Every text frame is parsed once into a [`GatewayEnvelope`]; the
//! payload stays raw JSON until a consumer asks for a concrete type.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::gateway::client::GatewayError;
use crate::gateway::proto::{EventName, Hello, Opcode, TypedEvent};

/// Raw `{op, s, t, d}` frame.
#[derive(Debug, Deserialize)]
pub struct GatewayEnvelope {
    /// Kept wider than [`Opcode`] so out-of-range values are ignored, not
    /// rejected.
    #[serde(rename = "op")]
    pub opcode: u64,
    #[serde(rename = "s", default)]
    pub sequence: Option<u64>,
    #[serde(rename = "t", default)]
    pub event_name: Option<String>,
    #[serde(rename = "d", default)]
    pub payload: Option<Box<RawValue>>,
}

/// Lifecycle frames consumed by the session itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    Hello(Hello),
    HeartbeatAck,
    /// The server asks for an immediate heartbeat.
    HeartbeatRequest,
    Reconnect,
    InvalidSession { resumable: bool },
}

/// One op 0 frame, forwarded to the consumer in arrival order.
#[derive(Clone, Debug)]
pub struct DispatchEvent {
    name: EventName,
    sequence: Option<u64>,
    payload: Box<RawValue>,
}

impl DispatchEvent {
    /// Event name from the `t` field.
    pub fn name(&self) -> &EventName {
        &self.name
    }

    /// Sequence number from the `s` field, if the server sent one.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Undecoded payload; `null` when the frame had no `d`.
    pub fn raw(&self) -> &RawValue {
        &self.payload
    }

    /// Decodes the payload into any shape, without checking the event name.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_str(self.payload.get()).map_err(GatewayError::Json)
    }

    /// Decodes the payload as `E`, failing when the event carries a
    /// different name.
    pub fn decode_as<E: TypedEvent>(&self) -> Result<E, GatewayError> {
        if self.name != E::NAME {
            return Err(GatewayError::ProtocolViolation(format!(
                "expected {} payload, got {}",
                E::NAME,
                self.name
            )));
        }
        self.decode()
    }
}

#[derive(Debug)]
pub enum Decoded {
    Control(ControlFrame),
    Dispatch(DispatchEvent),
    /// Opcode the client never expects to receive.
    Ignored { opcode: u64 },
}

/// Parses and routes one text frame.
pub fn decode(text: &str) -> Result<Decoded, GatewayError> {
    let envelope: GatewayEnvelope = serde_json::from_str(text)
        .map_err(|err| GatewayError::ProtocolViolation(format!("malformed frame: {err}")))?;
    route(envelope)
}

fn route(envelope: GatewayEnvelope) -> Result<Decoded, GatewayError> {
    let known = u8::try_from(envelope.opcode).ok().and_then(Opcode::from_u8);
    let Some(opcode) = known else {
        debug!(event = "gateway_unknown_opcode", opcode = envelope.opcode);
        return Ok(Decoded::Ignored {
            opcode: envelope.opcode,
        });
    };

    let control = match opcode {
        Opcode::Dispatch => return dispatch(envelope).map(Decoded::Dispatch),
        Opcode::Hello => {
            let payload = envelope.payload.ok_or_else(|| {
                GatewayError::ProtocolViolation("hello frame without payload".to_string())
            })?;
            let hello = serde_json::from_str::<Hello>(payload.get())
                .map_err(|err| GatewayError::ProtocolViolation(format!("malformed hello: {err}")))?;
            ControlFrame::Hello(hello)
        }
        Opcode::HeartbeatAck => ControlFrame::HeartbeatAck,
        Opcode::Heartbeat => ControlFrame::HeartbeatRequest,
        Opcode::Reconnect => ControlFrame::Reconnect,
        Opcode::InvalidSession => ControlFrame::InvalidSession {
            resumable: envelope
                .payload
                .as_deref()
                .and_then(|raw| serde_json::from_str::<bool>(raw.get()).ok())
                .unwrap_or(false),
        },
        other => {
            debug!(event = "gateway_unexpected_opcode", opcode = other.code());
            return Ok(Decoded::Ignored {
                opcode: envelope.opcode,
            });
        }
    };

    Ok(Decoded::Control(control))
}

fn dispatch(envelope: GatewayEnvelope) -> Result<DispatchEvent, GatewayError> {
    let name = envelope.event_name.ok_or_else(|| {
        GatewayError::ProtocolViolation("dispatch frame without event name".to_string())
    })?;
    let payload = match envelope.payload {
        Some(payload) => payload,
        None => serde_json::value::to_raw_value(&serde_json::Value::Null)?,
    };

    Ok(DispatchEvent {
        name: EventName::parse(&name),
        sequence: envelope.sequence,
        payload,
    })
}
