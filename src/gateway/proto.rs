//! Gateway wire protocol: opcodes, close codes, and frame payloads.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::IdentifyProperties;
use crate::validate::{Validate, Validator, Violation};

/// Gateway frame opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Opcodes a consumer may send; the session owns every other outbound op.
    pub fn is_consumer_command(self) -> bool {
        matches!(
            self,
            Self::PresenceUpdate | Self::VoiceStateUpdate | Self::RequestGuildMembers
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CloseCodes;

impl CloseCodes {
    pub const NORMAL: u16 = 1000;
    /// Sent by the client when it intends to resume on the next connection.
    pub const RESUMABLE: u16 = 4000;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_SEQ: u16 = 4007;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

/// What the session does after the server closed the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnecting cannot succeed with the current configuration.
    Fatal,
    /// Reconnect, but the session can no longer be resumed.
    Reidentify,
    Resume,
}

pub fn classify_close(code: Option<u16>) -> CloseDisposition {
    match code {
        Some(
            CloseCodes::AUTHENTICATION_FAILED
            | CloseCodes::INVALID_SHARD
            | CloseCodes::SHARDING_REQUIRED
            | CloseCodes::INVALID_API_VERSION
            | CloseCodes::INVALID_INTENTS
            | CloseCodes::DISALLOWED_INTENTS,
        ) => CloseDisposition::Fatal,
        Some(CloseCodes::INVALID_SEQ | CloseCodes::SESSION_TIMED_OUT) => {
            CloseDisposition::Reidentify
        }
        _ => CloseDisposition::Resume,
    }
}

/// Outbound frame envelope.
#[derive(Debug, Serialize)]
pub struct Frame<T> {
    pub op: u8,
    pub d: T,
}

impl<T: Serialize> Frame<T> {
    pub fn new(op: Opcode, d: T) -> Self {
        Self { op: op.code(), d }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Heartbeat frame carrying the last sequence number seen, or null.
pub fn heartbeat(sequence: Option<u64>) -> Result<String, serde_json::Error> {
    Frame::new(Opcode::Heartbeat, sequence).to_json()
}

#[derive(Debug, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub intents: u64,
    pub properties: &'a IdentifyProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

#[derive(Debug, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// Payload of the hello frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

impl Hello {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// Session fields of the READY dispatch. The rest of the payload stays
/// available through [`DispatchEvent::decode`](super::dispatch::DispatchEvent::decode).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Ready {
    #[serde(default)]
    pub v: u8,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

impl TypedEvent for Ready {
    const NAME: EventName = EventName::Ready;
}

/// Dispatch payload types bound to the event name that carries them.
pub trait TypedEvent: serde::de::DeserializeOwned {
    const NAME: EventName;
}

macro_rules! event_names {
    ($($variant:ident => $wire:literal,)+) => {
        /// Dispatch event names. Names this crate does not know are kept
        /// verbatim in [`EventName::Unknown`].
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub enum EventName {
            $($variant,)+
            Unknown(String),
        }

        impl EventName {
            pub fn parse(name: &str) -> Self {
                match name {
                    $($wire => Self::$variant,)+
                    other => Self::Unknown(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Unknown(name) => name,
                }
            }
        }
    };
}

event_names! {
    Ready => "READY",
    Resumed => "RESUMED",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelUpdate => "CHANNEL_UPDATE",
    ChannelDelete => "CHANNEL_DELETE",
    ThreadCreate => "THREAD_CREATE",
    ThreadUpdate => "THREAD_UPDATE",
    ThreadDelete => "THREAD_DELETE",
    GuildCreate => "GUILD_CREATE",
    GuildUpdate => "GUILD_UPDATE",
    GuildDelete => "GUILD_DELETE",
    GuildMemberAdd => "GUILD_MEMBER_ADD",
    GuildMemberRemove => "GUILD_MEMBER_REMOVE",
    GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
    GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
    GuildRoleCreate => "GUILD_ROLE_CREATE",
    GuildRoleUpdate => "GUILD_ROLE_UPDATE",
    GuildRoleDelete => "GUILD_ROLE_DELETE",
    InteractionCreate => "INTERACTION_CREATE",
    MessageCreate => "MESSAGE_CREATE",
    MessageUpdate => "MESSAGE_UPDATE",
    MessageDelete => "MESSAGE_DELETE",
    MessageReactionAdd => "MESSAGE_REACTION_ADD",
    MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
    PresenceUpdate => "PRESENCE_UPDATE",
    TypingStart => "TYPING_START",
    UserUpdate => "USER_UPDATE",
    VoiceStateUpdate => "VOICE_STATE_UPDATE",
    VoiceServerUpdate => "VOICE_SERVER_UPDATE",
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Op 3 payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// Unix time in milliseconds since the client went idle.
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

impl PresenceUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status,
            afk: false,
        }
    }
}

/// Op 4 payload. A `None` channel leaves voice.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Op 8 payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl Validate for RequestGuildMembers {
    fn validate(&self) -> Vec<Violation> {
        let mut validator = Validator::new();
        validator
            .not_empty(!self.guild_id.is_empty(), "guild_id")
            .at_least_one_is_not_empty(
                &[
                    self.query.as_ref().map(|_| false),
                    self.user_ids.as_ref().map(Vec::is_empty),
                ],
                &["query", "user_ids"],
            )
            .precondition(
                self.query.is_some(),
                self.user_ids.is_none(),
                "query",
                "query and user_ids are mutually exclusive",
            )
            .element_count_at_most(self.user_ids.as_deref(), 100, "user_ids")
            .character_count_at_most(self.nonce.as_deref(), 32, "nonce");
        validator.finish()
    }
}
