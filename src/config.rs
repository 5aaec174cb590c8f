//! Client configuration.
//!
//! One [`ClientConfig`] is built at startup and handed to both the gateway
//! client and the REST executor. Nothing in the crate reads process-wide
//! mutable defaults after construction.

use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use crate::retry::RetryPolicy;

/// Gateway API version used when none is configured.
pub const DEFAULT_API_VERSION: u8 = 10;
/// Public gateway endpoint used before a resume URL is known.
pub const GATEWAY_URL: &str = "wss://gateway.discord.gg";
/// REST API root, without the version segment.
pub const API_BASE_URL: &str = "https://discord.com/api";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    /// How long after a missing ack the connection is declared zombied.
    pub const ZOMBIE_TOLERANCE: Duration = Duration::from_secs(90);
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);
    pub const INITIAL_HEARTBEAT_JITTER: Duration = Duration::from_millis(250);
    pub const MIN_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
    pub const RECONNECT_JITTER: Duration = Duration::from_millis(500);
    /// Steady time after which the reconnect backoff starts from scratch.
    pub const STABLE_SESSION_THRESHOLD: Duration = Duration::from_secs(60);
    /// `None` keeps retrying the first session until `connect()` is dropped.
    pub const MAX_INITIAL_ATTEMPTS: Option<u32> = None;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_THROTTLE_RETRIES: usize = 3;
    pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
    /// Used when a 429 carries neither a `Retry-After` header nor a body hint.
    pub const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);
    pub const USER_AGENT: &'static str =
        concat!("DiscordBot (discord-wire, ", env!("CARGO_PKG_VERSION"), ")");
}

/// Tunables for the gateway session state machine.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub gateway_url: String,
    pub zombie_tolerance: Duration,
    pub hello_timeout: Duration,
    /// Upper bound of the random wait before the first heartbeat.
    pub initial_heartbeat_jitter: Duration,
    pub min_reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
    pub reconnect_jitter: Duration,
    pub stable_session_threshold: Duration,
    /// Sessions that may end before the first ready before `connect()`
    /// gives up with the last error.
    pub max_initial_attempts: Option<u32>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            gateway_url: GATEWAY_URL.to_string(),
            zombie_tolerance: GatewayDefaults::ZOMBIE_TOLERANCE,
            hello_timeout: GatewayDefaults::HELLO_TIMEOUT,
            initial_heartbeat_jitter: GatewayDefaults::INITIAL_HEARTBEAT_JITTER,
            min_reconnect_backoff: GatewayDefaults::MIN_RECONNECT_BACKOFF,
            max_reconnect_backoff: GatewayDefaults::MAX_RECONNECT_BACKOFF,
            reconnect_jitter: GatewayDefaults::RECONNECT_JITTER,
            stable_session_threshold: GatewayDefaults::STABLE_SESSION_THRESHOLD,
            max_initial_attempts: GatewayDefaults::MAX_INITIAL_ATTEMPTS,
        }
    }
}

/// Tunables for the REST request executor.
#[derive(Clone, Debug)]
pub struct RestOptions {
    /// API root without the `/v{n}` segment.
    pub base_url: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Throttled (429) responses tolerated per request before giving up.
    pub max_throttle_retries: usize,
    /// Longest wait the limiter parks a caller before failing fast.
    pub max_rate_limit_wait: Duration,
    /// Retry policy for 5xx responses and network failures.
    pub retry_policy: RetryPolicy,
    pub user_agent: String,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            max_throttle_retries: RestDefaults::MAX_THROTTLE_RETRIES,
            max_rate_limit_wait: RestDefaults::MAX_RATE_LIMIT_WAIT,
            retry_policy: RetryPolicy::server_errors(),
            user_agent: RestDefaults::USER_AGENT.to_string(),
        }
    }
}

/// Connection properties reported in the identify payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "discord-wire".to_string(),
            device: "discord-wire".to_string(),
        }
    }
}

/// Credentials and tunables for one bot connection.
#[derive(Clone)]
pub struct ClientConfig {
    pub token: SecretString,
    /// Gateway intents bitfield sent on identify.
    pub intents: u64,
    pub api_version: u8,
    /// `[shard_id, shard_count]` sent on identify when set.
    pub shard: Option<[u32; 2]>,
    pub properties: IdentifyProperties,
    pub gateway: GatewayOptions,
    pub rest: RestOptions,
}

impl ClientConfig {
    /// Creates a configuration with default tunables.
    pub fn new(token: SecretString, intents: u64) -> Self {
        Self {
            token,
            intents,
            api_version: DEFAULT_API_VERSION,
            shard: None,
            properties: IdentifyProperties::default(),
            gateway: GatewayOptions::default(),
            rest: RestOptions::default(),
        }
    }

    /// Overrides the API version used for the gateway query and REST root.
    pub fn with_api_version(mut self, api_version: u8) -> Self {
        self.api_version = api_version;
        self
    }

    /// Identifies as shard `shard_id` of `shard_count`.
    pub fn with_shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard = Some([shard_id, shard_count]);
        self
    }

    /// Replaces every gateway tunable at once.
    pub fn with_gateway_options(mut self, gateway: GatewayOptions) -> Self {
        self.gateway = gateway;
        self
    }

    /// Replaces every REST tunable at once.
    pub fn with_rest_options(mut self, rest: RestOptions) -> Self {
        self.rest = rest;
        self
    }

    /// Sets the gateway endpoint used for fresh connections.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway.gateway_url = url.into().trim_end().to_string();
        self
    }

    /// Sets the REST API root. The version segment is appended per request.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.rest.base_url = url.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Sets how long past one heartbeat interval an ack may be late.
    pub fn with_zombie_tolerance(mut self, tolerance: Duration) -> Self {
        self.gateway.zombie_tolerance = tolerance;
        self
    }

    /// Caps the delay between reconnect attempts.
    pub fn with_max_reconnect_backoff(mut self, max: Duration) -> Self {
        self.gateway.max_reconnect_backoff = max;
        self
    }

    /// Sets how many 429 responses one request absorbs before failing.
    pub fn with_max_throttle_retries(mut self, retries: usize) -> Self {
        self.rest.max_throttle_retries = retries;
        self
    }

    /// Bounds how many sessions may fail before the first ready.
    pub fn with_max_initial_attempts(mut self, attempts: u32) -> Self {
        self.gateway.max_initial_attempts = Some(attempts.max(1));
        self
    }

    /// Versioned REST root, e.g. `https://discord.com/api/v10`.
    pub fn api_root(&self) -> String {
        format!("{}/v{}", self.rest.base_url, self.api_version)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"[redacted]")
            .field("intents", &self.intents)
            .field("api_version", &self.api_version)
            .field("shard", &self.shard)
            .field("gateway", &self.gateway)
            .field("rest", &self.rest)
            .finish()
    }
}
