use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ClientConfig, RestDefaults, RestOptions};
use crate::rest::bucket::RateLimitHeaders;
use crate::rest::http::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
use crate::rest::limiter::RateLimiter;
use crate::rest::route::{Route, RouteError, RouteSignature};
use crate::retry::{retry_async, RetryPolicy};
use crate::validate::{Validate, Violation};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("rate limited (global: {global}): retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, global: bool },

    #[error("still throttled after {attempts} attempts: retry after {retry_after:?}")]
    ThrottleRetryExceeded {
        attempts: usize,
        retry_after: Duration,
    },

    #[error("transient failure ({}): {detail}", describe_status(.status))]
    TransientServerFailure {
        status: Option<StatusCode>,
        detail: String,
    },

    #[error("http status {status}: {body}")]
    ClientRequestError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(serde_json::Error),

    #[error("payload failed validation: {}", format_violations(.0))]
    Invalid(Vec<Violation>),

    #[error(transparent)]
    InvalidRoute(#[from] RouteError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RestError {
    /// Whether the executor's server-error retry loop should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientServerFailure { .. })
    }

    /// Maps `reqwest` failures, treating timeouts and connection problems as
    /// transient.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::TransientServerFailure {
                status: None,
                detail: err.to_string(),
            }
        } else {
            Self::Transport(err)
        }
    }
}

fn describe_status(status: &Option<StatusCode>) -> String {
    match status {
        Some(status) => format!("http {status}"),
        None => "no response".to_string(),
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Issues API calls through the rate limiter and applies the retry policy.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    max_throttle_retries: usize,
    retry_policy: RetryPolicy,
}

impl RequestExecutor {
    /// Creates an executor talking to the configured API root over `reqwest`.
    pub fn new(config: &ClientConfig) -> Result<Self, RestError> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::with_transport(&config.rest, Arc::new(transport)))
    }

    pub fn with_transport(options: &RestOptions, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            limiter: Arc::new(RateLimiter::new(options.max_rate_limit_wait)),
            max_throttle_retries: options.max_throttle_retries,
            retry_policy: options.retry_policy.clone(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Executes one request and returns the successful response.
    ///
    /// Throttling is retried after the server's retry-after, 5xx and network
    /// failures with exponential backoff, and any other 4xx is returned
    /// immediately.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RestError> {
        let signature = request.route.signature();

        retry_async(
            &self.retry_policy,
            |_| self.attempt(&request, &signature),
            RestError::is_transient,
        )
        .await
    }

    /// Executes a request and decodes the response body.
    pub async fn execute_decode<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, RestError> {
        self.execute(request).await?.decode()
    }

    /// Validates `payload`, then sends it as the JSON body of `route`.
    pub async fn execute_payload<P>(
        &self,
        route: Route,
        payload: &P,
    ) -> Result<ApiResponse, RestError>
    where
        P: Serialize + Validate,
    {
        let violations = payload.validate();
        if !violations.is_empty() {
            return Err(RestError::Invalid(violations));
        }
        let body = serde_json::to_value(payload)
            .map_err(|err| RestError::InvalidRequest(format!("payload encoding: {err}")))?;
        self.execute(ApiRequest::new(route).json(body)).await
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        signature: &RouteSignature,
    ) -> Result<ApiResponse, RestError> {
        let mut throttled = 0usize;

        loop {
            self.limiter.acquire(signature).await?;
            let response = self.transport.send(request).await?;
            let status = response.status;
            let mut rate_limit = RateLimitHeaders::from_headers(&response.headers);
            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(body) = ThrottleBody::parse(&response.body) {
                    rate_limit.retry_after = rate_limit.retry_after.or(body.retry_after());
                    rate_limit.global |= body.global;
                }
                rate_limit
                    .retry_after
                    .get_or_insert(RestDefaults::FALLBACK_RETRY_AFTER);
            }
            self.limiter.record_parsed(signature, &rate_limit);

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                throttled += 1;
                let retry_after = rate_limit
                    .retry_after
                    .unwrap_or(RestDefaults::FALLBACK_RETRY_AFTER);
                let global = rate_limit.global;

                if throttled > self.max_throttle_retries {
                    return Err(RestError::ThrottleRetryExceeded {
                        attempts: throttled,
                        retry_after,
                    });
                }
                warn!(
                    event = "request_throttled",
                    route = %signature,
                    attempt = throttled,
                    global,
                    scope = rate_limit.scope.as_deref().unwrap_or("unknown"),
                    retry_after_ms = retry_after.as_millis() as u64
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                debug!(
                    event = "request_server_error",
                    route = %signature,
                    status = status.as_u16()
                );
                return Err(RestError::TransientServerFailure {
                    status: Some(status),
                    detail: summarize_error_body(&response.body),
                });
            }

            return Err(RestError::ClientRequestError {
                status,
                body: summarize_error_body(&response.body),
            });
        }
    }
}

/// Body of a 429 response.
#[derive(Debug, Deserialize)]
struct ThrottleBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl ThrottleBody {
    fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match (parsed.code, parsed.message) {
            (Some(code), Some(message)) => return format!("{message} (code {code})"),
            (None, Some(message)) => return message,
            _ => {}
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
