//! HTTP call boundary.
//!
//! The executor only sees [`HttpTransport`]; [`ReqwestTransport`] is the
//! production implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::rest::executor::RestError;
use crate::rest::route::Route;

const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// One outbound API call.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub route: Route,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Audit-log reason, sent percent-encoded.
    pub reason: Option<String>,
}

impl ApiRequest {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            query: Vec::new(),
            body: None,
            reason: None,
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Status, headers, and body of one API response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    /// Decodes the body into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        serde_json::from_str(&self.body).map_err(RestError::Decode)
    }
}

/// Performs a single HTTP round trip; no retries, no rate limiting.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RestError>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: Client,
    api_root: String,
    token: SecretString,
    attempt_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, RestError> {
        let user_agent = HeaderValue::from_str(&config.rest.user_agent)
            .map_err(|err| RestError::InvalidRequest(format!("user agent: {err}")))?;
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, user_agent);

        let http = Client::builder()
            .connect_timeout(config.rest.connect_timeout)
            .default_headers(default_headers)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            api_root: config.api_root(),
            token: config.token.clone(),
            attempt_timeout: config.rest.attempt_timeout,
        })
    }

    fn endpoint(&self, request: &ApiRequest) -> Result<String, RestError> {
        let path = request.route.path()?;
        Ok(format!("{}{}", self.api_root, path))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RestError> {
        let endpoint = self.endpoint(request)?;
        let authorization = HeaderValue::from_str(&format!("Bot {}", self.token.expose_secret()))
            .map_err(|err| RestError::InvalidRequest(format!("authorization header: {err}")))?;

        let mut builder = self
            .http
            .request(request.route.method().clone(), endpoint)
            .timeout(self.attempt_timeout)
            .header(AUTHORIZATION, authorization);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        if let Some(reason) = request.reason.as_deref() {
            builder = builder.header(AUDIT_LOG_REASON, urlencoding::encode(reason).into_owned());
        }

        let response = builder.send().await.map_err(RestError::from_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(RestError::from_reqwest)?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
