//! HTTP transport to the POS API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tillpoint_core::IdempotencyKey;

/// Header carrying the client idempotency token on mutating requests.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// An API call, relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path below the API base, starting with `/` (e.g. `/products/5`).
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            idempotency_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

/// A successful API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Set when the body was served from the local store.
    #[serde(default)]
    pub from_cache: bool,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            from_cache: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// No response: connection refused, DNS failure, timeout.
    #[error("API unreachable: {0}")]
    Unreachable(String),
    /// The server answered with a non-success status.
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: Value },
    #[error("transport error: {0}")]
    Other(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Sends API requests. Implemented over HTTP in production and faked in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError>;

    /// Connectivity probe: any HTTP answer from `/health` counts as online.
    async fn probe(&self) -> bool {
        !matches!(
            self.send(&ApiRequest::get("/health")).await,
            Err(ApiError::Unreachable(_))
        )
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Other(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut req = self
            .client
            .request(request.method.clone(), self.url(&request.path));

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(key) = request.idempotency_key {
            req = req.header(IDEMPOTENCY_KEY_HEADER, key.to_string());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(classify_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(classify_error)?;
        let body = parse_body(&bytes);

        if status.is_success() {
            Ok(ApiResponse {
                status: status.as_u16(),
                body,
                from_cache: false,
            })
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn classify_error(err: reqwest::Error) -> ApiError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ApiError::Unreachable(err.to_string())
    } else {
        ApiError::Other(err.to_string())
    }
}

/// JSON when possible, raw text otherwise, `null` for an empty body.
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
