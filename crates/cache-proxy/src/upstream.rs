//! Forwarding requests to the origin server.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use thiserror::Error;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("origin unreachable: {0}")]
    Unreachable(String),
    #[error("upstream error: {0}")]
    Other(String),
}

/// A request as seen by the proxy, detached from the server framework.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Scheme of an absolute-form request target, if the client sent one.
    pub scheme: Option<String>,
    /// Path plus query string; also the cache key.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            scheme: None,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(path, _)| path)
    }

    /// A top-level page load rather than a subresource or XHR.
    pub fn is_navigation(&self) -> bool {
        let header_str = |name: &str| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_ascii_lowercase()
        };

        header_str("sec-fetch-mode") == "navigate" || header_str("accept").contains("text/html")
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &ProxyRequest) -> Result<UpstreamResponse, UpstreamError>;
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
}

#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
    origin: String,
}

impl ReqwestUpstream {
    pub fn new(origin: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Other(e.to_string()))?;

        Ok(Self::with_client(client, origin))
    }

    pub fn with_client(client: reqwest::Client, origin: impl Into<String>) -> Self {
        Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn fetch(&self, request: &ProxyRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{}", self.origin, request.path_and_query);
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(classify)?;

        tracing::debug!(method = %request.method, %url, status = status.as_u16(), "origin responded");
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> UpstreamError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        UpstreamError::Unreachable(err.to_string())
    } else {
        UpstreamError::Other(err.to_string())
    }
}
