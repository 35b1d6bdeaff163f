//! HTTP front end (Axum router) for the cache proxy.

use std::future::Future;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;

use crate::proxy::{CacheProxy, ProxyResponse};
use crate::upstream::ProxyRequest;

pub const SOURCE_HEADER: &str = "x-tillpoint-source";

/// Request bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Every path is handled by the proxy, so the router is a single fallback.
pub fn build_router(proxy: CacheProxy) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(proxy)
        .layer(ServiceBuilder::new())
}

async fn forward(State(proxy): State<CacheProxy>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "payload_too_large", "message": err.to_string()})),
            )
                .into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let request = ProxyRequest {
        method: parts.method,
        scheme: parts.uri.scheme_str().map(str::to_string),
        path_and_query,
        headers: parts.headers,
        body,
    };

    into_response(proxy.handle(request).await)
}

fn into_response(response: ProxyResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out.headers_mut()
        .insert(SOURCE_HEADER, HeaderValue::from_static(response.source.as_str()));
    out
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    proxy: CacheProxy,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, build_router(proxy))
        .with_graceful_shutdown(shutdown)
        .await
}
