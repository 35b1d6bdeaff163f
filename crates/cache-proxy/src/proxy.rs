//! Install/activate lifecycle and the per-request caching policy.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ProxyConfig;
use crate::storage::{CacheStorage, CachedResponse, StorageError};
use crate::upstream::{ProxyRequest, Upstream, UpstreamError, UpstreamResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Installing,
    Installed,
    Activating,
    Active,
}

/// Where a response came from; reported in the `x-tillpoint-source` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    RuntimeCache,
    StaticCache,
    OfflinePage,
    Proxy,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RuntimeCache => "runtime-cache",
            Self::StaticCache => "static-cache",
            Self::OfflinePage => "offline-page",
            Self::Proxy => "proxy",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to precache {asset}: {reason}")]
    Precache { asset: String, reason: String },
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ProxyState,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl ProxyResponse {
    fn from_upstream(response: UpstreamResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Network,
        }
    }

    fn from_cache(cached: CachedResponse, source: ResponseSource) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &cached.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        Self {
            status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(cached.body),
            source,
        }
    }

    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
            source: ResponseSource::Proxy,
        }
    }

    fn text(status: StatusCode, body: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        Self {
            status,
            headers,
            body: Bytes::from_static(body.as_bytes()),
            source: ResponseSource::Proxy,
        }
    }
}

fn to_cached(response: &UpstreamResponse) -> CachedResponse {
    let headers = response
        .headers
        .iter()
        .filter(|(name, _)| *name != &header::SET_COOKIE)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    CachedResponse {
        status: response.status.as_u16(),
        headers,
        body: response.body.to_vec(),
    }
}

struct Inner {
    config: ProxyConfig,
    storage: CacheStorage,
    upstream: Arc<dyn Upstream>,
    state: watch::Sender<ProxyState>,
}

/// Network-first page cache in front of the origin.
#[derive(Clone)]
pub struct CacheProxy {
    inner: Arc<Inner>,
}

impl CacheProxy {
    pub fn new(config: ProxyConfig, storage: CacheStorage, upstream: Arc<dyn Upstream>) -> Self {
        let (state, _) = watch::channel(ProxyState::Installing);
        Self {
            inner: Arc::new(Inner {
                config,
                storage,
                upstream,
                state,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.inner.storage
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProxyState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: ProxyState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "cache proxy state changed");
        }
    }

    /// Fetch every precache asset, then store them together.
    ///
    /// Nothing is written unless every asset answered with a success status.
    pub async fn install(&self) -> Result<(), ProxyError> {
        let state = self.state();
        if state != ProxyState::Installing && state != ProxyState::Installed {
            return Err(ProxyError::InvalidState {
                operation: "install",
                state,
            });
        }
        self.set_state(ProxyState::Installing);

        let config = &self.inner.config;
        let assets = config.precache_assets();
        let mut fetched = Vec::with_capacity(assets.len());
        for asset in &assets {
            let response = self
                .inner
                .upstream
                .fetch(&ProxyRequest::get(asset.clone()))
                .await
                .map_err(|e| ProxyError::Precache {
                    asset: asset.clone(),
                    reason: e.to_string(),
                })?;

            if !response.status.is_success() {
                return Err(ProxyError::Precache {
                    asset: asset.clone(),
                    reason: format!("origin answered {}", response.status),
                });
            }
            fetched.push((asset.clone(), to_cached(&response)));
        }

        let cache = config.static_cache_name();
        self.inner.storage.put_all(&cache, &fetched).await?;
        tracing::info!(%cache, assets = fetched.len(), "precached static assets");

        self.set_state(ProxyState::Installed);
        Ok(())
    }

    /// Drop every cache generation other than the current pair.
    ///
    /// Returns the names of the deleted caches.
    pub async fn activate(&self) -> Result<Vec<String>, ProxyError> {
        let state = self.state();
        if state != ProxyState::Installed {
            return Err(ProxyError::InvalidState {
                operation: "activate",
                state,
            });
        }
        self.set_state(ProxyState::Activating);

        match self.delete_stale_caches().await {
            Ok(deleted) => {
                self.set_state(ProxyState::Active);
                Ok(deleted)
            }
            Err(err) => {
                self.set_state(ProxyState::Installed);
                Err(err)
            }
        }
    }

    async fn delete_stale_caches(&self) -> Result<Vec<String>, ProxyError> {
        let keep = [
            self.inner.config.static_cache_name(),
            self.inner.config.runtime_cache_name(),
        ];
        let mut deleted = Vec::new();
        for name in self.inner.storage.cache_names().await? {
            if keep.contains(&name) {
                continue;
            }
            let entries = self.inner.storage.delete_cache(&name).await?;
            tracing::info!(cache = %name, entries, "deleted stale cache generation");
            deleted.push(name);
        }
        Ok(deleted)
    }

    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        if self.state() != ProxyState::Active {
            return self.pass_through(&request).await;
        }

        let http_scheme = request
            .scheme
            .as_deref()
            .is_none_or(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"));
        if request.method != Method::GET || !http_scheme {
            return self.pass_through(&request).await;
        }

        if self.is_api_path(request.path()) {
            return self.network_only(&request).await;
        }

        self.network_first(&request).await
    }

    fn is_api_path(&self, path: &str) -> bool {
        let prefix = self.inner.config.api_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    async fn pass_through(&self, request: &ProxyRequest) -> ProxyResponse {
        match self.inner.upstream.fetch(request).await {
            Ok(response) => ProxyResponse::from_upstream(response),
            Err(err) => {
                tracing::warn!(method = %request.method, path = %request.path_and_query, error = %err, "pass-through request failed");
                ProxyResponse::json(
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "bad_gateway", "message": err.to_string()}),
                )
            }
        }
    }

    async fn network_only(&self, request: &ProxyRequest) -> ProxyResponse {
        match self.inner.upstream.fetch(request).await {
            Ok(response) => ProxyResponse::from_upstream(response),
            Err(err) => {
                tracing::debug!(path = %request.path_and_query, error = %err, "api request failed while offline");
                ProxyResponse::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "error": "offline",
                        "message": "You are offline. Please check your connection.",
                        "offline": true,
                    }),
                )
            }
        }
    }

    async fn network_first(&self, request: &ProxyRequest) -> ProxyResponse {
        let err = match self.inner.upstream.fetch(request).await {
            Ok(response) => {
                if response.status.is_success() {
                    self.store_runtime(&request.path_and_query, &response).await;
                }
                return ProxyResponse::from_upstream(response);
            }
            Err(err) => err,
        };

        self.cache_fallback(request, &err).await
    }

    async fn store_runtime(&self, url: &str, response: &UpstreamResponse) {
        let cache = self.inner.config.runtime_cache_name();
        if let Err(err) = self.inner.storage.put(&cache, url, &to_cached(response)).await {
            tracing::warn!(%url, error = %err, "failed to store runtime cache entry");
        }
    }

    async fn lookup(&self, cache: &str, url: &str) -> Option<CachedResponse> {
        match self.inner.storage.lookup(cache, url).await {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(%cache, %url, error = %err, "cache lookup failed");
                None
            }
        }
    }

    async fn cache_fallback(&self, request: &ProxyRequest, err: &UpstreamError) -> ProxyResponse {
        let config = &self.inner.config;
        let url = request.path_and_query.as_str();
        tracing::debug!(%url, error = %err, "origin unavailable, trying caches");

        if let Some(hit) = self.lookup(&config.runtime_cache_name(), url).await {
            return ProxyResponse::from_cache(hit, ResponseSource::RuntimeCache);
        }
        if let Some(hit) = self.lookup(&config.static_cache_name(), url).await {
            return ProxyResponse::from_cache(hit, ResponseSource::StaticCache);
        }
        if request.is_navigation() {
            if let Some(page) = self.lookup(&config.static_cache_name(), &config.offline_page).await {
                return ProxyResponse::from_cache(page, ResponseSource::OfflinePage);
            }
        }

        ProxyResponse::text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};

    use crate::upstream::{ProxyRequest, Upstream, UpstreamError, UpstreamResponse};

    /// Scripted origin; unknown paths answer 404.
    pub struct FakeUpstream {
        online: AtomicBool,
        pages: Mutex<HashMap<String, (StatusCode, String)>>,
        requests: Mutex<Vec<(Method, String)>>,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            Self {
                online: AtomicBool::new(true),
                pages: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn serve(&self, path: &str, status: StatusCode, body: &str) {
            self.pages
                .lock()
                .unwrap()
                .insert(path.to_string(), (status, body.to_string()));
        }

        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn requests(&self) -> Vec<(Method, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, request: &ProxyRequest) -> Result<UpstreamResponse, UpstreamError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.method.clone(), request.path_and_query.clone()));
            if !self.online.load(Ordering::SeqCst) {
                return Err(UpstreamError::Unreachable("connection refused".to_string()));
            }

            let (status, body) = self
                .pages
                .lock()
                .unwrap()
                .get(&request.path_and_query)
                .cloned()
                .unwrap_or((StatusCode::NOT_FOUND, "not found".to_string()));
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

            Ok(UpstreamResponse {
                status,
                headers,
                body: Bytes::from(body),
            })
        }
    }
}
