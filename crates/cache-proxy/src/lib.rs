//! Local caching proxy for the tillpoint web front end.
//!
//! Sits between the browser and the origin server. After installing (precaching
//! a static asset list) and activating (dropping older cache generations) it
//! answers page requests network-first, falling back to cached copies and an
//! offline page when the origin is unreachable. API calls are never cached.

pub mod config;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod upstream;

pub use config::{ConfigError, ProxyConfig};
pub use proxy::{CacheProxy, ProxyError, ProxyResponse, ProxyState, ResponseSource};
pub use server::{SOURCE_HEADER, build_router, serve};
pub use storage::{CacheStorage, CachedResponse, StorageError};
pub use upstream::{ProxyRequest, ReqwestUpstream, Upstream, UpstreamError, UpstreamResponse};
