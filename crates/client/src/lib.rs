//! Offline-first sync client for the Tillpoint POS API.
//!
//! - `store`: durable SQLite store (snapshots, sales, pending operations, settings)
//! - `interceptor`: wraps API calls, degrading to the store when offline
//! - `orchestrator`: replays local work and refreshes snapshots on reconnect
//! - `sync_worker`: single-consumer trigger loop around the orchestrator
//! - `connectivity`: online flag, sync lock and the connectivity probe loop

pub mod client;
pub mod config;
pub mod connectivity;
pub mod interceptor;
pub mod orchestrator;
pub mod routes;
pub mod store;
pub mod sync_worker;
pub mod transport;
pub mod types;

pub use client::{ClientError, OfflineClient};
pub use config::{ClientConfig, ConfigError};
pub use connectivity::{SyncContext, SyncGuard, Transition};
pub use interceptor::NetworkInterceptor;
pub use orchestrator::{ReplayOrdering, SkipReason, SyncOrchestrator, SyncOutcome};
pub use store::{LocalStore, StoreError};
pub use sync_worker::{SyncEvent, SyncHandle, SyncTrigger, SyncWorker};
pub use transport::{ApiError, ApiRequest, ApiResponse, HttpTransport, Transport};
pub use types::*;

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::{Value, json};

    use crate::transport::{ApiError, ApiRequest, ApiResponse, Transport};

    /// Scriptable in-memory transport.
    ///
    /// Unscripted GETs answer `[]`, other unscripted calls `{}`. While offline
    /// every call fails as unreachable. Every attempt is recorded.
    pub struct FakeTransport {
        online: AtomicBool,
        delay: Option<Duration>,
        responses: Mutex<HashMap<(Method, String), Result<Value, ApiError>>>,
        requests: Mutex<Vec<ApiRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                online: AtomicBool::new(true),
                delay: None,
                responses: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn respond(&self, method: Method, path: &str, response: Result<Value, ApiError>) {
            self.responses
                .lock()
                .unwrap()
                .insert((method, path.to_string()), response);
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            if !self.online.load(Ordering::SeqCst) {
                return Err(ApiError::Unreachable("connection refused".to_string()));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = self
                .responses
                .lock()
                .unwrap()
                .get(&(request.method.clone(), request.path.clone()))
                .cloned();
            match scripted {
                Some(result) => result.map(ApiResponse::ok),
                None if request.method == Method::GET => Ok(ApiResponse::ok(json!([]))),
                None => Ok(ApiResponse::ok(json!({}))),
            }
        }
    }
}
