//! Wiring of the offline client: store, transport, interceptor, sync worker
//! and connectivity monitor behind one handle.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::connectivity::{ConnectivityMonitor, MonitorHandle, SyncContext};
use crate::interceptor::NetworkInterceptor;
use crate::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::store::{LocalStore, StoreError};
use crate::sync_worker::{SyncEvent, SyncHandle, SyncTrigger, SyncWorker, SyncWorkerHandle, trigger_channel};
use crate::transport::{ApiError, HttpTransport, Transport};
use crate::types::{ConnectivityState, PendingCounts};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("local store unavailable; running network-only")]
    NetworkOnly,
}

struct SyncRuntime {
    orchestrator: Arc<SyncOrchestrator>,
    worker: SyncWorkerHandle,
}

/// A running offline-first client.
pub struct OfflineClient {
    context: SyncContext,
    store: Option<LocalStore>,
    interceptor: NetworkInterceptor,
    trigger: SyncHandle,
    sync: Option<SyncRuntime>,
    monitor: MonitorHandle,
}

impl OfflineClient {
    /// Start over HTTP using `config`.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let mut transport = HttpTransport::new(config.api_url.clone(), config.request_timeout)?;
        if let Some(token) = &config.auth_token {
            transport = transport.with_token(token.clone());
        }
        Ok(Self::start_with_transport(config, Arc::new(transport)).await)
    }

    /// Start over any transport.
    ///
    /// Never fails: if the local store cannot be opened the client logs it and
    /// runs network-only.
    pub async fn start_with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let context = SyncContext::new(transport.probe().await);
        tracing::info!(online = context.is_online(), "initial connectivity probed");

        let store = match config.store_path() {
            Ok(path) => LocalStore::open(&path).await,
            Err(e) => Err(e),
        };
        let store = match store {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::error!(error = %e, "local store unavailable, running network-only");
                None
            }
        };

        let (trigger, triggers) = trigger_channel();
        let sync = store.as_ref().map(|store| {
            let orchestrator = Arc::new(
                SyncOrchestrator::new(store.clone(), transport.clone(), context.clone())
                    .with_ordering(config.replay_ordering),
            );
            let worker = SyncWorker::with_receiver(orchestrator.clone(), triggers).start();
            SyncRuntime {
                orchestrator,
                worker,
            }
        });

        let monitor = ConnectivityMonitor::new(
            transport.clone(),
            context.clone(),
            trigger.clone(),
            config.probe_interval,
        )
        .start();

        let interceptor = NetworkInterceptor::new(transport, store.clone(), context.clone())
            .with_trigger(trigger.clone());

        trigger.request(SyncTrigger::Startup);

        Self {
            context,
            store,
            interceptor,
            trigger,
            sync,
            monitor,
        }
    }

    /// Entry point for every API call.
    pub fn api(&self) -> &NetworkInterceptor {
        &self.interceptor
    }

    pub fn store(&self) -> Option<&LocalStore> {
        self.store.as_ref()
    }

    pub fn state(&self) -> ConnectivityState {
        self.context.state()
    }

    pub fn is_network_only(&self) -> bool {
        self.store.is_none()
    }

    /// Sync events from the background worker; `None` when network-only.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        self.sync.as_ref().map(|sync| sync.worker.subscribe())
    }

    /// Ask the background worker for a cycle.
    pub fn request_sync(&self) -> bool {
        self.trigger.request(SyncTrigger::Manual)
    }

    /// Run a cycle now and wait for its outcome.
    pub async fn sync_now(&self) -> Result<SyncOutcome, ClientError> {
        let sync = self.sync.as_ref().ok_or(ClientError::NetworkOnly)?;
        Ok(sync.orchestrator.run_cycle().await)
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts, ClientError> {
        let store = self.store.as_ref().ok_or(ClientError::NetworkOnly)?;
        Ok(store.pending_count().await?)
    }

    /// Stop background tasks and close the store.
    pub async fn shutdown(self) {
        self.monitor.stop().await;
        if let Some(sync) = self.sync {
            sync.worker.stop().await;
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
        tracing::info!("offline client stopped");
    }
}
