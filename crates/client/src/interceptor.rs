//! The single chokepoint for API calls.
//!
//! Online, calls pass straight through. When the transport cannot reach the
//! server, reads are answered from the local store and mutations are recorded
//! locally with a provisional `202` so the caller can carry on.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use tillpoint_core::{Action, IdempotencyKey, OperationKind, Resource};

use crate::connectivity::{SyncContext, Transition};
use crate::routes::{Route, classify, is_auth_path, queued_payload};
use crate::store::{LocalStore, StoreError};
use crate::sync_worker::{SyncHandle, SyncTrigger};
use crate::transport::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::types::{Collection, NewSale, entity_key};

const SALE_SAVED_OFFLINE: &str = "Sale saved offline and will sync when connection is restored";
const CHANGE_SAVED_OFFLINE: &str = "Change saved offline and will sync when connection is restored";

#[derive(Clone)]
pub struct NetworkInterceptor {
    transport: Arc<dyn Transport>,
    store: Option<LocalStore>,
    context: SyncContext,
    trigger: Option<SyncHandle>,
}

impl NetworkInterceptor {
    /// `store` is `None` when the local store could not be opened; the
    /// interceptor then runs network-only.
    pub fn new(transport: Arc<dyn Transport>, store: Option<LocalStore>, context: SyncContext) -> Self {
        Self {
            transport,
            store,
            context,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: SyncHandle) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Send a call, degrading to the local store on connectivity failure.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if is_auth_path(&request.path) {
            return self.transport.send(&request).await;
        }

        let request = if request.is_mutating() && request.idempotency_key.is_none() {
            request.with_idempotency_key(IdempotencyKey::new())
        } else {
            request
        };

        match self.transport.send(&request).await {
            Ok(response) => {
                self.mark_reachable();
                self.record_online_sale(&request, &response).await;
                Ok(response)
            }
            Err(err) if self.is_connectivity_failure(&err) => {
                self.context.set_online(false);
                self.fallback(&request, err).await
            }
            Err(err) => {
                if matches!(err, ApiError::Status { .. }) {
                    self.mark_reachable();
                }
                Err(err)
            }
        }
    }

    fn is_connectivity_failure(&self, err: &ApiError) -> bool {
        match err {
            ApiError::Unreachable(_) => true,
            ApiError::Other(_) => !self.context.is_online(),
            ApiError::Status { .. } => false,
        }
    }

    fn mark_reachable(&self) {
        if self.context.set_online(true) == Transition::WentOnline {
            self.request_sync(SyncTrigger::Reconnected);
        }
    }

    fn request_sync(&self, trigger: SyncTrigger) {
        if let Some(handle) = &self.trigger {
            if !handle.request(trigger) {
                tracing::debug!(?trigger, "sync worker not running");
            }
        }
    }

    async fn fallback(&self, request: &ApiRequest, err: ApiError) -> Result<ApiResponse, ApiError> {
        let Some(store) = &self.store else {
            tracing::warn!(path = %request.path, "offline and no local store, request failed");
            return Err(err);
        };

        let result = match classify(&request.method, &request.path) {
            Route::Read { resource, id } => read_offline(store, resource, id.as_deref()).await,
            Route::Mutation { kind, id } => self.defer(store, request, kind, id.as_deref()).await,
            Route::Unmapped => {
                tracing::warn!(method = %request.method, path = %request.path, "no offline handling for request");
                return Err(err);
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(path = %request.path, error = %e, "local store failed while offline");
                Err(err)
            }
        }
    }

    async fn defer(
        &self,
        store: &LocalStore,
        request: &ApiRequest,
        kind: OperationKind,
        id: Option<&str>,
    ) -> Result<Result<ApiResponse, ApiError>, StoreError> {
        let key = request.idempotency_key.unwrap_or_default();

        let (sale_id, message) = if kind == OperationKind::new(Action::Create, Resource::Sale) {
            let body = request.body.clone().unwrap_or_else(|| json!({}));
            let sale = NewSale::from_payload(body.clone()).with_idempotency_key(key);
            match store.enqueue_sale(sale, false).await {
                Ok(sale) => {
                    tracing::info!(sale_id = %sale.sale_id, "sale saved offline");
                    (Some(sale.sale_id), SALE_SAVED_OFFLINE)
                }
                Err(StoreError::SaleAlreadySynced { sale_id }) => {
                    defer_synced_sale_change(store, &sale_id, &body, key).await?;
                    (Some(sale_id), CHANGE_SAVED_OFFLINE)
                }
                Err(e) => return Err(e),
            }
        } else {
            let payload = queued_payload(request.body.as_ref(), id);
            let op = store.enqueue_operation(kind, payload, key).await?;
            tracing::info!(id = op.id, %kind, "operation queued offline");
            (None, CHANGE_SAVED_OFFLINE)
        };

        self.request_sync(SyncTrigger::Enqueued);

        let mut body = json!({
            "id": tillpoint_core::local_reference(Utc::now()),
            "message": message,
            "offline": true,
        });
        if let Some(sale_id) = sale_id {
            body["sale_id"] = Value::String(sale_id);
        }

        Ok(Ok(ApiResponse {
            status: 202,
            body,
            from_cache: false,
        }))
    }

    /// A sale accepted online is also kept locally, already synced, so it shows
    /// up in offline sale listings.
    async fn record_online_sale(&self, request: &ApiRequest, response: &ApiResponse) {
        let Some(store) = &self.store else {
            return;
        };
        let creates_sale = matches!(
            classify(&request.method, &request.path),
            Route::Mutation { kind, id: None } if kind == OperationKind::new(Action::Create, Resource::Sale)
        );
        if !creates_sale {
            return;
        }

        let body = request.body.clone().unwrap_or_else(|| json!({}));
        let server_id = response
            .body
            .get("id")
            .or_else(|| response.body.get("data").and_then(|d| d.get("id")))
            .and_then(entity_key);
        let mut sale = NewSale::from_payload(body).with_server_id(server_id);
        if let Some(key) = request.idempotency_key {
            sale = sale.with_idempotency_key(key);
        }

        if let Err(e) = store.enqueue_sale(sale, true).await {
            tracing::error!(error = %e, "failed to record sale locally");
        }
    }
}

/// A create for a sale the server already holds becomes an `UPDATE_SALE`
/// against the server's id, so the change is replayed instead of dropped.
async fn defer_synced_sale_change(
    store: &LocalStore,
    sale_id: &str,
    body: &Value,
    key: IdempotencyKey,
) -> Result<(), StoreError> {
    let target = store
        .find_sale(sale_id)
        .await?
        .and_then(|sale| sale.server_id)
        .unwrap_or_else(|| sale_id.to_string());

    let kind = OperationKind::new(Action::Update, Resource::Sale);
    let op = store
        .enqueue_operation(kind, queued_payload(Some(body), Some(&target)), key)
        .await?;
    tracing::warn!(%sale_id, id = op.id, "sale already synced, change queued as update");
    Ok(())
}

async fn read_offline(
    store: &LocalStore,
    resource: Resource,
    id: Option<&str>,
) -> Result<Result<ApiResponse, ApiError>, StoreError> {
    let body = match (resource, id) {
        (Resource::Sale, None) => Some(Value::Array(
            store.list_sales().await?.iter().map(|s| s.to_view()).collect(),
        )),
        (Resource::Sale, Some(id)) => store.find_sale(id).await?.map(|s| s.to_view()),
        (resource, id) => {
            let Some(collection) = Collection::for_resource(resource) else {
                return Ok(Err(not_found(resource)));
            };
            match id {
                None => Some(Value::Array(
                    store
                        .list_entities(collection)
                        .await?
                        .into_iter()
                        .map(|e| e.data)
                        .collect(),
                )),
                Some(id) => store.get_entity(collection, id).await?.map(|e| e.data),
            }
        }
    };

    tracing::debug!(%resource, found = body.is_some(), "served from local store");
    Ok(match body {
        Some(body) => Ok(ApiResponse {
            status: 200,
            body,
            from_cache: true,
        }),
        None => Err(not_found(resource)),
    })
}

fn not_found(resource: Resource) -> ApiError {
    ApiError::Status {
        status: 404,
        body: json!({
            "error": format!("{} not found in offline cache", resource.wire_name().to_ascii_lowercase()),
            "offline": true,
        }),
    }
}
