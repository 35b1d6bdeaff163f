use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};

use tillpoint_client::transport::IDEMPOTENCY_KEY_HEADER;
use tillpoint_client::{
    ApiError, ApiRequest, ApiResponse, Collection, HttpTransport, LocalStore, NetworkInterceptor,
    SyncContext, SyncOrchestrator, SyncOutcome, Transport,
};

/// Minimal POS API: records what it receives.
#[derive(Default)]
struct FakeApi {
    products: Mutex<Vec<Value>>,
    sales: Mutex<Vec<(Value, Option<String>)>>,
    product_updates: Mutex<Vec<(String, Value)>>,
}

async fn health() -> &'static str {
    "ok"
}

async fn list_products(State(api): State<Arc<FakeApi>>) -> Json<Value> {
    Json(Value::Array(api.products.lock().unwrap().clone()))
}

async fn empty_list() -> Json<Value> {
    Json(json!([]))
}

async fn create_sale(
    State(api): State<Arc<FakeApi>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut sales = api.sales.lock().unwrap();
    sales.push((body.clone(), key));
    Json(json!({"id": 1000 + sales.len(), "sale_id": body["sale_id"]}))
}

async fn update_product(
    State(api): State<Arc<FakeApi>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    api.product_updates.lock().unwrap().push((id, body.clone()));
    Json(body)
}

struct TestServer {
    base_url: String,
    api: Arc<FakeApi>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let api = Arc::new(FakeApi::default());
        let app = Router::new()
            .route("/api/health", get(health))
            .route("/api/products", get(list_products))
            .route("/api/products/:id", put(update_product))
            .route("/api/categories", get(empty_list))
            .route("/api/customers", get(empty_list))
            .route("/api/sales", post(create_sale))
            .with_state(api.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}/api", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            api,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Real HTTP transport with a cable that can be unplugged.
struct Cable {
    inner: HttpTransport,
    plugged: AtomicBool,
}

impl Cable {
    fn new(base_url: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: HttpTransport::new(base_url, Duration::from_secs(5)).unwrap(),
            plugged: AtomicBool::new(true),
        })
    }

    fn unplug(&self) {
        self.plugged.store(false, Ordering::SeqCst);
    }

    fn plug(&self) {
        self.plugged.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for Cable {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        if !self.plugged.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable("network cable unplugged".to_string()));
        }
        self.inner.send(request).await
    }
}

async fn open_store(dir: &tempfile::TempDir) -> LocalStore {
    LocalStore::open(&dir.path().join("offline.db")).await.unwrap()
}

#[tokio::test]
async fn offline_sale_is_posted_after_reconnect() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let cable = Cable::new(&server.base_url);
    let context = SyncContext::new(true);
    let api = NetworkInterceptor::new(cable.clone(), Some(store.clone()), context.clone());
    let orchestrator = SyncOrchestrator::new(store.clone(), cable.clone(), context.clone());

    cable.unplug();
    let response = api
        .post(
            "/sales",
            json!({
                "sale_id": "SALE-1",
                "items": [{"product_id": 1, "quantity": 2, "unit_price": 50}],
                "total_amount": 100,
                "payment_method": "cash"
            }),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(response.body["offline"], true);
    assert!(!context.is_online());

    let unsynced = store.list_unsynced_sales().await.unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].sale_id, "SALE-1");
    assert!(server.api.sales.lock().unwrap().is_empty());

    cable.plug();
    context.set_online(true);
    let report = match orchestrator.run_cycle().await {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Skipped(reason) => panic!("cycle skipped: {reason:?}"),
    };
    assert_eq!(report.sales_synced, 1);

    {
        let received = server.api.sales.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (body, key) = &received[0];
        assert_eq!(body["sale_id"], "SALE-1");
        assert_eq!(body["total_amount"], 100);
        assert!(body.get("synced").is_none());
        assert_eq!(key.as_deref(), Some(unsynced[0].idempotency_key.to_string().as_str()));
    }

    assert!(store.list_unsynced_sales().await.unwrap().is_empty());
    let synced = store.find_sale("SALE-1").await.unwrap().unwrap();
    assert!(synced.synced);
    assert_eq!(synced.server_id.as_deref(), Some("1001"));
}

#[tokio::test]
async fn offline_read_returns_cached_products() {
    let server = TestServer::spawn().await;
    *server.api.products.lock().unwrap() = vec![
        json!({"id": 1, "name": "Cola", "price": 1.5}),
        json!({"id": 2, "name": "Chips", "price": 2.0}),
        json!({"id": 3, "name": "Gum", "price": 0.5}),
    ];

    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let cable = Cable::new(&server.base_url);
    let context = SyncContext::new(true);
    let orchestrator = SyncOrchestrator::new(store.clone(), cable.clone(), context.clone());
    let api = NetworkInterceptor::new(cable.clone(), Some(store.clone()), context);

    orchestrator.run_cycle().await;
    assert_eq!(store.list_entities(Collection::Products).await.unwrap().len(), 3);

    cable.unplug();
    let response = api.get("/products").await.unwrap();
    assert!(response.from_cache);
    let names: Vec<&str> = response
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["Cola", "Chips", "Gum"]);
}

#[tokio::test]
async fn queued_update_survives_restart() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let cable = Cable::new(&server.base_url);

    {
        let store = open_store(&dir).await;
        let api = NetworkInterceptor::new(cable.clone(), Some(store.clone()), SyncContext::new(true));
        cable.unplug();
        let response = api.put("/products/5", json!({"price": 3.25})).await.unwrap();
        assert_eq!(response.status, 202);
        store.close().await;
    }

    let store = open_store(&dir).await;
    let pending = store.list_unsynced_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, "UPDATE_PRODUCT");

    cable.plug();
    let orchestrator = SyncOrchestrator::new(store.clone(), cable.clone(), SyncContext::new(true));
    let report = orchestrator.run_cycle().await.report().cloned().unwrap();
    assert_eq!(report.operations_synced, 1);

    let updates = server.api.product_updates.lock().unwrap().clone();
    assert_eq!(updates, vec![("5".to_string(), json!({"price": 3.25, "id": "5"}))]);
    assert!(store.list_unsynced_operations().await.unwrap().is_empty());
}
