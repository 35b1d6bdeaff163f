use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::Html;
use axum::routing::get;

use tillpoint_cache_proxy::{
    CacheProxy, CacheStorage, ProxyConfig, ProxyState, ReqwestUpstream, SOURCE_HEADER, build_router,
};

#[derive(Default)]
struct Origin {
    menu_hits: AtomicUsize,
}

async fn page(body: &'static str) -> Html<&'static str> {
    Html(body)
}

async fn menu(State(origin): State<Arc<Origin>>) -> Html<String> {
    let n = origin.menu_hits.fetch_add(1, Ordering::SeqCst) + 1;
    Html(format!("<h1>Menu v{n}</h1>"))
}

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_origin() -> (TestServer, Arc<Origin>) {
    let origin = Arc::new(Origin::default());
    let app = Router::new()
        .route("/", get(|| page("<h1>POS</h1>")))
        .route("/index.html", get(|| page("<h1>POS</h1>")))
        .route("/offline.html", get(|| page("<h1>You are offline</h1>")))
        .route("/manifest.json", get(|| async { r#"{"name":"POS"}"# }))
        .route("/menu", get(menu))
        .route("/api/products", get(|| async { "[]" }))
        .with_state(origin.clone());

    (TestServer::spawn(app).await, origin)
}

async fn proxy_for(origin_url: &str, dir: &tempfile::TempDir) -> CacheProxy {
    let config = ProxyConfig::default()
        .with_origin(origin_url)
        .with_cache_version("test")
        .with_db_path(dir.path().join("proxy.db"));
    let storage = CacheStorage::open(&config.resolve_db_path()).await.unwrap();
    // No pooled connections, so stopping the origin is visible immediately.
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let upstream = ReqwestUpstream::with_client(client, config.origin.clone());
    CacheProxy::new(config, storage, Arc::new(upstream))
}

fn source(response: &reqwest::Response) -> String {
    response.headers()[SOURCE_HEADER].to_str().unwrap().to_string()
}

#[tokio::test]
async fn pages_survive_origin_outage() {
    let (origin, origin_state) = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_for(&origin.base_url, &dir).await;

    proxy.install().await.unwrap();
    proxy.activate().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Active);

    let server = TestServer::spawn(build_router(proxy)).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/menu", server.base_url)).send().await.unwrap();
    assert_eq!(source(&response), "network");
    assert_eq!(response.text().await.unwrap(), "<h1>Menu v1</h1>");

    let response = client
        .get(format!("{}/api/products", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    origin.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = client.get(format!("{}/menu", server.base_url)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(source(&response), "runtime-cache");
    assert_eq!(response.text().await.unwrap(), "<h1>Menu v1</h1>");
    assert_eq!(origin_state.menu_hits.load(Ordering::SeqCst), 1);

    let response = client
        .get(format!("{}/settings", server.base_url))
        .header(header::ACCEPT, "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(source(&response), "offline-page");
    assert_eq!(response.text().await.unwrap(), "<h1>You are offline</h1>");

    let response = client
        .get(format!("{}/api/products", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["offline"], true);
}

#[tokio::test]
async fn uninstalled_proxy_reports_bad_gateway_for_dead_origin() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_origin = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let proxy = proxy_for(&dead_origin, &dir).await;
    assert!(proxy.install().await.is_err());
    assert_eq!(proxy.state(), ProxyState::Installing);

    let server = TestServer::spawn(build_router(proxy)).await;
    let response = reqwest::get(format!("{}/", server.base_url)).await.unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(source(&response), "proxy");
}
