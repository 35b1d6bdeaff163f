use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tillpoint_cache_proxy::{CacheProxy, CacheStorage, ProxyConfig, ReqwestUpstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tillpoint_observability::init();

    let config = ProxyConfig::from_env().context("invalid proxy configuration")?;
    let db_path = config.resolve_db_path();
    let storage = CacheStorage::open(&db_path)
        .await
        .with_context(|| format!("failed to open cache storage at {}", db_path.display()))?;
    let upstream = ReqwestUpstream::new(config.origin.clone(), Duration::from_secs(30))
        .context("failed to build upstream client")?;

    let listen = config.listen;
    tracing::info!(origin = %config.origin, version = %config.cache_version, "starting tillpoint cache proxy");
    let proxy = CacheProxy::new(config, storage, Arc::new(upstream));

    match proxy.install().await {
        Ok(()) => {
            let deleted = proxy.activate().await.context("failed to activate cache proxy")?;
            tracing::info!(stale_caches = deleted.len(), "cache proxy active");
        }
        Err(err) => {
            tracing::warn!(error = %err, "install failed; forwarding requests without caching");
        }
    }

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    tillpoint_cache_proxy::serve(listener, proxy.clone(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await
    .context("proxy server failed")?;

    proxy.storage().close().await;
    Ok(())
}
