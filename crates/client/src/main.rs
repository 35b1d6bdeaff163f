//! Headless sync agent: keeps the local store in sync until Ctrl-C.

use anyhow::Context;
use tillpoint_client::{ClientConfig, OfflineClient, SyncEvent};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tillpoint_observability::init();

    let config = ClientConfig::from_env().context("invalid client configuration")?;
    tracing::info!(api_url = %config.api_url, ordering = ?config.replay_ordering, "starting tillpoint sync agent");

    let client = OfflineClient::start(config)
        .await
        .context("failed to start sync agent")?;

    if let Some(mut events) = client.subscribe() {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::Completed { trigger, report }) if !report.is_clean() => {
                        tracing::warn!(?trigger, failures = report.failures.len(), "sync completed with failures");
                    }
                    Ok(SyncEvent::Failed { trigger, error }) => {
                        tracing::error!(?trigger, %error, "sync failed");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "sync event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    client.shutdown().await;
    Ok(())
}
