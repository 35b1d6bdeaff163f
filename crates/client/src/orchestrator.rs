//! Sync orchestrator: drains local sales and the pending queue against the API,
//! then refreshes reference snapshots.
//!
//! A cycle runs four steps in order:
//! 1. replay unsynced sales (`POST /sales`), oldest first
//! 2. replay unsynced operations by kind, in enqueue order
//! 3. replace the product, category and customer snapshots
//! 4. record `last_sync_at`
//!
//! Every failure inside a step is contained to its item and reported in the
//! [`SyncReport`]; the cycle itself never fails.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tillpoint_core::{Resource, SyncRunId};

use crate::connectivity::SyncContext;
use crate::routes::dispatch_request;
use crate::store::{LAST_SYNC_AT, LocalStore};
use crate::transport::{ApiRequest, Transport};
use crate::types::{Collection, SyncReport, SyncStep, entity_key};

/// How a failed operation affects later operations on the same record.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayOrdering {
    /// Every operation is attempted regardless of earlier failures.
    #[default]
    Independent,
    /// A failure holds back later operations on the same `(resource, id)`
    /// until the next cycle.
    PerEntityBarrier,
}

impl FromStr for ReplayOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "independent" => Ok(ReplayOrdering::Independent),
            "per-entity" | "per_entity" | "per-entity-barrier" => Ok(ReplayOrdering::PerEntityBarrier),
            other => Err(format!("unknown replay ordering `{other}`")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped(_) => None,
        }
    }
}

pub struct SyncOrchestrator {
    store: LocalStore,
    transport: Arc<dyn Transport>,
    context: SyncContext,
    ordering: ReplayOrdering,
}

impl SyncOrchestrator {
    pub fn new(store: LocalStore, transport: Arc<dyn Transport>, context: SyncContext) -> Self {
        Self {
            store,
            transport,
            context,
            ordering: ReplayOrdering::default(),
        }
    }

    pub fn with_ordering(mut self, ordering: ReplayOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// Run one cycle unless offline or another cycle is in flight.
    pub async fn run_cycle(&self) -> SyncOutcome {
        if !self.context.is_online() {
            tracing::debug!("Skipping sync - offline");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        let Some(_guard) = self.context.try_begin_sync() else {
            tracing::debug!("Skipping sync - a cycle is already running");
            return SyncOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        let mut report = SyncReport::new(SyncRunId::new());
        tracing::info!(run_id = %report.run_id, "sync cycle started");

        self.sync_sales(&mut report).await;
        self.sync_operations(&mut report).await;
        self.refresh_reference_data(&mut report).await;
        self.record_completion(&mut report).await;

        report.finished_at = Some(Utc::now());
        tracing::info!(
            run_id = %report.run_id,
            sales_synced = report.sales_synced,
            sales_failed = report.sales_failed,
            operations_synced = report.operations_synced,
            operations_failed = report.operations_failed,
            operations_skipped = report.operations_skipped,
            operations_blocked = report.operations_blocked,
            refreshed = report.refreshed.len(),
            "sync cycle finished"
        );

        SyncOutcome::Completed(report)
    }

    async fn sync_sales(&self, report: &mut SyncReport) {
        let sales = match self.store.list_unsynced_sales().await {
            Ok(sales) => sales,
            Err(e) => {
                tracing::error!(error = %e, "failed to list unsynced sales");
                report.record_failure(SyncStep::Sales, "sales", e);
                return;
            }
        };
        if !sales.is_empty() {
            tracing::info!("Found {} unsynced sales", sales.len());
        }

        for sale in sales {
            let request = ApiRequest::post("/sales", sale.replay_payload())
                .with_idempotency_key(sale.idempotency_key);

            let response = match self.transport.send(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(sale_id = %sale.sale_id, error = %e, "sale sync failed, will retry next cycle");
                    report.sales_failed += 1;
                    report.record_failure(SyncStep::Sales, &sale.sale_id, e);
                    continue;
                }
            };

            match self
                .store
                .mark_sale_synced(sale.local_id, server_id(&response.body))
                .await
            {
                Ok(_) => {
                    tracing::debug!(sale_id = %sale.sale_id, "sale synced");
                    report.sales_synced += 1;
                }
                Err(e) => {
                    tracing::error!(sale_id = %sale.sale_id, error = %e, "failed to mark sale synced");
                    report.sales_failed += 1;
                    report.record_failure(SyncStep::Sales, &sale.sale_id, e);
                }
            }
        }
    }

    async fn sync_operations(&self, report: &mut SyncReport) {
        let operations = match self.store.list_unsynced_operations().await {
            Ok(operations) => operations,
            Err(e) => {
                tracing::error!(error = %e, "failed to list pending operations");
                report.record_failure(SyncStep::PendingOperations, "pending_operations", e);
                return;
            }
        };
        if !operations.is_empty() {
            tracing::info!("Found {} pending operations to sync", operations.len());
        }

        let mut blocked: HashSet<(Resource, String)> = HashSet::new();

        for op in operations {
            let kind = match op.operation_kind() {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(id = op.id, kind = %op.kind, error = %e, "skipping operation");
                    report.operations_skipped += 1;
                    continue;
                }
            };
            let entity = op.entity_id().map(|id| (kind.resource, id));

            if self.ordering == ReplayOrdering::PerEntityBarrier
                && entity.as_ref().is_some_and(|key| blocked.contains(key))
            {
                tracing::debug!(id = op.id, %kind, "held back behind an earlier failure");
                report.operations_blocked += 1;
                continue;
            }

            let request = match dispatch_request(kind, &op.payload) {
                Ok(request) => request.with_idempotency_key(op.idempotency_key),
                Err(e) => {
                    tracing::warn!(id = op.id, error = %e, "skipping operation");
                    report.operations_skipped += 1;
                    continue;
                }
            };

            match self.transport.send(&request).await {
                Ok(_) => match self.store.mark_operation_synced(op.id).await {
                    Ok(_) => {
                        tracing::debug!(id = op.id, %kind, "operation synced");
                        report.operations_synced += 1;
                    }
                    Err(e) => {
                        tracing::error!(id = op.id, error = %e, "failed to mark operation synced");
                        report.operations_failed += 1;
                        report.record_failure(SyncStep::PendingOperations, format!("{kind} #{}", op.id), e);
                    }
                },
                Err(e) => {
                    tracing::warn!(id = op.id, %kind, error = %e, "operation sync failed, will retry next cycle");
                    report.operations_failed += 1;
                    report.record_failure(SyncStep::PendingOperations, format!("{kind} #{}", op.id), e);
                    if let Some(key) = entity {
                        blocked.insert(key);
                    }
                }
            }
        }
    }

    async fn refresh_reference_data(&self, report: &mut SyncReport) {
        for resource in Resource::REFERENCE_DATA {
            let Some(collection) = Collection::for_resource(resource) else {
                continue;
            };
            let request = ApiRequest::get(format!("/{}", resource.path_segment()));

            let records = match self.transport.send(&request).await {
                Ok(response) => match snapshot_records(response.body) {
                    Some(records) => records,
                    None => {
                        tracing::warn!(%collection, "unexpected snapshot shape, keeping local copy");
                        report.record_failure(SyncStep::ReferenceData, collection.as_str(), "response is not a list");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(%collection, error = %e, "snapshot fetch failed, keeping local copy");
                    report.record_failure(SyncStep::ReferenceData, collection.as_str(), e);
                    continue;
                }
            };

            match self.store.replace_snapshot(collection, &records).await {
                Ok(count) => {
                    tracing::debug!(%collection, count, "snapshot refreshed");
                    report.refreshed.push(resource);
                }
                Err(e) => {
                    tracing::error!(%collection, error = %e, "failed to store snapshot");
                    report.record_failure(SyncStep::ReferenceData, collection.as_str(), e);
                }
            }
        }
    }

    async fn record_completion(&self, report: &mut SyncReport) {
        let now = Value::String(Utc::now().to_rfc3339());
        if let Err(e) = self.store.put_setting(LAST_SYNC_AT, &now).await {
            tracing::error!(error = %e, "failed to record sync time");
            report.record_failure(SyncStep::Bookkeeping, LAST_SYNC_AT, e);
        }
    }
}

/// Server identifier of a created record: `id` at the top level or under `data`.
fn server_id(body: &Value) -> Option<String> {
    body.get("id")
        .or_else(|| body.get("data").and_then(|data| data.get("id")))
        .and_then(entity_key)
}

/// Accepts a bare list or a `{ "data": [...] }` envelope.
fn snapshot_records(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(records) => Some(records),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(records)) => Some(records),
            _ => None,
        },
        _ => None,
    }
}
