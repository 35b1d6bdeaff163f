//! Records held by the local store and reported by the sync cycle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tillpoint_core::{DomainError, IdempotencyKey, OperationKind, Resource, SyncRunId};

/// Named collections of the local store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Products,
    Categories,
    Customers,
    Sales,
    PendingOperations,
    Settings,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Categories => "categories",
            Collection::Customers => "customers",
            Collection::Sales => "sales",
            Collection::PendingOperations => "pending_operations",
            Collection::Settings => "settings",
        }
    }

    /// Collection an offline read of `resource` is answered from.
    pub fn for_resource(resource: Resource) -> Option<Self> {
        match resource {
            Resource::Product => Some(Collection::Products),
            Resource::Category => Some(Collection::Categories),
            Resource::Customer => Some(Collection::Customers),
            Resource::Sale => Some(Collection::Sales),
            Resource::Return => None,
        }
    }

    /// Mirrored server snapshots (replaced wholesale, never edited locally).
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Collection::Products | Collection::Categories | Collection::Customers
        )
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collections whose records carry a `synced` flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncedCollection {
    Sales,
    PendingOperations,
}

/// Normalize a JSON primary key (`5` or `"5"`) to its string form.
pub fn entity_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A mirrored server record (product, category or customer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub collection: Collection,
    pub id: String,
    pub data: Value,
    pub cached_at: DateTime<Utc>,
}

/// Fields that only exist on the client and must not be replayed.
const LOCAL_ONLY_SALE_FIELDS: [&str; 6] = [
    "local_id",
    "synced",
    "synced_at",
    "server_id",
    "offline",
    "idempotency_key",
];

/// A sale about to be written to the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSale {
    /// Business identifier; assigned locally when absent.
    pub sale_id: Option<String>,
    pub server_id: Option<String>,
    pub sale_date: Option<DateTime<Utc>>,
    pub payload: Value,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewSale {
    /// Build from a create-sale request body.
    ///
    /// Picks up `sale_id` and the business date (`sale_date` or `date`, RFC 3339
    /// or a plain `YYYY-MM-DD` taken as midnight UTC) when present; the full
    /// body is kept as the replay payload.
    pub fn from_payload(payload: Value) -> Self {
        let sale_id = payload.get("sale_id").and_then(entity_key);
        let sale_date = ["sale_date", "date"]
            .iter()
            .filter_map(|field| payload.get(*field).and_then(Value::as_str))
            .find_map(|raw| {
                let parsed = parse_sale_date(raw);
                if parsed.is_none() {
                    tracing::warn!(value = raw, "unparseable sale date, using recording time");
                }
                parsed
            });

        Self {
            sale_id,
            server_id: None,
            sale_date,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_server_id(mut self, server_id: Option<String>) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

fn parse_sale_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A sale recorded on this device, online or offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSale {
    pub local_id: i64,
    pub sale_id: String,
    pub server_id: Option<String>,
    pub synced: bool,
    pub payload: Value,
    pub sale_date: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl LocalSale {
    /// Body of the create-sale call: the stored payload without local-only
    /// fields, with the business `sale_id` always present.
    pub fn replay_payload(&self) -> Value {
        let mut body = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        for field in LOCAL_ONLY_SALE_FIELDS {
            body.remove(field);
        }
        body.insert("sale_id".to_string(), Value::String(self.sale_id.clone()));
        Value::Object(body)
    }

    /// Shape returned to callers reading sales while offline.
    pub fn to_view(&self) -> Value {
        let mut view = match self.replay_payload() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        view.insert("local_id".to_string(), Value::from(self.local_id));
        view.insert("synced".to_string(), Value::Bool(self.synced));
        if let Some(server_id) = &self.server_id {
            view.insert("id".to_string(), Value::String(server_id.clone()));
        }
        Value::Object(view)
    }
}

/// A deferred mutation waiting to be replayed against the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: i64,
    /// Stored wire kind (`UPDATE_PRODUCT`); may be unknown to this build.
    pub kind: String,
    pub payload: Value,
    pub synced: bool,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    pub synced_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn operation_kind(&self) -> Result<OperationKind, DomainError> {
        self.kind.parse()
    }

    /// Target record of the operation, if the payload names one.
    pub fn entity_id(&self) -> Option<String> {
        self.payload.get("id").and_then(entity_key)
    }
}

/// Point-in-time view of the connectivity context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    pub syncing: bool,
}

/// Counts of records still waiting for the server.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub sales: u64,
    pub operations: u64,
}

impl PendingCounts {
    pub fn total(&self) -> u64 {
        self.sales + self.operations
    }
}

/// Step of a sync cycle, used to attribute failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Sales,
    PendingOperations,
    ReferenceData,
    Bookkeeping,
}

/// One contained failure inside a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub step: SyncStep,
    pub target: String,
    pub error: String,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: SyncRunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sales_synced: usize,
    pub sales_failed: usize,
    pub operations_synced: usize,
    pub operations_failed: usize,
    /// Unknown kinds or payloads that cannot be dispatched.
    pub operations_skipped: usize,
    /// Held back behind an earlier failure on the same entity.
    pub operations_blocked: usize,
    pub refreshed: Vec<Resource>,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn new(run_id: SyncRunId) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            sales_synced: 0,
            sales_failed: 0,
            operations_synced: 0,
            operations_failed: 0,
            operations_skipped: 0,
            operations_blocked: 0,
            refreshed: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        step: SyncStep,
        target: impl Into<String>,
        error: impl ToString,
    ) {
        self.failures.push(SyncFailure {
            step,
            target: target.into(),
            error: error.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.operations_blocked == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sale(payload: Value) -> LocalSale {
        LocalSale {
            local_id: 7,
            sale_id: "SALE-1".to_string(),
            server_id: None,
            synced: false,
            payload,
            sale_date: Utc::now(),
            idempotency_key: IdempotencyKey::new(),
            created_at: Utc::now(),
            synced_at: None,
        }
    }

    #[test]
    fn replay_payload_strips_local_fields() {
        let sale = sale(json!({
            "items": [{"product_id": 1, "quantity": 2}],
            "total_amount": 100,
            "local_id": 7,
            "synced": false,
            "offline": true
        }));

        let body = sale.replay_payload();
        assert_eq!(body["sale_id"], "SALE-1");
        assert_eq!(body["total_amount"], 100);
        assert!(body.get("local_id").is_none());
        assert!(body.get("synced").is_none());
        assert!(body.get("offline").is_none());
    }

    #[test]
    fn new_sale_reads_business_fields() {
        let sale = NewSale::from_payload(json!({
            "sale_id": "SALE-9",
            "date": "2024-03-01T10:00:00Z",
            "total_amount": 12.5
        }));
        assert_eq!(sale.sale_id.as_deref(), Some("SALE-9"));
        assert_eq!(sale.sale_date.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");

        let date_only = NewSale::from_payload(json!({"sale_date": "2024-03-01"}));
        assert_eq!(date_only.sale_date.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");

        let garbled = NewSale::from_payload(json!({"sale_date": "first of March"}));
        assert!(garbled.sale_date.is_none());

        let bare = NewSale::from_payload(json!({"total_amount": 1}));
        assert!(bare.sale_id.is_none());
        assert!(bare.sale_date.is_none());
    }

    #[test]
    fn entity_keys_normalize_numbers_and_strings() {
        assert_eq!(entity_key(&json!(5)), Some("5".to_string()));
        assert_eq!(entity_key(&json!("abc")), Some("abc".to_string()));
        assert_eq!(entity_key(&json!("")), None);
        assert_eq!(entity_key(&json!(null)), None);
    }
}
