//! Durable local store for offline support.
//!
//! One SQLite database holds every collection: mirrored reference snapshots,
//! locally recorded sales, the pending-operation queue and settings. The
//! store is cheap to clone and safe to share across tasks.

mod queue;
mod sales;
mod settings;
mod snapshot;

pub use settings::LAST_SYNC_AT;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::types::{Collection, SyncedCollection};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened (path, permissions, quota).
    #[error("local store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record in {collection} has no usable `id`")]
    MissingKey { collection: Collection },
    #[error("{0} is not a reference collection")]
    NotReferenceCollection(Collection),
    /// An unsynced write hit a sale the server has already accepted.
    #[error("sale {sale_id} is already synced")]
    SaleAlreadySynced { sale_id: String },
    #[error("corrupt row in {collection}: {reason}")]
    Corrupt {
        collection: Collection,
        reason: String,
    },
}

const SCHEMA: [&str; 10] = [
    r#"
    CREATE TABLE IF NOT EXISTS cached_entities (
        collection  TEXT NOT NULL,
        entity_id   TEXT NOT NULL,
        barcode     TEXT NULL,
        data        TEXT NOT NULL,
        cached_at   TEXT NOT NULL,
        PRIMARY KEY (collection, entity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cached_entities_barcode ON cached_entities (collection, barcode)",
    r#"
    CREATE TABLE IF NOT EXISTS sales (
        local_id        INTEGER PRIMARY KEY AUTOINCREMENT,
        sale_id         TEXT NOT NULL UNIQUE,
        server_id       TEXT NULL,
        synced          INTEGER NOT NULL DEFAULT 0,
        payload         TEXT NOT NULL,
        sale_date       TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        synced_at       TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sales_sale_date ON sales (sale_date)",
    "CREATE INDEX IF NOT EXISTS idx_sales_synced ON sales (synced)",
    r#"
    CREATE TABLE IF NOT EXISTS pending_operations (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        kind            TEXT NOT NULL,
        payload         TEXT NOT NULL,
        synced          INTEGER NOT NULL DEFAULT 0,
        timestamp       TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        synced_at       TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pending_operations_kind ON pending_operations (kind)",
    "CREATE INDEX IF NOT EXISTS idx_pending_operations_synced ON pending_operations (synced)",
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    "PRAGMA user_version = 1",
];

/// SQLite-backed local store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {e}")))?;
        }

        tracing::debug!(path = %path.display(), "local store opened");
        Ok(Self { pool })
    }

    /// Open the store at its default location:
    /// `{app_data_dir}/tillpoint/offline.db`.
    pub async fn open_default() -> Result<Self, StoreError> {
        let path = default_store_path()?;
        Self::open(&path).await
    }

    /// Close the underlying pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Flip `synced` to true. Returns `false` if the record was already synced
    /// (or does not exist); never reverts a synced record.
    pub async fn mark_synced(
        &self,
        collection: SyncedCollection,
        id: i64,
    ) -> Result<bool, StoreError> {
        match collection {
            SyncedCollection::Sales => self.mark_sale_synced(id, None).await,
            SyncedCollection::PendingOperations => self.mark_operation_synced(id).await,
        }
    }
}

/// Resolve the default path of the store database.
pub fn default_store_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or_else(|| {
            StoreError::Unavailable(
                "failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share"
                    .to_string(),
            )
        })?;

    Ok(base.join("tillpoint").join("offline.db"))
}

/// Timestamps are stored as fixed-width UTC strings so they sort correctly.
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(collection: Collection, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            collection,
            reason: format!("invalid timestamp {raw:?}: {e}"),
        })
}

pub(crate) fn decode_optional_time(
    collection: Collection,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| decode_time(collection, &s)).transpose()
}

pub(crate) fn decode_key(
    collection: Collection,
    raw: &str,
) -> Result<tillpoint_core::IdempotencyKey, StoreError> {
    tillpoint_core::IdempotencyKey::from_str(raw).map_err(|e| StoreError::Corrupt {
        collection,
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::LocalStore;

    /// A store in a fresh temporary directory; keep the guard alive.
    pub async fn temp_store() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("offline.db")).await.unwrap();
        (store, dir)
    }
}
