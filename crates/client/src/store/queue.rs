//! Pending-operation queue.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use tillpoint_core::{IdempotencyKey, OperationKind};

use super::{LocalStore, StoreError, decode_key, decode_optional_time, decode_time, encode_time};
use crate::types::{Collection, PendingCounts, PendingOperation};

const OPERATION_COLUMNS: &str = "id, kind, payload, synced, timestamp, idempotency_key, synced_at";

impl LocalStore {
    /// Append a mutation to the queue. Enqueue order is replay order.
    pub async fn enqueue_operation(
        &self,
        kind: OperationKind,
        payload: Value,
        idempotency_key: IdempotencyKey,
    ) -> Result<PendingOperation, StoreError> {
        self.insert_operation(&kind.to_string(), payload, idempotency_key).await
    }

    pub(crate) async fn insert_operation(
        &self,
        kind: &str,
        payload: Value,
        idempotency_key: IdempotencyKey,
    ) -> Result<PendingOperation, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pending_operations (kind, payload, synced, timestamp, idempotency_key, synced_at)
            VALUES (?1, ?2, 0, ?3, ?4, NULL)
            RETURNING {OPERATION_COLUMNS}
            "#
        ))
        .bind(kind)
        .bind(serde_json::to_string(&payload)?)
        .bind(encode_time(Utc::now()))
        .bind(idempotency_key.to_string())
        .fetch_one(&self.pool)
        .await?;

        let op = row_to_operation(row)?;
        tracing::debug!(id = op.id, kind = %op.kind, "operation queued");
        Ok(op)
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_operation).transpose()
    }

    /// Unsynced operations in enqueue order.
    pub async fn list_unsynced_operations(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE synced = 0 ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }

    pub async fn list_operations_by_kind(
        &self,
        kind: OperationKind,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE kind = ?1 ORDER BY id ASC"
        ))
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }

    /// Returns `false` if the operation was already synced.
    pub async fn mark_operation_synced(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_operations
            SET synced = 1,
                synced_at = ?2
            WHERE id = ?1
              AND synced = 0
            "#,
        )
        .bind(id)
        .bind(encode_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_operation(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records still waiting for the server.
    pub async fn pending_count(&self) -> Result<PendingCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sales WHERE synced = 0) AS sales,
                (SELECT COUNT(*) FROM pending_operations WHERE synced = 0) AS operations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let sales: i64 = row.try_get("sales")?;
        let operations: i64 = row.try_get("operations")?;
        Ok(PendingCounts {
            sales: sales as u64,
            operations: operations as u64,
        })
    }

    /// Delete acknowledged sales and operations synced before `cutoff`.
    ///
    /// Unsynced records are never purged.
    pub async fn purge_synced(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = encode_time(cutoff);
        let mut tx = self.pool.begin().await?;

        let operations = sqlx::query(
            "DELETE FROM pending_operations WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at < ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;
        let sales = sqlx::query(
            "DELETE FROM sales WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at < ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(operations.rows_affected() + sales.rows_affected())
    }
}

fn row_to_operation(row: SqliteRow) -> Result<PendingOperation, StoreError> {
    let payload: String = row.try_get("payload")?;
    let timestamp: String = row.try_get("timestamp")?;
    let key: String = row.try_get("idempotency_key")?;

    Ok(PendingOperation {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        payload: serde_json::from_str(&payload)?,
        synced: row.try_get("synced")?,
        timestamp: decode_time(Collection::PendingOperations, &timestamp)?,
        idempotency_key: decode_key(Collection::PendingOperations, &key)?,
        synced_at: decode_optional_time(Collection::PendingOperations, row.try_get("synced_at")?)?,
    })
}
