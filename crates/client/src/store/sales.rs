//! Locally recorded sales.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use tillpoint_core::IdempotencyKey;

use super::{LocalStore, StoreError, decode_key, decode_optional_time, decode_time, encode_time};
use crate::types::{Collection, LocalSale, NewSale};

const SALE_COLUMNS: &str = "local_id, sale_id, server_id, synced, payload, sale_date, idempotency_key, created_at, synced_at";

impl LocalStore {
    /// Record a sale.
    ///
    /// Assigns a local `sale_id` when the sale has none. Writing a sale whose
    /// `sale_id` already exists updates it in place; `synced` never reverts.
    /// An unsynced write to a sale that is already synced leaves the row as it
    /// is and fails with [`StoreError::SaleAlreadySynced`].
    pub async fn enqueue_sale(&self, sale: NewSale, synced: bool) -> Result<LocalSale, StoreError> {
        let now = Utc::now();
        let sale_id = sale.sale_id.unwrap_or_else(|| generate_sale_id(now));
        let key = sale.idempotency_key.unwrap_or_default();
        let synced_at = synced.then(|| encode_time(now));

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sales (sale_id, server_id, synced, payload, sale_date, idempotency_key, created_at, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(sale_id) DO UPDATE SET
                server_id = COALESCE(excluded.server_id, sales.server_id),
                payload = excluded.payload,
                sale_date = excluded.sale_date,
                synced = MAX(sales.synced, excluded.synced),
                synced_at = COALESCE(sales.synced_at, excluded.synced_at)
            WHERE sales.synced = 0 OR excluded.synced = 1
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(&sale_id)
        .bind(sale.server_id)
        .bind(synced)
        .bind(serde_json::to_string(&sale.payload)?)
        .bind(encode_time(sale.sale_date.unwrap_or(now)))
        .bind(key.to_string())
        .bind(encode_time(now))
        .bind(synced_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::SaleAlreadySynced { sale_id });
        };
        let stored = row_to_sale(row)?;
        tracing::debug!(sale_id = %stored.sale_id, local_id = stored.local_id, synced = stored.synced, "sale recorded");
        Ok(stored)
    }

    pub async fn get_sale(&self, local_id: i64) -> Result<Option<LocalSale>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SALE_COLUMNS} FROM sales WHERE local_id = ?1"))
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_sale).transpose()
    }

    /// Look a sale up by its business identifier or, once acknowledged, by the
    /// server's identifier.
    pub async fn find_sale(&self, id: &str) -> Result<Option<LocalSale>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE sale_id = ?1 OR server_id = ?1 ORDER BY local_id LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sale).transpose()
    }

    pub async fn list_sales(&self) -> Result<Vec<LocalSale>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {SALE_COLUMNS} FROM sales ORDER BY local_id ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_sale).collect()
    }

    /// Sales with `from <= sale_date < to`, oldest first.
    pub async fn list_sales_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LocalSale>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE sale_date >= ?1 AND sale_date < ?2 ORDER BY sale_date ASC, local_id ASC"
        ))
        .bind(encode_time(from))
        .bind(encode_time(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_sale).collect()
    }

    /// Unsynced sales in insertion order.
    pub async fn list_unsynced_sales(&self) -> Result<Vec<LocalSale>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE synced = 0 ORDER BY local_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_sale).collect()
    }

    /// Mark a sale as accepted by the server, recording its server id when
    /// known. Returns `false` if it was already synced.
    pub async fn mark_sale_synced(
        &self,
        local_id: i64,
        server_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sales
            SET synced = 1,
                synced_at = ?2,
                server_id = COALESCE(?3, server_id)
            WHERE local_id = ?1
              AND synced = 0
            "#,
        )
        .bind(local_id)
        .bind(encode_time(Utc::now()))
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_sale(&self, local_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sales WHERE local_id = ?1")
            .bind(local_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Business identifier for a sale created without one: `local-<millis>-<suffix>`.
fn generate_sale_id(now: DateTime<Utc>) -> String {
    let suffix = IdempotencyKey::new().to_string();
    format!(
        "{}-{}",
        tillpoint_core::local_reference(now),
        &suffix[suffix.len() - 8..]
    )
}

fn row_to_sale(row: SqliteRow) -> Result<LocalSale, StoreError> {
    let payload: String = row.try_get("payload")?;
    let sale_date: String = row.try_get("sale_date")?;
    let key: String = row.try_get("idempotency_key")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(LocalSale {
        local_id: row.try_get("local_id")?,
        sale_id: row.try_get("sale_id")?,
        server_id: row.try_get("server_id")?,
        synced: row.try_get("synced")?,
        payload: serde_json::from_str(&payload)?,
        sale_date: decode_time(Collection::Sales, &sale_date)?,
        idempotency_key: decode_key(Collection::Sales, &key)?,
        created_at: decode_time(Collection::Sales, &created_at)?,
        synced_at: decode_optional_time(Collection::Sales, row.try_get("synced_at")?)?,
    })
}
