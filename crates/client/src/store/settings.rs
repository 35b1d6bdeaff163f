//! Key/value settings.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use super::{LocalStore, StoreError, encode_time};

/// Completion time of the last sync cycle (RFC 3339 string).
pub const LAST_SYNC_AT: &str = "last_sync_at";

impl LocalStore {
    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Every setting, ordered by key.
    pub async fn list_settings(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<(String, Value), StoreError> {
                let key: String = row.try_get("key")?;
                let raw: String = row.try_get("value")?;
                Ok((key, serde_json::from_str(&raw)?))
            })
            .collect()
    }

    pub async fn put_setting(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(encode_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
