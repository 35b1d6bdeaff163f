//! Named cache generations persisted in SQLite.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    /// Header name/value pairs worth replaying (content type, caching hints).
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        cache_name  TEXT NOT NULL,
        url         TEXT NOT NULL,
        status      INTEGER NOT NULL,
        headers     TEXT NOT NULL,
        body        BLOB NOT NULL,
        stored_at   TEXT NOT NULL,
        PRIMARY KEY (cache_name, url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries (cache_name)",
];

#[derive(Debug, Clone)]
pub struct CacheStorage {
    pool: SqlitePool,
}

impl CacheStorage {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
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
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Unavailable(format!("schema setup failed: {e}")))?;
        }

        Ok(Self { pool })
    }

    pub async fn put(&self, cache: &str, url: &str, response: &CachedResponse) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_name, url, status, headers, body, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(cache_name, url) DO UPDATE SET
                status = excluded.status,
                headers = excluded.headers,
                body = excluded.body,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(cache)
        .bind(url)
        .bind(i64::from(response.status))
        .bind(serde_json::to_string(&response.headers)?)
        .bind(&response.body)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a whole batch or nothing.
    pub async fn put_all(
        &self,
        cache: &str,
        entries: &[(String, CachedResponse)],
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut tx = self.pool.begin().await?;
        for (url, response) in entries {
            sqlx::query(
                r#"
                INSERT INTO cache_entries (cache_name, url, status, headers, body, stored_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(cache_name, url) DO UPDATE SET
                    status = excluded.status,
                    headers = excluded.headers,
                    body = excluded.body,
                    stored_at = excluded.stored_at
                "#,
            )
            .bind(cache)
            .bind(url)
            .bind(i64::from(response.status))
            .bind(serde_json::to_string(&response.headers)?)
            .bind(&response.body)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Look `url` up in one cache.
    pub async fn lookup(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>, StorageError> {
        let row = sqlx::query(
            "SELECT status, headers, body FROM cache_entries WHERE cache_name = ?1 AND url = ?2",
        )
        .bind(cache)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: i64 = row.try_get("status")?;
        let headers: String = row.try_get("headers")?;

        Ok(Some(CachedResponse {
            status: u16::try_from(status).unwrap_or(200),
            headers: serde_json::from_str(&headers)?,
            body: row.try_get("body")?,
        }))
    }

    pub async fn cache_names(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| row.try_get("cache_name").map_err(StorageError::from))
            .collect()
    }

    pub async fn entry_count(&self, cache: &str) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries WHERE cache_name = ?1")
            .bind(cache)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    /// Returns the number of entries removed.
    pub async fn delete_cache(&self, cache: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_name = ?1")
            .bind(cache)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
