//! SQLite backend
//!
//! Persists entries in a single `local_entries` table. Uses WAL mode and runs
//! versioned migrations recorded in `schema_migrations`.

use super::backend::{
    check_quota, decode_timestamp, encode_timestamp, KvBackend, LocalEntry, StoreUsage, StoredValue,
};
use super::schema;
use crate::shared::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// [`KvBackend`] over an sqlx SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    capacity: Option<u64>,
}

impl SqliteBackend {
    /// Open or create a database file
    ///
    /// Creates parent directories and the file if missing, then runs pending
    /// migrations.
    pub async fn open(path: impl AsRef<Path>, capacity: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::shared::error::CoreError::storage(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::info!("[LocalStore] opened {}", path.display());
        let backend = Self { pool, capacity };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Private in-memory database, gone when the backend is dropped
    pub async fn in_memory(capacity: Option<u64>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single pinned connection: every new in-memory connection is a new database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self { pool, capacity };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Close the pool, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(schema::CREATE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;

        let current_version: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        for (version, statements) in schema::pending_migrations(current_version.0) {
            self.apply_migration(version, statements).await?;
        }
        Ok(())
    }

    async fn apply_migration(&self, version: i32, statements: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(encode_timestamp(&Utc::now()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("[LocalStore] applied schema migration {}", version);
        Ok(())
    }

    fn entry_from_row(row: &SqliteRow) -> Result<LocalEntry> {
        let kind: String = row.try_get("value_kind")?;
        let blob: Vec<u8> = row.try_get("value")?;
        let stored_at: String = row.try_get("stored_at")?;
        let expires_at: Option<String> = row.try_get("expires_at")?;

        Ok(LocalEntry {
            key: row.try_get("key")?,
            value: StoredValue::from_blob(&kind, blob)?,
            stored_at: decode_timestamp(&stored_at)?,
            expires_at: expires_at.as_deref().map(decode_timestamp).transpose()?,
        })
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<LocalEntry>> {
        let row = sqlx::query(
            "SELECT key, value_kind, value, stored_at, expires_at FROM local_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn put(&self, entry: LocalEntry) -> Result<()> {
        let blob = entry.value.to_blob()?;

        if self.capacity.is_some() {
            let used_by_others: (i64,) = sqlx::query_as(
                "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(value)), 0)
                 FROM local_entries WHERE key != ?",
            )
            .bind(&entry.key)
            .fetch_one(&self.pool)
            .await?;
            let requested = (entry.key.len() + blob.len()) as u64;
            check_quota(&entry.key, self.capacity, used_by_others.0.max(0) as u64, requested)?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO local_entries (key, value_kind, value, stored_at, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.key)
        .bind(entry.value.kind())
        .bind(blob)
        .bind(encode_timestamp(&entry.stored_at))
        .bind(entry.expires_at.as_ref().map(encode_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM local_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM local_entries
             WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(encode_timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<LocalEntry>> {
        let rows = sqlx::query(
            "SELECT key, value_kind, value, stored_at, expires_at FROM local_entries
             WHERE substr(key, 1, ?) = ?
             ORDER BY key ASC",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM local_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(encode_timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn usage(&self) -> Result<StoreUsage> {
        let (entries, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(value)), 0)
             FROM local_entries",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreUsage {
            entries: entries.max(0) as u64,
            bytes: bytes.max(0) as u64,
        })
    }
}
