//! # Local Database Module
//!
//! Durable key/value persistence with per-entry expiry. Backs the sync queue
//! (crash-safe pending operations), the resource loader cache and ad-hoc
//! caller data.
//!
//! ## Architecture
//!
//! - `backend.rs`: the [`KvBackend`] contract and entry types
//! - `memory.rs`: in-process backend, used by tests and restarts-in-process
//! - `sqlite.rs`: SQLite backend (WAL, versioned migrations)
//! - `schema.rs`: schema and migration definitions
//!
//! [`LocalStore`] layers TTL handling on top: reads past `expires_at` report
//! "not found" and evict the entry, and [`LocalStore::sweep_expired`]
//! reclaims space in bulk. Writes to the same key are last-writer-wins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use xfsync::local_db::{LocalStore, Ttl};
//!
//! # async fn example() -> xfsync::shared::error::Result<()> {
//! let store = LocalStore::in_memory();
//! store.store("draft:42", serde_json::json!({"text": "hi"}), Ttl::Default).await?;
//! let draft = store.get("draft:42").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use backend::{KvBackend, LocalEntry, StoreUsage, StoredValue};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::shared::clock::{SharedClock, SystemClock};
use crate::shared::config::StoreConfig;
use crate::shared::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Key prefix for sync metadata
const METADATA_PREFIX: &str = "meta/";

/// Expiry policy for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    /// The store's configured default horizon
    #[default]
    Default,
    /// Expire after the given duration
    After(Duration),
    /// Never expire
    Never,
}

/// Durable local store with TTL semantics
#[derive(Debug, Clone)]
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    clock: SharedClock,
    default_ttl: Duration,
}

impl LocalStore {
    /// Build a store over any backend
    pub fn new(backend: Arc<dyn KvBackend>, clock: SharedClock, default_ttl: Duration) -> Self {
        Self {
            backend,
            clock,
            default_ttl,
        }
    }

    /// Unlimited in-memory store with the system clock and default TTL
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(SystemClock),
            StoreConfig::default().default_ttl(),
        )
    }

    /// Open the SQLite store described by `config`
    pub async fn open_sqlite(config: &StoreConfig, clock: SharedClock) -> Result<Self> {
        let backend =
            SqliteBackend::open(config.resolved_database_path(), config.capacity_bytes).await?;
        Ok(Self::new(Arc::new(backend), clock, config.default_ttl()))
    }

    /// Clock used for timestamps
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn expiry_for(&self, now: DateTime<Utc>, ttl: Ttl) -> Option<DateTime<Utc>> {
        let horizon = match ttl {
            Ttl::Default => self.default_ttl,
            Ttl::After(duration) => duration,
            Ttl::Never => return None,
        };
        let horizon = ChronoDuration::from_std(horizon).unwrap_or(ChronoDuration::MAX);
        Some(now.checked_add_signed(horizon).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Write `value` under `key`
    ///
    /// Fails with `QuotaExceeded` when the backend is full; nothing is written then.
    pub async fn store(&self, key: &str, value: impl Into<StoredValue>, ttl: Ttl) -> Result<()> {
        let now = self.clock.now();
        let entry = LocalEntry {
            key: key.to_string(),
            value: value.into(),
            stored_at: now,
            expires_at: self.expiry_for(now, ttl),
        };
        if let Err(e) = self.backend.put(entry).await {
            tracing::warn!("[LocalStore] write of '{}' failed: {}", key, e);
            return Err(e);
        }
        Ok(())
    }

    /// Serialize `value` as JSON and store it
    pub async fn store_json<T: Serialize>(&self, key: &str, value: &T, ttl: Ttl) -> Result<()> {
        self.store(key, serde_json::to_value(value)?, ttl).await
    }

    /// Read the full entry, evicting it if expired
    pub async fn get_entry(&self, key: &str) -> Result<Option<LocalEntry>> {
        let Some(entry) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if entry.is_expired(now) {
            if self.backend.delete_if_expired(key, now).await? {
                tracing::debug!("[LocalStore] lazily evicted expired '{}'", key);
            }
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Read a value; `None` when missing or expired
    pub async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Read and deserialize a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(StoredValue::Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(StoredValue::Bytes(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove `key`; succeeds whether or not it existed
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await?;
        Ok(())
    }

    /// Live entries under `prefix`, ordered by key
    pub async fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<LocalEntry>> {
        let now = self.clock.now();
        Ok(self
            .backend
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .collect())
    }

    /// Delete every expired entry
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self.backend.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            tracing::info!("[LocalStore] swept {} expired entries", removed);
        }
        Ok(removed)
    }

    /// Space currently used
    pub async fn usage(&self) -> Result<StoreUsage> {
        self.backend.usage().await
    }

    /// Run `sweep_expired` every `interval` until the handle is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.sweep_expired().await {
                    tracing::error!("[LocalStore] sweep failed: {}", e);
                }
            }
        })
    }

    /// Set sync metadata
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let key = format!("{}{}", METADATA_PREFIX, key);
        self.store(&key, serde_json::Value::String(value.to_string()), Ttl::Never)
            .await
    }

    /// Get sync metadata
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let key = format!("{}{}", METADATA_PREFIX, key);
        self.get_json(&key).await
    }

    /// Get last sync timestamp
    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.get_metadata("last_sync_time").await? else {
            return Ok(None);
        };
        Ok(backend::decode_timestamp(&raw).ok())
    }

    /// Set last sync timestamp to now
    pub async fn set_last_sync_time(&self) -> Result<()> {
        let now = backend::encode_timestamp(&self.clock.now());
        self.set_metadata("last_sync_time", &now).await
    }
}
