//! Storage backend contract
//!
//! A [`KvBackend`] is the consumed "durable storage" dependency: an async
//! key/value store with capacity signalling and no multi-key transactions.
//! Expiry policy lives in [`LocalStore`](super::LocalStore); backends only keep
//! the timestamps and offer a bulk `delete_expired`.

use crate::shared::error::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A stored value: structured JSON or raw bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StoredValue {
    /// Structured value
    Json(serde_json::Value),
    /// Opaque payload (media, pages)
    Bytes(Vec<u8>),
}

impl StoredValue {
    /// Column tag used by table-backed stores
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Encode for a blob column
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        match self {
            Self::Json(value) => Ok(serde_json::to_vec(value)?),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// Decode from a blob column
    pub fn from_blob(kind: &str, blob: Vec<u8>) -> Result<Self> {
        match kind {
            "json" => Ok(Self::Json(serde_json::from_slice(&blob)?)),
            "bytes" => Ok(Self::Bytes(blob)),
            other => Err(CoreError::storage(format!("unknown value kind '{}'", other))),
        }
    }

    /// Encoded size in bytes
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Json(value) => serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0),
            Self::Bytes(bytes) => bytes.len() as u64,
        }
    }

    /// Borrow as JSON, if it is JSON
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Bytes(_) => None,
        }
    }

    /// Convert into bytes; JSON is serialized
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            Self::Bytes(bytes) => Ok(Bytes::from(bytes)),
        }
    }
}

impl From<serde_json::Value> for StoredValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<u8>> for StoredValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Bytes> for StoredValue {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// One persisted key/value pair with its timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Entry key
    pub key: String,
    /// Stored payload
    pub value: StoredValue,
    /// When the entry was written
    pub stored_at: DateTime<Utc>,
    /// When the entry stops being readable, `None` for never
    pub expires_at: Option<DateTime<Utc>>,
}

impl LocalEntry {
    /// Whether the entry is unreadable at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Bytes this entry counts against capacity
    pub fn size_bytes(&self) -> u64 {
        self.key.len() as u64 + self.value.size_bytes()
    }
}

/// Space used by a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    /// Number of entries, expired ones included until swept
    pub entries: u64,
    /// Bytes used
    pub bytes: u64,
}

/// Async key/value persistence
#[async_trait]
pub trait KvBackend: Send + Sync + std::fmt::Debug {
    /// Read an entry regardless of expiry
    async fn get(&self, key: &str) -> Result<Option<LocalEntry>>;

    /// Insert or overwrite; fails with `QuotaExceeded` when full
    async fn put(&self, entry: LocalEntry) -> Result<()>;

    /// Remove an entry, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<LocalEntry>>;

    /// Remove `key` only if the stored entry is expired at `now`
    ///
    /// Checked and removed atomically, so a concurrent fresh write survives.
    async fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Remove every entry expired at `now`, returning how many went
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Current space usage
    async fn usage(&self) -> Result<StoreUsage>;
}

/// Fixed-width RFC 3339 so text comparison matches time order
pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CoreError::storage(format!("bad timestamp '{}': {}", raw, e)))
}

/// Shared quota check
pub(crate) fn check_quota(
    key: &str,
    capacity: Option<u64>,
    used_by_others: u64,
    requested: u64,
) -> Result<()> {
    if let Some(capacity) = capacity {
        if used_by_others + requested > capacity {
            return Err(CoreError::QuotaExceeded {
                key: key.to_string(),
                requested,
                available: capacity.saturating_sub(used_by_others),
            });
        }
    }
    Ok(())
}
