//! In-process backend
//!
//! Clones share the same map, so dropping every component built on a
//! `MemoryBackend` and building new ones over a clone behaves like a process
//! restart over the same persisted state.

use super::backend::{check_quota, KvBackend, LocalEntry, StoreUsage};
use crate::shared::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Map-backed [`KvBackend`] with an optional byte cap
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<String, LocalEntry>>>,
    capacity: Option<u64>,
}

impl MemoryBackend {
    /// Unlimited backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses writes beyond `capacity` bytes
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            entries: Arc::default(),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<LocalEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, entry: LocalEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let used_by_others: u64 = entries
            .values()
            .filter(|existing| existing.key != entry.key)
            .map(LocalEntry::size_bytes)
            .sum();
        check_quota(&entry.key, self.capacity, used_by_others, entry.size_bytes())?;
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<LocalEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok((before - entries.len()) as u64)
    }

    async fn usage(&self) -> Result<StoreUsage> {
        let entries = self.entries.read().await;
        Ok(StoreUsage {
            entries: entries.len() as u64,
            bytes: entries.values().map(LocalEntry::size_bytes).sum(),
        })
    }
}
