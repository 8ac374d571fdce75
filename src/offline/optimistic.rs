//! # Optimistic Updates
//!
//! Local-first mutations applied before the remote authority confirms them,
//! and reconciliation against authoritative state.
//!
//! ## Features
//!
//! - **Versioned Records**: every entity keeps its last committed value, its
//!   local value and the mutations still awaiting confirmation
//! - **Duplicate Guard**: a second mutation with the same
//!   `(entity, actor, kind)` while one is pending is rejected
//! - **Rebase**: confirming or rejecting one mutation re-applies the remaining
//!   ones on top of the new committed value
//! - **Server Wins**: reconciliation replaces local state and clears pending
//!   markers; older revisions are ignored
//!
//! ## Usage
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use serde_json::json;
//! use xfsync::offline::optimistic::{OptimisticEngine, ServerState};
//!
//! let engine = OptimisticEngine::new();
//! let key = engine
//!     .apply_optimistic("msg:1", "alice", "edit", |_| json!({"text": "draft"}))
//!     .await
//!     .unwrap();
//! assert!(engine.is_pending("msg:1", "alice", "edit").await);
//!
//! engine.reconcile("msg:1", ServerState::new(json!({"text": "final"}), Some(2))).await;
//! assert_eq!(engine.local_version("msg:1").await, Some(json!({"text": "final"})));
//! # let _ = key;
//! # });
//! ```

use crate::shared::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Re-appliable local mutation
pub type Mutation = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Identifies one pending optimistic mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingKey(String);

impl PendingKey {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutation applied locally and awaiting confirmation
#[derive(Clone)]
pub struct PendingMutation {
    /// Pending marker
    pub key: PendingKey,
    /// Who issued the mutation
    pub actor_id: String,
    /// Mutation kind, part of the duplicate guard
    pub kind: String,
    /// Sync operation carrying the mutation, once linked
    pub operation_id: Option<Uuid>,
    /// When the mutation was applied locally
    pub applied_at: DateTime<Utc>,
    mutation: Mutation,
}

impl fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMutation")
            .field("key", &self.key)
            .field("actor_id", &self.actor_id)
            .field("kind", &self.kind)
            .field("operation_id", &self.operation_id)
            .field("applied_at", &self.applied_at)
            .finish_non_exhaustive()
    }
}

/// Local view of one entity
#[derive(Debug, Clone)]
pub struct EntityRecord {
    /// Entity id
    pub entity_id: String,
    /// Value shown to the user: committed value plus pending mutations
    pub local_version: Value,
    /// Last value confirmed by the authority
    pub committed_version: Option<Value>,
    /// Mutations awaiting confirmation, oldest first
    pub pending: Vec<PendingMutation>,
    /// Authority revision of `committed_version`
    pub server_revision: Option<u64>,
}

impl EntityRecord {
    fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            local_version: Value::Null,
            committed_version: None,
            pending: Vec::new(),
            server_revision: None,
        }
    }

    /// Newest pending marker, if the entity is in flight
    pub fn pending_key(&self) -> Option<&PendingKey> {
        self.pending.last().map(|p| &p.key)
    }

    /// Whether any mutation is awaiting confirmation
    pub fn is_in_flight(&self) -> bool {
        !self.pending.is_empty()
    }

    fn rebase(&mut self) {
        let base = self.committed_version.clone().unwrap_or(Value::Null);
        self.local_version = self.pending.iter().fold(base, |value, p| (p.mutation)(&value));
    }

    fn is_stale(&self, revision: Option<u64>) -> bool {
        matches!((revision, self.server_revision), (Some(new), Some(old)) if new < old)
    }
}

/// Authoritative state reported by the remote authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    /// Authoritative value
    pub value: Value,
    /// Revision, when the authority versions the entity
    pub revision: Option<u64>,
}

impl ServerState {
    /// Create a server state
    pub fn new(value: Value, revision: Option<u64>) -> Self {
        Self { value, revision }
    }
}

/// Optimistic update and reconciliation engine
#[derive(Debug, Default)]
pub struct OptimisticEngine {
    records: RwLock<HashMap<String, EntityRecord>>,
}

impl OptimisticEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity's committed value without touching pending mutations
    pub async fn seed(&self, entity_id: &str, committed: Value, revision: Option<u64>) {
        let mut records = self.records.write().await;
        let record = records
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityRecord::new(entity_id));
        if record.is_stale(revision) {
            return;
        }
        record.committed_version = Some(committed);
        record.server_revision = revision.or(record.server_revision);
        record.rebase();
    }

    /// Apply a mutation locally before the authority confirms it
    ///
    /// Rejected with `AlreadyPending` while a mutation with the same
    /// `(entity, actor, kind)` is still awaiting confirmation.
    pub async fn apply_optimistic<F>(
        &self,
        entity_id: &str,
        actor_id: &str,
        kind: &str,
        mutation: F,
    ) -> Result<PendingKey>
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let mut records = self.records.write().await;
        let record = records
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityRecord::new(entity_id));

        if record
            .pending
            .iter()
            .any(|p| p.actor_id == actor_id && p.kind == kind)
        {
            tracing::debug!(
                "[Optimistic] duplicate {} by {} on {} ignored",
                kind,
                actor_id,
                entity_id
            );
            return Err(CoreError::AlreadyPending {
                entity: entity_id.to_string(),
                actor: actor_id.to_string(),
                kind: kind.to_string(),
            });
        }

        let mutation: Mutation = Arc::new(mutation);
        record.local_version = mutation(&record.local_version);
        let key = PendingKey::generate();
        record.pending.push(PendingMutation {
            key: key.clone(),
            actor_id: actor_id.to_string(),
            kind: kind.to_string(),
            operation_id: None,
            applied_at: Utc::now(),
            mutation,
        });
        Ok(key)
    }

    /// Link a pending mutation to the sync operation delivering it
    pub async fn attach_operation(&self, key: &PendingKey, operation_id: Uuid) -> bool {
        let mut records = self.records.write().await;
        records
            .values_mut()
            .flat_map(|r| r.pending.iter_mut())
            .find(|p| &p.key == key)
            .map(|p| p.operation_id = Some(operation_id))
            .is_some()
    }

    /// Find the pending mutation delivered by `operation_id`
    pub async fn find_by_operation(&self, operation_id: Uuid) -> Option<(String, PendingKey)> {
        let records = self.records.read().await;
        records.values().find_map(|r| {
            r.pending
                .iter()
                .find(|p| p.operation_id == Some(operation_id))
                .map(|p| (r.entity_id.clone(), p.key.clone()))
        })
    }

    /// The authority accepted a mutation
    ///
    /// With `server` the reported state becomes the committed value; without
    /// it the mutation itself is committed. Remaining pending mutations are
    /// re-applied on top. Unknown keys are ignored and return `None`.
    pub async fn confirm(&self, key: &PendingKey, server: Option<ServerState>) -> Option<Value> {
        let mut records = self.records.write().await;
        let record = records
            .values_mut()
            .find(|r| r.pending.iter().any(|p| &p.key == key))?;
        let index = record.pending.iter().position(|p| &p.key == key)?;
        let confirmed = record.pending.remove(index);

        match server {
            Some(state) if !record.is_stale(state.revision) => {
                record.committed_version = Some(state.value);
                record.server_revision = state.revision.or(record.server_revision);
            }
            Some(_) => {}
            None => {
                let base = record.committed_version.clone().unwrap_or(Value::Null);
                record.committed_version = Some((confirmed.mutation)(&base));
            }
        }
        record.rebase();
        Some(record.local_version.clone())
    }

    /// The authority refused a mutation; roll it back
    ///
    /// Unknown keys are ignored and return `None`.
    pub async fn reject(&self, key: &PendingKey) -> Option<Value> {
        let mut records = self.records.write().await;
        let record = records
            .values_mut()
            .find(|r| r.pending.iter().any(|p| &p.key == key))?;
        record.pending.retain(|p| &p.key != key);
        record.rebase();
        tracing::debug!("[Optimistic] rolled back {} on {}", key, record.entity_id);
        Some(record.local_version.clone())
    }

    /// Replace local state with authoritative state
    ///
    /// The server value wins and every pending marker on the entity is
    /// cleared. A revision older than the one already applied is ignored.
    pub async fn reconcile(&self, entity_id: &str, server: ServerState) -> Value {
        let mut records = self.records.write().await;
        let record = records
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityRecord::new(entity_id));

        if record.is_stale(server.revision) {
            tracing::debug!(
                "[Optimistic] stale reconciliation for {} ignored ({:?} < {:?})",
                entity_id,
                server.revision,
                record.server_revision
            );
            return record.local_version.clone();
        }

        if record.is_in_flight() && record.local_version != server.value {
            tracing::debug!(
                "[Optimistic] server state overrides {} pending mutations on {}",
                record.pending.len(),
                entity_id
            );
        }
        record.pending.clear();
        record.committed_version = Some(server.value.clone());
        record.server_revision = server.revision.or(record.server_revision);
        record.local_version = server.value;
        record.local_version.clone()
    }

    /// Snapshot of an entity record
    pub async fn get(&self, entity_id: &str) -> Option<EntityRecord> {
        self.records.read().await.get(entity_id).cloned()
    }

    /// Local value of an entity
    pub async fn local_version(&self, entity_id: &str) -> Option<Value> {
        self.records
            .read()
            .await
            .get(entity_id)
            .map(|r| r.local_version.clone())
    }

    /// Whether `(entity, actor, kind)` has a mutation in flight
    pub async fn is_pending(&self, entity_id: &str, actor_id: &str, kind: &str) -> bool {
        self.records.read().await.get(entity_id).map_or(false, |r| {
            r.pending
                .iter()
                .any(|p| p.actor_id == actor_id && p.kind == kind)
        })
    }

    /// Total pending mutations across all entities
    pub async fn pending_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .map(|r| r.pending.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn set_text(text: &'static str) -> impl Fn(&Value) -> Value + Send + Sync + 'static {
        move |_: &Value| json!({ "text": text })
    }

    fn increment(value: &Value) -> Value {
        json!(value.as_i64().unwrap_or(0) + 1)
    }

    #[tokio::test]
    async fn test_duplicate_rejected_while_pending() {
        let engine = OptimisticEngine::new();
        engine
            .apply_optimistic("m1", "alice", "edit", set_text("a"))
            .await
            .unwrap();
        let second = engine.apply_optimistic("m1", "alice", "edit", set_text("b")).await;
        assert_matches!(second, Err(CoreError::AlreadyPending { .. }));
        assert_eq!(engine.local_version("m1").await, Some(json!({"text": "a"})));

        // Other actors and kinds are independent
        assert!(engine.apply_optimistic("m1", "bob", "edit", set_text("c")).await.is_ok());
        assert!(engine.apply_optimistic("m1", "alice", "pin", set_text("d")).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirm_commits_and_clears_marker() {
        let engine = OptimisticEngine::new();
        engine.seed("n", json!(10), Some(1)).await;
        let key = engine.apply_optimistic("n", "a", "inc", increment).await.unwrap();
        assert_eq!(engine.local_version("n").await, Some(json!(11)));

        assert_eq!(engine.confirm(&key, None).await, Some(json!(11)));
        let record = engine.get("n").await.unwrap();
        assert_eq!(record.committed_version, Some(json!(11)));
        assert!(record.pending_key().is_none());
        assert!(engine.apply_optimistic("n", "a", "inc", increment).await.is_ok());
    }

    #[tokio::test]
    async fn test_reject_rebases_remaining() {
        let engine = OptimisticEngine::new();
        engine.seed("n", json!(0), None).await;
        let first = engine.apply_optimistic("n", "a", "inc", increment).await.unwrap();
        engine.apply_optimistic("n", "b", "inc", increment).await.unwrap();
        assert_eq!(engine.local_version("n").await, Some(json!(2)));

        assert_eq!(engine.reject(&first).await, Some(json!(1)));
        assert_eq!(engine.get("n").await.unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_with_server_state_rebases() {
        let engine = OptimisticEngine::new();
        engine.seed("n", json!(0), Some(1)).await;
        let first = engine.apply_optimistic("n", "a", "inc", increment).await.unwrap();
        engine.apply_optimistic("n", "b", "inc", increment).await.unwrap();

        let local = engine
            .confirm(&first, Some(ServerState::new(json!(5), Some(2))))
            .await;
        assert_eq!(local, Some(json!(6)));
    }

    #[tokio::test]
    async fn test_stale_keys_ignored() {
        let engine = OptimisticEngine::new();
        let key = engine.apply_optimistic("m", "a", "edit", set_text("x")).await.unwrap();
        engine.reconcile("m", ServerState::new(json!({"text": "srv"}), Some(3))).await;

        assert_eq!(engine.confirm(&key, None).await, None);
        assert_eq!(engine.reject(&key).await, None);
        assert_eq!(engine.local_version("m").await, Some(json!({"text": "srv"})));
    }

    #[tokio::test]
    async fn test_reconcile_server_wins_and_is_idempotent() {
        let engine = OptimisticEngine::new();
        engine.apply_optimistic("m", "a", "edit", set_text("local")).await.unwrap();

        let state = ServerState::new(json!({"text": "server"}), Some(4));
        let once = engine.reconcile("m", state.clone()).await;
        let twice = engine.reconcile("m", state).await;
        assert_eq!(once, twice);
        assert_eq!(engine.pending_count().await, 0);
        assert!(!engine.is_pending("m", "a", "edit").await);
    }

    #[tokio::test]
    async fn test_older_revision_ignored() {
        let engine = OptimisticEngine::new();
        engine.reconcile("m", ServerState::new(json!(2), Some(2))).await;
        let after = engine.reconcile("m", ServerState::new(json!(1), Some(1))).await;
        assert_eq!(after, json!(2));
    }

    #[tokio::test]
    async fn test_find_by_operation() {
        let engine = OptimisticEngine::new();
        let key = engine.apply_optimistic("m", "a", "edit", set_text("x")).await.unwrap();
        let op = Uuid::new_v4();
        assert!(engine.attach_operation(&key, op).await);
        assert_eq!(engine.find_by_operation(op).await, Some(("m".to_string(), key)));
        assert_eq!(engine.find_by_operation(Uuid::new_v4()).await, None);
    }
}
