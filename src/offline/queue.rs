//! # Operation Queue
//!
//! Durable, ordered queue of mutations awaiting delivery to the remote
//! authority.
//!
//! ## Features
//!
//! - **Persistent Queue**: every operation is written to the local store
//!   before `enqueue` returns and survives restarts in its original order
//! - **Per-Entity FIFO**: operations on the same entity key are delivered in
//!   enqueue order; different entities may interleave
//! - **Backoff**: transient failures are retried with exponential backoff up
//!   to a maximum attempt count
//! - **Dead Letters**: conflicts, rejections and exhausted operations are kept
//!   for inspection until the caller dismisses or retries them
//! - **Connectivity Aware**: draining pauses when the network goes away
//! - **Settlement Feed**: `settlements()` delivers every `Completed` and
//!   `Failed` outcome without the lag the broadcast bus allows
//!
//! ## Usage
//!
//! ```rust,no_run
//! # async fn demo(queue: std::sync::Arc<xfsync::offline::queue::SyncQueue>) -> xfsync::shared::error::Result<()> {
//! use xfsync::offline::queue::NewOperation;
//!
//! let id = queue
//!     .enqueue(NewOperation::update("msg:42", serde_json::json!({"text": "edited"})))
//!     .await?;
//!
//! let report = queue.drain().await;
//! println!("delivered {} failed {}", report.delivered, report.failed);
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

use super::retry::RetryPolicy;
use crate::local_db::{LocalStore, Ttl};
use crate::shared::config::SyncConfig;
use crate::shared::error::{ConflictReason, CoreError, Result, TransportError};
use crate::shared::event::{EventBus, SyncEvent};
use crate::sync::metrics::DrainMetrics;
use crate::sync::network_monitor::ConnectivityMonitor;
use crate::sync::sync_state::ConnectivityState;
use crate::transport::{SyncRequest, Transport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const PENDING_PREFIX: &str = "sync/pending/";
const DEAD_PREFIX: &str = "sync/dead/";
const RECENT_COMPLETED_LIMIT: usize = 256;

/// What kind of mutation an operation carries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create an entity
    Create,
    /// Update an entity
    Update,
    /// Delete an entity
    Delete,
    /// Application-defined mutation, e.g. `reaction`
    Custom(String),
}

impl OperationKind {
    /// Name used on the wire
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be delivered
    Pending,
    /// Currently being delivered
    InFlight,
    /// Dead-lettered
    Failed,
    /// Acknowledged by the remote authority
    Completed,
}

/// Why an operation ended up in the dead-letter view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Entity missing or concurrently modified on the server
    Conflict(ConflictReason),
    /// Server refused the operation
    Rejected(String),
    /// Maximum attempts used up on transient errors
    RetriesExhausted,
    /// Failed by hand through [`SyncQueue::mark_failed`]
    Caller(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Conflict(reason) => write!(f, "conflict: {}", reason),
            FailureReason::Rejected(message) => write!(f, "rejected: {}", message),
            FailureReason::RetriesExhausted => f.write_str("retries exhausted"),
            FailureReason::Caller(message) => write!(f, "failed by caller: {}", message),
        }
    }
}

/// Caller input for [`SyncQueue::enqueue`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Mutation kind
    pub kind: OperationKind,
    /// FIFO ordering key, e.g. a message id
    pub entity_key: String,
    /// Mutation payload
    pub payload: serde_json::Value,
    /// Id chosen by the caller; a fresh one is generated when unset
    pub id: Option<Uuid>,
}

impl NewOperation {
    /// Operation of any kind
    pub fn new(kind: OperationKind, entity_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            entity_key: entity_key.into(),
            payload,
            id: None,
        }
    }

    /// Use a pre-generated operation id
    ///
    /// Lets the caller link the id to local state before the operation can be
    /// delivered.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// `create` operation
    pub fn create(entity_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OperationKind::Create, entity_key, payload)
    }

    /// `update` operation
    pub fn update(entity_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OperationKind::Update, entity_key, payload)
    }

    /// `delete` operation
    pub fn delete(entity_key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, entity_key, serde_json::Value::Null)
    }

    /// Application-defined operation
    pub fn custom(
        name: impl Into<String>,
        entity_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Custom(name.into()), entity_key, payload)
    }
}

/// Queued operation with delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Operation id, also the idempotency key
    pub id: Uuid,
    /// Mutation kind
    pub kind: OperationKind,
    /// FIFO ordering key
    pub entity_key: String,
    /// Mutation payload
    pub payload: serde_json::Value,
    /// When the operation was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic sequence number, restores order after restart
    pub seq: u64,
    /// Delivery attempts made
    pub attempts: u32,
    /// Error from the last failed attempt
    pub last_error: Option<String>,
    /// Current status
    pub status: OperationStatus,
    /// Set once dead-lettered
    pub failure: Option<FailureReason>,
    #[serde(skip)]
    next_attempt_at: Option<Instant>,
}

impl SyncOperation {
    fn storage_key(&self) -> String {
        match self.status {
            OperationStatus::Failed => dead_key(self.seq),
            _ => pending_key(self.seq),
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Structured error for a dead-lettered operation
    pub fn error(&self) -> Option<CoreError> {
        self.failure.as_ref().map(|failure| match failure {
            FailureReason::Conflict(reason) => CoreError::conflict(&self.entity_key, reason.clone()),
            FailureReason::Rejected(message) => CoreError::Rejected {
                message: message.clone(),
            },
            FailureReason::RetriesExhausted | FailureReason::Caller(_) => {
                CoreError::PermanentFailure {
                    operation_id: self.id,
                    attempts: self.attempts,
                    last_error: self.last_error.clone().unwrap_or_else(|| failure.to_string()),
                }
            }
        })
    }
}

fn pending_key(seq: u64) -> String {
    format!("{}{:020}", PENDING_PREFIX, seq)
}

fn dead_key(seq: u64) -> String {
    format!("{}{:020}", DEAD_PREFIX, seq)
}

/// Outcome of one [`SyncQueue::drain`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Operations acknowledged by the authority
    pub delivered: usize,
    /// Operations moved to the dead-letter view
    pub failed: usize,
    /// Operations still queued when the drain ended
    pub remaining: usize,
    /// Drain stopped because connectivity was lost
    pub paused: bool,
    /// Another drain was already running; nothing was done
    pub already_running: bool,
}

impl DrainReport {
    /// Report for a re-entrant call
    pub fn already_running() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Operations waiting for delivery
    pub pending: usize,
    /// Operations being delivered
    pub in_flight: usize,
    /// Dead-lettered operations
    pub failed: usize,
    /// Operations acknowledged since startup
    pub completed_total: u64,
    /// Retries scheduled since startup
    pub retries_total: u64,
}

#[derive(Debug, Default)]
struct QueueInner {
    active: Vec<SyncOperation>,
    dead: Vec<SyncOperation>,
    next_seq: u64,
    completed_total: u64,
    retries_total: u64,
    recent_completed: VecDeque<Uuid>,
}

impl QueueInner {
    /// Next deliverable operation: the oldest ready head of any entity
    fn next_eligible(&self, now: Instant) -> NextOperation {
        let mut seen = HashSet::new();
        let mut earliest: Option<Instant> = None;
        for (index, op) in self.active.iter().enumerate() {
            if !seen.insert(op.entity_key.as_str()) {
                continue;
            }
            if op.is_ready(now) {
                return NextOperation::Ready(index);
            }
            if let Some(at) = op.next_attempt_at {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }
        match earliest {
            Some(at) => NextOperation::WaitUntil(at),
            None => NextOperation::Idle,
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.active.iter().position(|op| op.id == id)
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

enum NextOperation {
    Ready(usize),
    WaitUntil(Instant),
    Idle,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable sync queue
#[derive(Debug)]
pub struct SyncQueue {
    store: LocalStore,
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectivityMonitor>,
    events: EventBus<SyncEvent>,
    policy: RetryPolicy,
    inner: RwLock<QueueInner>,
    draining: AtomicBool,
    wake: Notify,
    metrics: Mutex<DrainMetrics>,
    settlements: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl SyncQueue {
    /// Open the queue, restoring persisted operations in their original order
    ///
    /// Operations that were in flight when the process stopped are pending again.
    pub async fn open(
        store: LocalStore,
        transport: Arc<dyn Transport>,
        monitor: Arc<ConnectivityMonitor>,
        events: EventBus<SyncEvent>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let mut active = Self::load(&store, PENDING_PREFIX).await?;
        let dead = Self::load(&store, DEAD_PREFIX).await?;

        for op in active.iter_mut() {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
            }
        }
        let next_seq = active
            .iter()
            .chain(dead.iter())
            .map(|op| op.seq + 1)
            .max()
            .unwrap_or(0);

        if !active.is_empty() || !dead.is_empty() {
            tracing::info!(
                "[SyncQueue] restored {} pending and {} failed operations",
                active.len(),
                dead.len()
            );
        }
        monitor.set_backlog(active.len());

        Ok(Self {
            store,
            transport,
            monitor,
            events,
            policy: RetryPolicy::from_config(config),
            inner: RwLock::new(QueueInner {
                active,
                dead,
                next_seq,
                ..QueueInner::default()
            }),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
            metrics: Mutex::new(DrainMetrics::new()),
            settlements: Mutex::new(Vec::new()),
        })
    }

    async fn load(store: &LocalStore, prefix: &str) -> Result<Vec<SyncOperation>> {
        let mut ops = Vec::new();
        for entry in store.entries_with_prefix(prefix).await? {
            let Some(json) = entry.value.as_json() else {
                tracing::warn!("[SyncQueue] skipping non-JSON entry {}", entry.key);
                continue;
            };
            match serde_json::from_value::<SyncOperation>(json.clone()) {
                Ok(op) => ops.push(op),
                Err(e) => tracing::warn!("[SyncQueue] skipping corrupt entry {}: {}", entry.key, e),
            }
        }
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    /// Durably enqueue an operation and return its id
    ///
    /// Fails only when the local store refuses the write (e.g. `QuotaExceeded`);
    /// the operation is not queued then.
    pub async fn enqueue(&self, operation: NewOperation) -> Result<Uuid> {
        let mut inner = self.inner.write().await;
        let id = operation.id.unwrap_or_else(Uuid::new_v4);
        if inner.recent_completed.contains(&id)
            || inner.active.iter().chain(inner.dead.iter()).any(|op| op.id == id)
        {
            return Err(CoreError::InvalidTransition {
                from: format!("queued {}", id),
                event: "enqueue".to_string(),
            });
        }
        let op = SyncOperation {
            id,
            kind: operation.kind,
            entity_key: operation.entity_key,
            payload: operation.payload,
            enqueued_at: self.store.clock().now(),
            seq: inner.next_seq,
            attempts: 0,
            last_error: None,
            status: OperationStatus::Pending,
            failure: None,
            next_attempt_at: None,
        };
        self.persist(&op).await?;
        inner.alloc_seq();

        let (id, entity_key) = (op.id, op.entity_key.clone());
        tracing::debug!("[SyncQueue] queued {} {} for {}", op.kind, id, entity_key);
        inner.active.push(op);
        self.monitor.set_backlog(inner.active.len());
        drop(inner);

        self.events.publish(SyncEvent::Queued {
            operation_id: id,
            entity_key,
        });
        self.wake.notify_one();
        Ok(id)
    }

    /// Pending and in-flight operations in delivery order
    pub async fn get_pending(&self) -> Vec<SyncOperation> {
        self.inner.read().await.active.clone()
    }

    /// Dead-lettered operations, oldest first
    pub async fn get_failed(&self) -> Vec<SyncOperation> {
        self.inner.read().await.dead.clone()
    }

    /// Look up an active or dead-lettered operation
    pub async fn get(&self, id: Uuid) -> Option<SyncOperation> {
        let inner = self.inner.read().await;
        inner
            .active
            .iter()
            .chain(inner.dead.iter())
            .find(|op| op.id == id)
            .cloned()
    }

    /// Status of an operation, including recently completed ones
    pub async fn status(&self, id: Uuid) -> Option<OperationStatus> {
        let inner = self.inner.read().await;
        if inner.recent_completed.contains(&id) {
            return Some(OperationStatus::Completed);
        }
        inner
            .active
            .iter()
            .chain(inner.dead.iter())
            .find(|op| op.id == id)
            .map(|op| op.status)
    }

    /// Number of pending and in-flight operations
    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    /// Get operation statistics
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;
        let in_flight = inner
            .active
            .iter()
            .filter(|op| op.status == OperationStatus::InFlight)
            .count();
        QueueStats {
            pending: inner.active.len() - in_flight,
            in_flight,
            failed: inner.dead.len(),
            completed_total: inner.completed_total,
            retries_total: inner.retries_total,
        }
    }

    /// Deliver queued operations until the queue is empty or the network drops
    ///
    /// Re-entrant calls return immediately with `already_running` set.
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            return DrainReport::already_running();
        }
        let _guard = DrainGuard(&self.draining);
        self.lock_metrics().record_drain_start();
        let report = self.run_drain().await;
        self.lock_metrics().record_drain_end(&report);
        report
    }

    /// Drain performance so far
    pub fn drain_metrics(&self) -> DrainMetrics {
        self.lock_metrics().clone()
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, DrainMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lossless feed of `Completed` and `Failed` outcomes
    ///
    /// Unlike bus subscribers, a settlement receiver never skips events, so
    /// state keyed on operation ids can always be resolved.
    pub fn settlements(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.settlements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    fn settle(&self, event: SyncEvent) {
        self.settlements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
        self.events.publish(event);
    }

    async fn run_drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        {
            let mut inner = self.inner.write().await;
            for op in inner.active.iter_mut() {
                if op.status == OperationStatus::InFlight {
                    op.status = OperationStatus::Pending;
                }
            }
            if inner.active.is_empty() {
                drop(inner);
                self.monitor.finish_drain();
                return report;
            }
        }

        if !self.monitor.state().is_connected() {
            report.paused = true;
            report.remaining = self.pending_count().await;
            return report;
        }

        self.monitor.begin_drain();
        tracing::info!("[SyncQueue] drain started");
        let mut state_rx = self.monitor.subscribe_state();

        loop {
            if !self.monitor.state().is_connected() {
                report.paused = true;
                break;
            }

            let next = {
                let mut inner = self.inner.write().await;
                match inner.next_eligible(Instant::now()) {
                    NextOperation::Ready(index) => {
                        let op = &mut inner.active[index];
                        op.status = OperationStatus::InFlight;
                        op.attempts += 1;
                        op.next_attempt_at = None;
                        let op = op.clone();
                        if let Err(e) = self.persist(&op).await {
                            tracing::warn!("[SyncQueue] could not persist {}: {}", op.id, e);
                        }
                        Ok(op)
                    }
                    NextOperation::WaitUntil(deadline) => Err(deadline),
                    NextOperation::Idle => break,
                }
            };

            match next {
                Ok(op) => self.deliver(op, &mut report).await,
                Err(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        // A fresh enqueue may be deliverable before the deadline
                        _ = self.wake.notified() => {}
                        _ = state_rx.wait_for(|state| !state.is_connected()) => {
                            report.paused = true;
                            break;
                        }
                    }
                }
            }
        }

        report.remaining = self.pending_count().await;
        if report.paused {
            tracing::info!(
                "[SyncQueue] drain paused, connectivity lost with {} operations remaining",
                report.remaining
            );
        } else {
            self.monitor.finish_drain();
            if report.delivered > 0 {
                if let Err(e) = self.store.set_last_sync_time().await {
                    tracing::warn!("[SyncQueue] could not record sync time: {}", e);
                }
            }
            tracing::info!(
                "[SyncQueue] drain finished: {} delivered, {} failed",
                report.delivered,
                report.failed
            );
        }
        report
    }

    async fn deliver(&self, op: SyncOperation, report: &mut DrainReport) {
        let request = SyncRequest {
            operation_id: op.id,
            kind: op.kind.clone(),
            entity_key: op.entity_key.clone(),
            payload: op.payload.clone(),
            attempt: op.attempts,
        };
        let result = self.transport.send(request).await;

        let mut inner = self.inner.write().await;
        let Some(index) = inner.position(op.id) else {
            tracing::warn!("[SyncQueue] operation {} vanished during delivery", op.id);
            return;
        };

        match result {
            Ok(response) => {
                let op = inner.active.remove(index);
                if let Err(e) = self.store.delete(&op.storage_key()).await {
                    tracing::warn!("[SyncQueue] could not remove {}: {}", op.id, e);
                }
                inner.completed_total += 1;
                inner.recent_completed.push_back(op.id);
                if inner.recent_completed.len() > RECENT_COMPLETED_LIMIT {
                    inner.recent_completed.pop_front();
                }
                self.monitor.set_backlog(inner.active.len());
                drop(inner);

                report.delivered += 1;
                tracing::debug!("[SyncQueue] {} delivered on attempt {}", op.id, op.attempts);
                self.settle(SyncEvent::Completed {
                    operation_id: op.id,
                    entity_key: op.entity_key,
                    response: response.payload,
                });
            }
            Err(e) if e.is_retryable() => {
                let message = e.to_string();
                if !self.monitor.state().is_connected() {
                    // Lost the network mid-flight: not an attempt against the authority
                    let op = &mut inner.active[index];
                    op.status = OperationStatus::Pending;
                    op.attempts = op.attempts.saturating_sub(1);
                    op.last_error = Some(message);
                    let op = op.clone();
                    if let Err(e) = self.persist(&op).await {
                        tracing::warn!("[SyncQueue] could not persist {}: {}", op.id, e);
                    }
                    return;
                }

                match self.policy.next_delay(op.attempts) {
                    Some(delay) => {
                        let op = &mut inner.active[index];
                        op.status = OperationStatus::Pending;
                        op.last_error = Some(message.clone());
                        op.next_attempt_at = Some(Instant::now() + delay);
                        let op = op.clone();
                        if let Err(e) = self.persist(&op).await {
                            tracing::warn!("[SyncQueue] could not persist {}: {}", op.id, e);
                        }
                        inner.retries_total += 1;
                        drop(inner);

                        tracing::warn!(
                            "[SyncQueue] {} attempt {} failed ({}), retrying in {:?}",
                            op.id,
                            op.attempts,
                            message,
                            delay
                        );
                        self.events.publish(SyncEvent::Retrying {
                            operation_id: op.id,
                            attempts: op.attempts,
                            delay_ms: delay.as_millis() as u64,
                        });
                    }
                    None => {
                        self.dead_letter(&mut inner, index, FailureReason::RetriesExhausted, message)
                            .await;
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                let reason = match e {
                    TransportError::Conflict(reason) => FailureReason::Conflict(reason),
                    TransportError::Rejected(message) => FailureReason::Rejected(message),
                    _ => FailureReason::RetriesExhausted,
                };
                self.dead_letter(&mut inner, index, reason, message).await;
                report.failed += 1;
            }
        }
    }

    async fn dead_letter(
        &self,
        inner: &mut QueueInner,
        index: usize,
        reason: FailureReason,
        last_error: String,
    ) {
        let mut op = inner.active.remove(index);
        if let Err(e) = self.store.delete(&op.storage_key()).await {
            tracing::warn!("[SyncQueue] could not remove {}: {}", op.id, e);
        }
        op.status = OperationStatus::Failed;
        op.failure = Some(reason.clone());
        op.last_error = Some(last_error);
        op.next_attempt_at = None;
        if let Err(e) = self.persist(&op).await {
            tracing::warn!("[SyncQueue] could not persist dead letter {}: {}", op.id, e);
        }

        tracing::error!(
            "[SyncQueue] {} failed permanently after {} attempts: {}",
            op.id,
            op.attempts,
            reason
        );
        self.settle(SyncEvent::Failed {
            operation_id: op.id,
            entity_key: op.entity_key.clone(),
            reason,
        });
        inner.dead.push(op);
        self.monitor.set_backlog(inner.active.len());
    }

    /// Fail a pending operation by hand
    ///
    /// In-flight operations cannot be failed; their outcome is awaited.
    pub async fn mark_failed(&self, id: Uuid, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = inner
            .position(id)
            .ok_or_else(|| CoreError::not_found(format!("pending operation {}", id)))?;
        if inner.active[index].status == OperationStatus::InFlight {
            return Err(CoreError::InvalidTransition {
                from: "in_flight".to_string(),
                event: "mark_failed".to_string(),
            });
        }
        let reason = reason.into();
        self.dead_letter(&mut inner, index, FailureReason::Caller(reason.clone()), reason)
            .await;
        Ok(())
    }

    /// Move a dead-lettered operation back to the end of the queue
    pub async fn retry_failed(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = inner
            .dead
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| CoreError::not_found(format!("failed operation {}", id)))?;

        let mut op = inner.dead[index].clone();
        let old_key = op.storage_key();
        op.seq = inner.next_seq;
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.failure = None;
        op.next_attempt_at = None;
        self.persist(&op).await?;
        inner.alloc_seq();
        if let Err(e) = self.store.delete(&old_key).await {
            tracing::warn!("[SyncQueue] could not remove dead letter {}: {}", id, e);
        }

        inner.dead.remove(index);
        let entity_key = op.entity_key.clone();
        inner.active.push(op);
        self.monitor.set_backlog(inner.active.len());
        drop(inner);

        tracing::info!("[SyncQueue] {} re-queued by caller", id);
        self.events.publish(SyncEvent::Queued {
            operation_id: id,
            entity_key,
        });
        self.wake.notify_one();
        Ok(())
    }

    /// Drop a dead-lettered operation for good
    pub async fn dismiss_failed(&self, id: Uuid) -> Result<SyncOperation> {
        let mut inner = self.inner.write().await;
        let index = inner
            .dead
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| CoreError::not_found(format!("failed operation {}", id)))?;
        self.store.delete(&inner.dead[index].storage_key()).await?;
        Ok(inner.dead.remove(index))
    }

    async fn persist(&self, op: &SyncOperation) -> Result<()> {
        self.store.store_json(&op.storage_key(), op, Ttl::Never).await
    }

    /// Drain on reconnect and whenever something is enqueued while online
    ///
    /// A backlog present while already connected is drained right away.
    pub fn spawn_auto_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut state_rx = queue.monitor.subscribe_state();
        tokio::spawn(async move {
            let mut last = *state_rx.borrow_and_update();
            let mut trigger = last.is_connected() && queue.pending_count().await > 0;
            loop {
                if trigger {
                    let report = queue.drain().await;
                    tracing::debug!("[SyncQueue] auto drain: {:?}", report);
                    if report.paused {
                        last = ConnectivityState::Offline;
                    }
                }

                trigger = tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = *state_rx.borrow_and_update();
                        let reconnected = !last.is_connected() && now.is_connected();
                        last = now;
                        reconnected
                    }
                    _ = queue.wake.notified() => queue.monitor.state().is_connected(),
                };
            }
        })
    }
}
