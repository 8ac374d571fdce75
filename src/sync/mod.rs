//! # Sync Service
//!
//! Owns every component of the synchronization core and exposes the API the
//! caller layer talks to.
//!
//! ## Architecture
//!
//! The service coordinates:
//! - **Connectivity Monitor**: `Online`/`Offline`/`Syncing` state and network quality
//! - **Sync Queue**: durable replay of mutations with backoff
//! - **Optimistic Engine**: local-first application and reconciliation
//! - **Reactions**: chat reaction toggles
//! - **Progressive Loader**: adaptive resource fetching
//! - **Metrics**: drain performance
//!
//! ## Background Tasks
//!
//! [`SyncService::start`] spawns:
//! - the transport signal pump (connect, disconnect and server pushes)
//! - auto-drain, when `sync.auto_drain` is set
//! - the round-trip probe
//! - the expired-entry sweeper
//! - the follower settling optimistic mutations on sync outcomes
//! - loader re-admission on connectivity and quality changes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use xfsync::offline::NewOperation;
//! use xfsync::shared::config::CoreConfig;
//! use xfsync::sync::SyncService;
//!
//! # async fn example() -> xfsync::shared::error::Result<()> {
//! let config = CoreConfig::builder()
//!     .server_url("https://chat.example.com/api")
//!     .build()?;
//! let mut service = SyncService::open(config).await?;
//! service.start()?;
//!
//! let id = service
//!     .queue_for_sync(NewOperation::update("msg:42", serde_json::json!({"text": "edited"})))
//!     .await?;
//! println!("queued {}", id);
//!
//! let stats = service.get_stats().await?;
//! println!("{} pending", stats.sync_operations.pending);
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod network_monitor;
pub mod sync_state;

pub use metrics::DrainMetrics;
pub use network_monitor::{ConnectivityMonitor, NetworkQuality};
pub use sync_state::{ConnectivityEvent, ConnectivityState};

use crate::loader::{
    HttpFetcher, LoadHandle, LoadRequest, LoaderStats, Priority, ProgressiveLoader,
    ResourceFetcher,
};
use crate::local_db::{LocalStore, StoreUsage, StoredValue, Ttl};
use crate::offline::{
    DrainReport, NewOperation, OptimisticEngine, PendingKey, QueueStats, ReactionService,
    ServerState, SyncQueue,
};
use crate::shared::clock::SystemClock;
use crate::shared::config::CoreConfig;
use crate::shared::error::{CoreError, Result};
use crate::shared::event::{CoreEvents, SyncEvent};
use crate::transport::{HttpTransport, Transport, TransportSignal};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Key prefix for caller data, kept apart from queue and cache keys
const DATA_PREFIX: &str = "data/";

fn data_key(key: &str) -> String {
    format!("{}{}", DATA_PREFIX, key)
}

/// Snapshot returned by [`SyncService::get_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    /// Current connectivity state
    pub state: ConnectivityState,
    /// Current network quality
    pub quality: NetworkQuality,
    /// Total time spent offline, the current outage included
    pub offline_duration: Duration,
    /// Sync queue counters
    pub sync_operations: QueueStats,
    /// Local store usage
    pub data_stored_locally: StoreUsage,
    /// Last drain that delivered something
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Drain performance
    pub drains: DrainMetrics,
    /// Loader counters
    pub loader: LoaderStats,
    /// Optimistic mutations awaiting confirmation
    pub optimistic_pending: usize,
}

/// Main sync service coordinator
#[derive(Debug)]
pub struct SyncService {
    config: CoreConfig,
    store: LocalStore,
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<SyncQueue>,
    engine: Arc<OptimisticEngine>,
    reactions: Arc<ReactionService>,
    loader: ProgressiveLoader,
    events: CoreEvents,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncService {
    /// Assemble the core over injected collaborators
    ///
    /// Restores any operations persisted in `store`.
    pub async fn new(
        config: CoreConfig,
        store: LocalStore,
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let events = CoreEvents::default();
        let monitor = Arc::new(ConnectivityMonitor::new(
            config.connectivity.clone(),
            store.clock().clone(),
            events.state.clone(),
        ));
        let queue = Arc::new(
            SyncQueue::open(
                store.clone(),
                transport.clone(),
                monitor.clone(),
                events.sync.clone(),
                &config.sync,
            )
            .await?,
        );
        let engine = Arc::new(OptimisticEngine::new());
        let reactions = Arc::new(ReactionService::new(
            engine.clone(),
            queue.clone(),
            events.reactions.clone(),
        ));
        let loader = ProgressiveLoader::new(fetcher, store.clone(), monitor.clone(), &config.loader);

        tracing::info!("[SyncService] initialized");
        Ok(Self {
            config,
            store,
            transport,
            monitor,
            queue,
            engine,
            reactions,
            loader,
            events,
            tasks: Vec::new(),
        })
    }

    /// Production wiring: SQLite store, HTTP transport and HTTP fetcher
    pub async fn open(config: CoreConfig) -> Result<Self> {
        let server_url = config
            .server_url
            .clone()
            .ok_or_else(|| CoreError::config("server_url is required"))?;
        let store = LocalStore::open_sqlite(&config.store, Arc::new(SystemClock)).await?;
        let transport =
            HttpTransport::new(server_url).map_err(|e| CoreError::config(e.to_string()))?;
        Self::new(config, store, Arc::new(transport), Arc::new(HttpFetcher::new())).await
    }

    /// Start the background tasks
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(CoreError::config("sync service is already running"));
        }

        self.tasks.push(self.spawn_signal_pump());
        self.tasks.push(self.spawn_settle_follower());
        if self.config.sync.auto_drain {
            self.tasks.push(self.queue.spawn_auto_drain());
        }
        self.tasks.push(self.monitor.spawn_probe(self.transport.clone()));
        self.tasks
            .push(self.store.spawn_sweeper(self.config.store.sweep_interval()));
        self.tasks.push(self.loader.spawn_adaptation());

        tracing::info!("[SyncService] started {} background tasks", self.tasks.len());
        Ok(())
    }

    /// Stop the background tasks
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("[SyncService] stopped");
    }

    /// Whether background tasks are running
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    fn spawn_signal_pump(&self) -> JoinHandle<()> {
        let mut signals = self.transport.signals();
        let monitor = self.monitor.clone();
        let reactions = self.reactions.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(TransportSignal::Connected) => {
                        monitor.handle_connected();
                    }
                    Ok(TransportSignal::Disconnected) => {
                        monitor.handle_disconnected();
                    }
                    Ok(TransportSignal::Push { event, payload }) => {
                        if !reactions.handle_push(&event, &payload).await {
                            tracing::debug!("[SyncService] ignoring push '{}'", event);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("[SyncService] missed {} transport signals", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Confirm or roll back optimistic mutations as their operations settle
    ///
    /// Reads the queue's settlement feed rather than the event bus, so a burst
    /// of outcomes cannot strand a pending mutation.
    fn spawn_settle_follower(&self) -> JoinHandle<()> {
        let mut settlements = self.queue.settlements();
        let engine = self.engine.clone();
        let reactions = self.reactions.clone();
        tokio::spawn(async move {
            while let Some(event) = settlements.recv().await {
                reactions.handle_sync_event(&event).await;
                settle(&engine, &event).await;
            }
        })
    }

    // ---- Durable local store ----

    /// Persist caller data under `key`
    pub async fn store_local_data(
        &self,
        key: &str,
        value: impl Into<StoredValue>,
        ttl: Ttl,
    ) -> Result<()> {
        self.store.store(&data_key(key), value, ttl).await
    }

    /// Read caller data; expired entries read as `None`
    pub async fn get_local_data(&self, key: &str) -> Result<Option<StoredValue>> {
        self.store.get(&data_key(key)).await
    }

    /// Remove caller data
    pub async fn delete_local_data(&self, key: &str) -> Result<()> {
        self.store.delete(&data_key(key)).await
    }

    // ---- Sync queue ----

    /// Durably queue a mutation for delivery
    pub async fn queue_for_sync(&self, operation: NewOperation) -> Result<Uuid> {
        self.queue.enqueue(operation).await
    }

    /// Deliver pending operations now
    pub async fn sync_pending_data(&self) -> DrainReport {
        self.queue.drain().await
    }

    /// Counters across the core
    pub async fn get_stats(&self) -> Result<CoreStats> {
        Ok(CoreStats {
            state: self.monitor.state(),
            quality: self.monitor.quality(),
            offline_duration: self.monitor.offline_duration(),
            sync_operations: self.queue.stats().await,
            data_stored_locally: self.store.usage().await?,
            last_sync_time: self.store.last_sync_time().await?,
            drains: self.queue.drain_metrics(),
            loader: self.loader.stats(),
            optimistic_pending: self.engine.pending_count().await,
        })
    }

    // ---- Progressive loader ----

    /// Request a resource
    pub async fn add_item(&self, request: LoadRequest, priority: Priority) -> LoadHandle {
        self.loader.add_item(request, priority).await
    }

    /// Whether the item finished loading
    pub fn is_item_loaded(&self, item_id: &str) -> bool {
        self.loader.is_loaded(item_id)
    }

    /// Whether a fetch for the item is in flight
    pub fn is_item_loading(&self, item_id: &str) -> bool {
        self.loader.is_loading(item_id)
    }

    /// Cached bytes of a loaded item; `None` once the cache entry expired
    pub async fn get_item_data(&self, item_id: &str) -> Result<Option<Bytes>> {
        self.loader.get_item_data(item_id).await
    }

    // ---- Optimistic updates ----

    /// Apply `mutation` locally and queue `operation` to carry it
    ///
    /// The pending mutation is confirmed when the operation is delivered and
    /// rolled back when it is dead-lettered. It is linked to the operation id
    /// before the operation is queued. Duplicates of a pending
    /// `(entity, actor, kind)` fail with `AlreadyPending` and queue nothing.
    pub async fn apply_optimistic<F>(
        &self,
        entity_id: &str,
        actor_id: &str,
        kind: &str,
        mutation: F,
        operation: NewOperation,
    ) -> Result<PendingKey>
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let key = self
            .engine
            .apply_optimistic(entity_id, actor_id, kind, mutation)
            .await?;
        let operation_id = operation.id.unwrap_or_else(Uuid::new_v4);
        self.engine.attach_operation(&key, operation_id).await;
        match self.queue.enqueue(operation.with_id(operation_id)).await {
            Ok(_) => Ok(key),
            Err(e) => {
                self.engine.reject(&key).await;
                Err(e)
            }
        }
    }

    /// Apply authoritative state; the server wins over pending mutations
    pub async fn reconcile(&self, entity_id: &str, value: Value, revision: Option<u64>) -> Value {
        self.engine
            .reconcile(entity_id, ServerState::new(value, revision))
            .await
    }

    /// Local view of an entity
    pub async fn local_version(&self, entity_id: &str) -> Option<Value> {
        self.engine.local_version(entity_id).await
    }

    // ---- Accessors ----

    /// Reaction toggles
    pub fn reactions(&self) -> &Arc<ReactionService> {
        &self.reactions
    }

    /// Event buses
    pub fn events(&self) -> &CoreEvents {
        &self.events
    }

    /// Connectivity monitor
    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Sync queue
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Progressive loader
    pub fn loader(&self) -> &ProgressiveLoader {
        &self.loader
    }

    /// Local store
    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}

async fn settle(engine: &OptimisticEngine, event: &SyncEvent) {
    let (operation_id, delivered) = match event {
        SyncEvent::Completed { operation_id, .. } => (*operation_id, true),
        SyncEvent::Failed { operation_id, .. } => (*operation_id, false),
        _ => return,
    };
    let Some((entity, key)) = engine.find_by_operation(operation_id).await else {
        return;
    };
    if delivered {
        engine.confirm(&key, None).await;
    } else {
        tracing::info!("[SyncService] rolling back {} on {}", key.as_str(), entity);
        engine.reject(&key).await;
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
