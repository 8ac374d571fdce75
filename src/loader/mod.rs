//! # Progressive Loader
//!
//! Priority-tiered, concurrency-bounded loading of remote resources
//! (media, pagination pages) with a durable cache.
//!
//! ## Architecture
//!
//! - **Scheduler**: four strict priority tiers feeding a bounded in-flight set
//! - **Fetcher**: pluggable [`ResourceFetcher`], reqwest by default
//! - **Cache**: completed items land in the [`LocalStore`] under `resource/`
//!   with a TTL; later requests are served from there without a fetch
//! - **Adaptation**: effective concurrency and timeout follow the
//!   connectivity monitor's quality classification
//!
//! ## Key Components
//!
//! - `scheduler.rs`: priorities, item lifecycle, adaptive limits
//! - `fetcher.rs`: the fetch seam and its HTTP implementation
//! - `stats.rs`: cache and performance counters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xfsync::loader::{HttpFetcher, LoadRequest, Priority, ProgressiveLoader};
//! # use xfsync::local_db::LocalStore;
//! # use xfsync::sync::network_monitor::ConnectivityMonitor;
//! # use xfsync::shared::config::LoaderConfig;
//!
//! # async fn example(store: LocalStore, monitor: Arc<ConnectivityMonitor>) -> xfsync::shared::error::Result<()> {
//! let loader = ProgressiveLoader::new(
//!     Arc::new(HttpFetcher::new()),
//!     store,
//!     monitor,
//!     &LoaderConfig::default(),
//! );
//! let avatar = loader
//!     .add_item(LoadRequest::new("avatar:7", "https://cdn.example.com/a/7.png"), Priority::Critical)
//!     .await
//!     .await?;
//! println!("{} bytes, cached: {}", avatar.data.len(), avatar.from_cache);
//! # Ok(())
//! # }
//! ```

pub mod fetcher;
pub mod scheduler;
pub mod stats;

pub use fetcher::{HttpFetcher, LoadRequest, ResourceFetcher};
pub use scheduler::{EffectiveLimits, LoadItem, LoadState, LoaderLimits, Priority};
pub use stats::LoaderStats;

use crate::local_db::{LocalStore, Ttl};
use crate::shared::config::LoaderConfig;
use crate::shared::error::{CoreError, Result};
use crate::sync::network_monitor::ConnectivityMonitor;
use bytes::Bytes;
use scheduler::TierQueue;
use stats::LoadCounters;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Key prefix for cached resources
const CACHE_PREFIX: &str = "resource/";

/// Transfers smaller than this say little about bandwidth
const THROUGHPUT_SAMPLE_MIN_BYTES: usize = 16 * 1024;

fn cache_key(item_id: &str) -> String {
    format!("{}{}", CACHE_PREFIX, item_id)
}

/// A finished load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    /// Resource identity
    pub item_id: String,
    /// Resource bytes
    pub data: Bytes,
    /// Served from the cache
    pub from_cache: bool,
    /// Fetch duration; zero for cache hits
    pub load_time_ms: u64,
}

type Waiter = oneshot::Sender<Result<LoadOutcome>>;

/// Resolves when the item loads, fails or is cancelled
///
/// After [`ProgressiveLoader::cancel_all`] the handle resolves to
/// [`CoreError::Cancelled`].
#[derive(Debug)]
pub struct LoadHandle {
    rx: oneshot::Receiver<Result<LoadOutcome>>,
}

impl Future for LoadHandle {
    type Output = Result<LoadOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(CoreError::Cancelled)))
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    limits: Option<LoaderLimits>,
    items: HashMap<String, LoadItem>,
    queue: TierQueue,
    requests: HashMap<String, LoadRequest>,
    waiters: HashMap<String, Vec<Waiter>>,
    in_flight: HashMap<String, JoinHandle<()>>,
    counters: LoadCounters,
    generation: u64,
}

#[derive(Debug)]
struct LoaderShared {
    fetcher: Arc<dyn ResourceFetcher>,
    store: LocalStore,
    monitor: Arc<ConnectivityMonitor>,
    cache_ttl: Duration,
    state: Mutex<LoaderState>,
}

/// Progressive resource loader
#[derive(Debug, Clone)]
pub struct ProgressiveLoader {
    shared: Arc<LoaderShared>,
}

impl ProgressiveLoader {
    /// Create a loader using the `[loader]` config section
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        store: LocalStore,
        monitor: Arc<ConnectivityMonitor>,
        config: &LoaderConfig,
    ) -> Self {
        let state = LoaderState {
            limits: Some(LoaderLimits::from_config(config)),
            ..Default::default()
        };
        Self {
            shared: Arc::new(LoaderShared {
                fetcher,
                store,
                monitor,
                cache_ttl: Duration::from_secs(config.cache_ttl_secs),
                state: Mutex::new(state),
            }),
        }
    }

    /// Request a resource
    ///
    /// Cached resources resolve immediately with `from_cache`. A request for
    /// an item that is already queued or loading joins it instead of issuing
    /// a second fetch, raising its priority if the new one is higher.
    pub async fn add_item(&self, request: LoadRequest, priority: Priority) -> LoadHandle {
        let (tx, rx) = oneshot::channel();
        let handle = LoadHandle { rx };

        let tx = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.counters.total_requests += 1;
            match state.join(&request.item_id, priority, tx) {
                Ok(()) => return handle,
                Err(tx) => tx,
            }
        };
        self.lookup_then_queue(request, priority, tx, handle).await
    }

    async fn lookup_then_queue(
        &self,
        request: LoadRequest,
        priority: Priority,
        tx: Waiter,
        handle: LoadHandle,
    ) -> LoadHandle {
        let generation = self.shared.lock().generation;
        let cached = self.shared.read_cache(&request.item_id).await;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.generation != generation {
            // cancel_all ran while we were reading the cache
            state.counters.cancelled += 1;
            return handle;
        }

        if let Some(data) = cached {
            state.counters.cache_hits += 1;
            let now = self.shared.store.clock().now();
            let item = state
                .items
                .entry(request.item_id.clone())
                .or_insert_with(|| new_item(&request, priority));
            item.state = LoadState::Loaded;
            item.from_cache = true;
            item.loaded_at = Some(now);
            item.load_time_ms = Some(0);
            item.last_error = None;
            tracing::debug!("[Loader] cache hit for '{}'", request.item_id);
            let _ = tx.send(Ok(LoadOutcome {
                item_id: request.item_id,
                data,
                from_cache: true,
                load_time_ms: 0,
            }));
            return handle;
        }

        let tx = match state.join(&request.item_id, priority, tx) {
            Ok(()) => return handle,
            Err(tx) => tx,
        };

        state.counters.cache_misses += 1;
        let item_id = request.item_id.clone();
        state.items.insert(item_id.clone(), new_item(&request, priority));
        state.waiters.insert(item_id.clone(), vec![tx]);
        state.requests.insert(item_id.clone(), request);
        state.queue.push(priority, item_id.clone());
        tracing::debug!("[Loader] queued '{}' at {:?}", item_id, priority);
        drop(guard);

        self.shared.pump();
        handle
    }

    /// Callback form of [`add_item`](Self::add_item)
    ///
    /// The callback runs once with the outcome. It is never invoked for
    /// loads abandoned by [`cancel_all`](Self::cancel_all).
    pub async fn add_item_with<F>(&self, request: LoadRequest, priority: Priority, on_complete: F)
    where
        F: FnOnce(Result<LoadOutcome>) + Send + 'static,
    {
        let handle = self.add_item(request, priority).await;
        tokio::spawn(async move {
            if let Ok(outcome) = handle.rx.await {
                on_complete(outcome);
            }
        });
    }

    /// Re-add a failed item; there is no automatic retry
    pub async fn retry(&self, item_id: &str) -> Result<LoadHandle> {
        let (request, priority) = {
            let state = self.shared.lock();
            let item = state
                .items
                .get(item_id)
                .ok_or_else(|| CoreError::not_found(format!("load item '{}'", item_id)))?;
            if item.state != LoadState::Failed {
                return Err(CoreError::InvalidTransition {
                    from: format!("{:?}", item.state).to_lowercase(),
                    event: "retry".to_string(),
                });
            }
            (LoadRequest::new(item_id, item.source.clone()), item.priority)
        };
        Ok(self.add_item(request, priority).await)
    }

    /// Abandon every queued and in-flight load
    ///
    /// Returns the number of abandoned items. Their handles resolve to
    /// `Cancelled` and their callbacks are dropped uncalled.
    pub fn cancel_all(&self) -> usize {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.generation += 1;
        for (_, task) in state.in_flight.drain() {
            task.abort();
        }
        state.queue.clear();
        state.requests.clear();
        let abandoned = state.waiters.len();
        state.waiters.clear();
        state
            .items
            .retain(|_, item| !matches!(item.state, LoadState::Queued | LoadState::Loading));
        state.counters.cancelled += abandoned as u64;
        tracing::info!("[Loader] cancelled {} loads", abandoned);
        abandoned
    }

    /// Whether the item finished loading
    pub fn is_loaded(&self, item_id: &str) -> bool {
        self.state(item_id) == Some(LoadState::Loaded)
    }

    /// Whether a fetch for the item is in flight
    pub fn is_loading(&self, item_id: &str) -> bool {
        self.state(item_id) == Some(LoadState::Loading)
    }

    /// Lifecycle state of a tracked item
    pub fn state(&self, item_id: &str) -> Option<LoadState> {
        self.shared.lock().items.get(item_id).map(|item| item.state)
    }

    /// Snapshot of a tracked item
    pub fn item(&self, item_id: &str) -> Option<LoadItem> {
        self.shared.lock().items.get(item_id).cloned()
    }

    /// Cached bytes of an item, if still within its TTL
    pub async fn get_item_data(&self, item_id: &str) -> Result<Option<Bytes>> {
        match self.shared.store.get(&cache_key(item_id)).await? {
            Some(value) => Ok(Some(value.into_bytes()?)),
            None => Ok(None),
        }
    }

    /// Replace the configured limits and admit under the new budget
    pub fn update_limits(&self, limits: LoaderLimits) {
        self.shared.lock().limits = Some(limits);
        tracing::info!(
            "[Loader] limits updated: max_concurrent={} timeout={:?} adaptive={}",
            limits.max_concurrent,
            limits.timeout,
            limits.adaptive_loading
        );
        self.shared.pump();
    }

    /// Limits in force for the current network quality
    pub fn effective_limits(&self) -> EffectiveLimits {
        self.shared.effective_limits()
    }

    /// Counter snapshot
    pub fn stats(&self) -> LoaderStats {
        let state = self.shared.lock();
        state
            .counters
            .snapshot(state.in_flight.len(), state.queue.len())
    }

    /// Re-admit whenever connectivity or network quality changes
    pub fn spawn_adaptation(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut state_rx = shared.monitor.subscribe_state();
        let mut quality_rx = shared.monitor.subscribe_quality();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = quality_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                shared.pump();
            }
        })
    }
}

fn new_item(request: &LoadRequest, priority: Priority) -> LoadItem {
    LoadItem {
        item_id: request.item_id.clone(),
        source: request.source.clone(),
        priority,
        state: LoadState::Queued,
        loaded_at: None,
        load_time_ms: None,
        from_cache: false,
        last_error: None,
    }
}

impl LoaderState {
    /// Attach a waiter to a pending load; hands the waiter back when nothing
    /// for this item is pending
    fn join(&mut self, item_id: &str, priority: Priority, tx: Waiter) -> std::result::Result<(), Waiter> {
        let Some(waiters) = self.waiters.get_mut(item_id) else {
            return Err(tx);
        };
        waiters.push(tx);
        self.counters.joined += 1;
        if let Some(item) = self.items.get_mut(item_id) {
            if priority.outranks(item.priority) {
                item.priority = priority;
                self.queue.raise(item_id, priority);
            }
        }
        tracing::debug!("[Loader] joined pending load of '{}'", item_id);
        Ok(())
    }
}

impl LoaderShared {
    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective_limits(&self) -> EffectiveLimits {
        let limits = self.lock().limits.unwrap_or_default();
        limits.effective(self.monitor.quality())
    }

    async fn read_cache(&self, item_id: &str) -> Option<Bytes> {
        match self.store.get(&cache_key(item_id)).await {
            Ok(Some(value)) => match value.into_bytes() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!("[Loader] unreadable cache entry for '{}': {}", item_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("[Loader] cache lookup for '{}' failed: {}", item_id, e);
                None
            }
        }
    }

    /// Admit queued items up to the effective concurrency
    ///
    /// Nothing is admitted while offline; cache hits are served without
    /// admission.
    fn pump(self: &Arc<Self>) {
        if !self.monitor.state().is_connected() {
            return;
        }
        let limits = self.effective_limits();

        let mut guard = self.lock();
        let state = &mut *guard;
        while state.in_flight.len() < limits.max_concurrent {
            let Some((_, item_id)) = state.queue.pop() else {
                break;
            };
            let Some(request) = state.requests.get(&item_id).cloned() else {
                continue;
            };
            if let Some(item) = state.items.get_mut(&item_id) {
                item.state = LoadState::Loading;
            }
            let generation = state.generation;
            let shared = Arc::clone(self);
            let task = tokio::spawn(async move {
                shared.run_fetch(request, generation, limits.timeout).await;
            });
            state.in_flight.insert(item_id, task);
        }
    }

    async fn run_fetch(self: Arc<Self>, request: LoadRequest, generation: u64, timeout: Duration) {
        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(timeout, self.fetcher.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout { after: timeout }),
        };
        let elapsed = started.elapsed();

        if let Ok(data) = &result {
            if data.len() >= THROUGHPUT_SAMPLE_MIN_BYTES {
                self.monitor.record_throughput(data.len() as u64, elapsed);
            }
            let key = cache_key(&request.item_id);
            if let Err(e) = self
                .store
                .store(&key, data.clone(), Ttl::After(self.cache_ttl))
                .await
            {
                tracing::warn!("[Loader] not caching '{}': {}", request.item_id, e);
            }
        }

        self.complete(&request.item_id, generation, result, elapsed);
        self.pump();
    }

    fn complete(&self, item_id: &str, generation: u64, result: Result<Bytes>, elapsed: Duration) {
        let now = self.store.clock().now();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.generation != generation {
            return;
        }
        state.in_flight.remove(item_id);
        state.requests.remove(item_id);
        let waiters = state.waiters.remove(item_id).unwrap_or_default();
        let load_time_ms = elapsed.as_millis() as u64;

        let outcome = match result {
            Ok(data) => {
                state.counters.record_success(elapsed);
                if let Some(item) = state.items.get_mut(item_id) {
                    item.state = LoadState::Loaded;
                    item.loaded_at = Some(now);
                    item.load_time_ms = Some(load_time_ms);
                    item.from_cache = false;
                    item.last_error = None;
                }
                tracing::debug!("[Loader] loaded '{}' in {}ms", item_id, load_time_ms);
                Ok(LoadOutcome {
                    item_id: item_id.to_string(),
                    data,
                    from_cache: false,
                    load_time_ms,
                })
            }
            Err(e) => {
                state.counters.record_failure();
                if let Some(item) = state.items.get_mut(item_id) {
                    item.state = LoadState::Failed;
                    item.load_time_ms = Some(load_time_ms);
                    item.last_error = Some(e.to_string());
                }
                tracing::warn!("[Loader] '{}' failed: {}", item_id, e);
                Err(e)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
