//! Test doubles
//!
//! In-process stand-ins for the remote authority and the resource CDN. Used
//! by the unit tests, the integration tests and the `xfsync-sim` binary.
//! Compiled only for tests or with the `test-utils` feature.

use crate::loader::fetcher::{LoadRequest, ResourceFetcher};
use crate::shared::error::{Result, TransportError};
use crate::transport::{SyncRequest, SyncResponse, Transport, TransportSignal};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub use crate::shared::clock::ManualClock;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SendHook = Box<dyn Fn(&SyncRequest) + Send + Sync>;

#[derive(Default)]
struct TransportScript {
    outcomes: VecDeque<std::result::Result<SyncResponse, TransportError>>,
    sent: Vec<(Instant, SyncRequest)>,
    ping: Option<std::result::Result<Duration, TransportError>>,
    send_delay: Duration,
    on_send: Option<SendHook>,
}

/// Scripted [`Transport`]
///
/// Every `send` is recorded. Outcomes queued with
/// [`push_outcome`](Self::push_outcome) are consumed in order; once they run
/// out, requests succeed and echo their payload.
pub struct FakeTransport {
    script: Mutex<TransportScript>,
    signals: broadcast::Sender<TransportSignal>,
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let script = lock(&self.script);
        f.debug_struct("FakeTransport")
            .field("queued_outcomes", &script.outcomes.len())
            .field("sent", &script.sent.len())
            .finish()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(TransportScript::default()),
            signals: broadcast::channel(64).0,
        }
    }

    /// Queue the outcome of the next unscripted `send`
    pub fn push_outcome(&self, outcome: std::result::Result<SyncResponse, TransportError>) {
        lock(&self.script).outcomes.push_back(outcome);
    }

    /// Every request received so far, failed attempts included
    pub fn sent(&self) -> Vec<SyncRequest> {
        lock(&self.script).sent.iter().map(|(_, r)| r.clone()).collect()
    }

    /// When each request arrived
    pub fn sent_at(&self) -> Vec<Instant> {
        lock(&self.script).sent.iter().map(|(at, _)| *at).collect()
    }

    /// Hold every `send` for `delay` before answering
    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.script).send_delay = delay;
    }

    /// Run `hook` as each request arrives, before it is answered
    pub fn set_on_send(&self, hook: impl Fn(&SyncRequest) + Send + Sync + 'static) {
        lock(&self.script).on_send = Some(Box::new(hook));
    }

    /// Answer for `ping`; unset pings take 100ms
    pub fn set_ping(&self, outcome: std::result::Result<Duration, TransportError>) {
        lock(&self.script).ping = Some(outcome);
    }

    /// Emit a `Connected` signal
    pub fn connect(&self) {
        let _ = self.signals.send(TransportSignal::Connected);
    }

    /// Emit a `Disconnected` signal
    pub fn disconnect(&self) {
        let _ = self.signals.send(TransportSignal::Disconnected);
    }

    /// Emit a server push
    pub fn push(&self, event: impl Into<String>, payload: serde_json::Value) {
        let _ = self.signals.send(TransportSignal::Push {
            event: event.into(),
            payload,
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: SyncRequest) -> std::result::Result<SyncResponse, TransportError> {
        let delay = {
            let mut script = lock(&self.script);
            script.sent.push((Instant::now(), request.clone()));
            if let Some(hook) = &script.on_send {
                hook(&request);
            }
            script.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.script).outcomes.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SyncResponse {
                payload: request.payload,
                revision: None,
            })
        })
    }

    async fn ping(&self) -> std::result::Result<Duration, TransportError> {
        lock(&self.script)
            .ping
            .clone()
            .unwrap_or(Ok(Duration::from_millis(100)))
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}

#[derive(Debug, Default)]
struct FetchScript {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    results: HashMap<String, Result<Bytes>>,
    order: Vec<String>,
}

/// Scripted [`ResourceFetcher`]
///
/// Answers with the item id as bytes unless a result is scripted, and tracks
/// how many fetches run at once.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    script: Mutex<FetchScript>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay for one item
    pub fn set_delay(&self, item_id: &str, delay: Duration) {
        lock(&self.script).delays.insert(item_id.to_string(), delay);
    }

    /// Delay for items without their own
    pub fn set_default_delay(&self, delay: Duration) {
        lock(&self.script).default_delay = delay;
    }

    /// Fixed answer for one item, until cleared
    pub fn set_result(&self, item_id: &str, result: Result<Bytes>) {
        lock(&self.script).results.insert(item_id.to_string(), result);
    }

    pub fn clear_result(&self, item_id: &str) {
        lock(&self.script).results.remove(item_id);
    }

    /// Fetches started so far
    pub fn fetch_count(&self) -> usize {
        lock(&self.script).order.len()
    }

    /// Item ids in the order their fetches started
    pub fn fetch_order(&self) -> Vec<String> {
        lock(&self.script).order.clone()
    }

    /// Fetches running right now
    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Most fetches ever running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for ScriptedFetcher {
    async fn fetch(&self, request: &LoadRequest) -> Result<Bytes> {
        let (delay, scripted) = {
            let mut script = lock(&self.script);
            script.order.push(request.item_id.clone());
            let delay = script
                .delays
                .get(&request.item_id)
                .copied()
                .unwrap_or(script.default_delay);
            (delay, script.results.get(&request.item_id).cloned())
        };

        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.current);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        scripted.unwrap_or_else(|| Ok(Bytes::from(request.item_id.clone().into_bytes())))
    }
}
