//! # Network Monitor
//!
//! Tracks connectivity transitions and classifies network quality for
//! adaptive syncing and loading.
//!
//! ## Features
//!
//! - **Connectivity Detection**: transport signals and periodic probes drive
//!   the [`ConnectivityState`] machine
//! - **Network Quality**: rolling window of round-trip times and throughput
//!   samples classified as slow, normal or fast
//! - **Snapshots**: state and quality are published through `watch` channels,
//!   transitions also go on the `state_changed` event bus
//! - **Offline Accounting**: total time spent offline
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use xfsync::shared::{clock::SystemClock, config::ConnectivityConfig, event::CoreEvents};
//! use xfsync::sync::network_monitor::ConnectivityMonitor;
//!
//! let events = CoreEvents::default();
//! let monitor = ConnectivityMonitor::new(
//!     ConnectivityConfig::default(),
//!     Arc::new(SystemClock),
//!     events.state.clone(),
//! );
//! monitor.handle_connected();
//! println!("now {}", monitor.state());
//! ```

use super::sync_state::{ConnectivityEvent, ConnectivityState};
use crate::shared::clock::SharedClock;
use crate::shared::config::ConnectivityConfig;
use crate::shared::error::Result;
use crate::shared::event::{EventBus, StateChanged};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Network quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// High latency or low throughput
    Slow,
    /// Neither slow nor fast
    Normal,
    /// Low latency
    Fast,
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkQuality::Slow => "slow",
            NetworkQuality::Normal => "normal",
            NetworkQuality::Fast => "fast",
        })
    }
}

#[derive(Debug)]
struct MonitorInner {
    rtt_samples: VecDeque<Duration>,
    throughput_samples: VecDeque<f64>,
    backlog: usize,
    offline_since: Option<DateTime<Utc>>,
    total_offline: Duration,
    consecutive_probe_failures: u32,
}

/// Connectivity state and quality tracker
#[derive(Debug)]
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    clock: SharedClock,
    events: EventBus<StateChanged>,
    state_tx: watch::Sender<ConnectivityState>,
    quality_tx: watch::Sender<NetworkQuality>,
    inner: Mutex<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor; it starts `Offline` until the transport reports in
    pub fn new(config: ConnectivityConfig, clock: SharedClock, events: EventBus<StateChanged>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            events,
            state_tx: watch::channel(ConnectivityState::Offline).0,
            quality_tx: watch::channel(NetworkQuality::Normal).0,
            inner: Mutex::new(MonitorInner {
                rtt_samples: VecDeque::new(),
                throughput_samples: VecDeque::new(),
                backlog: 0,
                offline_since: Some(now),
                total_offline: Duration::ZERO,
                consecutive_probe_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state snapshot
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Current quality snapshot
    pub fn quality(&self) -> NetworkQuality {
        *self.quality_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Watch quality changes
    pub fn subscribe_quality(&self) -> watch::Receiver<NetworkQuality> {
        self.quality_tx.subscribe()
    }

    /// Apply a state machine event
    ///
    /// Undefined transitions are rejected and leave the state untouched.
    pub fn apply(&self, event: ConnectivityEvent) -> Result<ConnectivityState> {
        let mut inner = self.lock();
        self.apply_locked(&mut inner, event)
    }

    fn apply_locked(
        &self,
        inner: &mut MonitorInner,
        event: ConnectivityEvent,
    ) -> Result<ConnectivityState> {
        let previous = self.state();
        let current = previous.on(event)?;
        let now = self.clock.now();

        match (previous.is_connected(), current.is_connected()) {
            (true, false) => inner.offline_since = Some(now),
            (false, true) => {
                if let Some(since) = inner.offline_since.take() {
                    inner.total_offline += (now - since).to_std().unwrap_or_default();
                }
            }
            _ => {}
        }

        self.state_tx.send_replace(current);
        tracing::info!("[Connectivity] {} -> {} on {}", previous, current, event);
        self.events.publish(StateChanged {
            previous,
            current,
            at: now,
        });
        Ok(current)
    }

    /// Apply `event` only if the machine is currently in `expected`
    fn apply_if(&self, expected: ConnectivityState, event: ConnectivityEvent) -> bool {
        let mut inner = self.lock();
        if self.state() != expected {
            return false;
        }
        self.apply_locked(&mut inner, event).is_ok()
    }

    /// Transport reported connected; no-op if already connected
    pub fn handle_connected(&self) -> ConnectivityState {
        let mut inner = self.lock();
        inner.consecutive_probe_failures = 0;
        if self.state() == ConnectivityState::Offline {
            let backlog = inner.backlog;
            if let Err(e) = self.apply_locked(&mut inner, ConnectivityEvent::Connected { backlog }) {
                tracing::warn!("[Connectivity] {}", e);
            }
        }
        self.state()
    }

    /// Transport reported disconnected; no-op if already offline
    pub fn handle_disconnected(&self) -> ConnectivityState {
        let mut inner = self.lock();
        if self.state().is_connected() {
            if let Err(e) = self.apply_locked(&mut inner, ConnectivityEvent::Disconnected) {
                tracing::warn!("[Connectivity] {}", e);
            }
        }
        self.state()
    }

    /// Sync queue began a drain. Moves `Online` to `Syncing`.
    pub fn begin_drain(&self) -> bool {
        self.apply_if(ConnectivityState::Online, ConnectivityEvent::DrainStarted)
    }

    /// Sync queue finished a drain. Moves `Syncing` to `Online`.
    pub fn finish_drain(&self) -> bool {
        self.apply_if(ConnectivityState::Syncing, ConnectivityEvent::DrainFinished)
    }

    /// Record the sync backlog used when choosing the post-connect state
    pub fn set_backlog(&self, backlog: usize) {
        self.lock().backlog = backlog;
    }

    /// Last recorded sync backlog
    pub fn backlog(&self) -> usize {
        self.lock().backlog
    }

    /// Add a round-trip sample
    pub fn record_rtt(&self, rtt: Duration) {
        let mut inner = self.lock();
        push_bounded(&mut inner.rtt_samples, rtt, self.config.rtt_window);
        self.reclassify(&inner);
    }

    /// Add a throughput sample from a completed transfer
    pub fn record_throughput(&self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        let bps = bytes as f64 / elapsed.as_secs_f64();
        let mut inner = self.lock();
        push_bounded(&mut inner.throughput_samples, bps, self.config.rtt_window);
        self.reclassify(&inner);
    }

    /// Mean of the RTT window
    pub fn average_rtt(&self) -> Option<Duration> {
        average_duration(&self.lock().rtt_samples)
    }

    fn reclassify(&self, inner: &MonitorInner) {
        let quality = self.classify(inner);
        let changed = self.quality_tx.send_if_modified(|current| {
            if *current != quality {
                *current = quality;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("[Connectivity] network quality now {}", quality);
        }
    }

    fn classify(&self, inner: &MonitorInner) -> NetworkQuality {
        if !inner.throughput_samples.is_empty() {
            let mean = inner.throughput_samples.iter().sum::<f64>()
                / inner.throughput_samples.len() as f64;
            if mean < self.config.slow_throughput_bps as f64 {
                return NetworkQuality::Slow;
            }
        }

        match average_duration(&inner.rtt_samples) {
            Some(avg) if avg > Duration::from_millis(self.config.slow_rtt_ms) => NetworkQuality::Slow,
            Some(avg) if avg < Duration::from_millis(self.config.fast_rtt_ms) => NetworkQuality::Fast,
            _ => NetworkQuality::Normal,
        }
    }

    /// Successful probe: record the RTT and treat the channel as up
    pub fn record_probe_success(&self, rtt: Duration) {
        self.record_rtt(rtt);
        self.handle_connected();
    }

    /// Failed probe; enough consecutive failures count as a disconnect
    pub fn record_probe_failure(&self) {
        let failures = {
            let mut inner = self.lock();
            inner.consecutive_probe_failures += 1;
            inner.consecutive_probe_failures
        };
        tracing::debug!("[Connectivity] probe failed ({} in a row)", failures);
        if failures >= self.config.probe_failure_threshold {
            self.handle_disconnected();
        }
    }

    /// Total time spent offline, including the current outage
    pub fn offline_duration(&self) -> Duration {
        let inner = self.lock();
        let current = inner
            .offline_since
            .and_then(|since| (self.clock.now() - since).to_std().ok())
            .unwrap_or_default();
        inner.total_offline + current
    }

    /// Periodically ping the transport
    pub fn spawn_probe(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = Duration::from_secs(self.config.probe_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match transport.ping().await {
                    Ok(rtt) => monitor.record_probe_success(rtt),
                    Err(e) => {
                        tracing::debug!("[Connectivity] probe error: {}", e);
                        monitor.record_probe_failure();
                    }
                }
            }
        })
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, sample: T, capacity: usize) {
    window.push_back(sample);
    while window.len() > capacity.max(1) {
        window.pop_front();
    }
}

fn average_duration(samples: &VecDeque<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}
