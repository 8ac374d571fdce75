//! # Loader Metrics
//!
//! Counters for the progressive loader.
//!
//! ## Features
//!
//! - **Cache Effectiveness**: hits versus fetches
//! - **Deduplication**: requests joined onto an existing load
//! - **Performance Metrics**: rolling average load time

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot of loader activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoaderStats {
    /// `add_item` calls
    pub total_requests: u64,
    /// Requests served from the local cache
    pub cache_hits: u64,
    /// Requests that had to be fetched
    pub cache_misses: u64,
    /// Requests joined onto a load already pending
    pub joined: u64,
    /// Successful fetches
    pub loaded: u64,
    /// Failed fetches, timeouts included
    pub failed: u64,
    /// Loads abandoned by `cancel_all`
    pub cancelled: u64,
    /// Rolling average of successful fetch time
    pub average_load_ms: u64,
    /// Fetches in flight when the snapshot was taken
    pub in_flight: usize,
    /// Items waiting for a slot when the snapshot was taken
    pub queued: usize,
}

impl LoaderStats {
    /// Share of requests served from cache
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Running counters kept under the loader lock
#[derive(Debug, Default)]
pub(crate) struct LoadCounters {
    pub(crate) total_requests: u64,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
    pub(crate) joined: u64,
    pub(crate) loaded: u64,
    pub(crate) failed: u64,
    pub(crate) cancelled: u64,
    average_load: Duration,
}

impl LoadCounters {
    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.loaded += 1;
        // Update rolling average
        let total = self.average_load * (self.loaded - 1) as u32 + elapsed;
        self.average_load = total / self.loaded as u32;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub(crate) fn snapshot(&self, in_flight: usize, queued: usize) -> LoaderStats {
        LoaderStats {
            total_requests: self.total_requests,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            joined: self.joined,
            loaded: self.loaded,
            failed: self.failed,
            cancelled: self.cancelled,
            average_load_ms: self.average_load.as_millis() as u64,
            in_flight,
            queued,
        }
    }
}
