//! # Load Scheduler
//!
//! Priority tiers and adaptive limits for the progressive loader.
//!
//! ## Features
//!
//! - **Priority Queues**: four strict tiers; a lower tier is only served when
//!   every higher tier is empty
//! - **Bandwidth Optimization**: concurrency and per-item timeout follow the
//!   measured network quality when adaptive loading is on

use crate::shared::config::LoaderConfig;
use crate::sync::network_monitor::NetworkQuality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Load priority, highest first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Visible right now
    Critical,
    /// About to become visible
    High,
    /// Default
    #[default]
    Medium,
    /// Prefetch
    Low,
}

impl Priority {
    /// Every tier, highest first
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    fn tier(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// Whether `self` is served before `other`
    pub fn outranks(self, other: Priority) -> bool {
        self.tier() < other.tier()
    }
}

/// Lifecycle of a load item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// Waiting for a concurrency slot
    Queued,
    /// Fetch in progress
    Loading,
    /// Fetched or served from cache
    Loaded,
    /// Fetch failed; retried only on request
    Failed,
}

/// Tracked resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadItem {
    /// Resource identity
    pub item_id: String,
    /// Where it is fetched from
    pub source: String,
    /// Current priority
    pub priority: Priority,
    /// Current state
    pub state: LoadState,
    /// When it finished loading
    pub loaded_at: Option<DateTime<Utc>>,
    /// Fetch duration
    pub load_time_ms: Option<u64>,
    /// Served from the cache instead of fetched
    pub from_cache: bool,
    /// Error of the last failed fetch
    pub last_error: Option<String>,
}

/// Configured loader limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderLimits {
    /// Loads in flight on a normal network
    pub max_concurrent: usize,
    /// Per-item budget on a normal network
    pub timeout: Duration,
    /// Scale with network quality
    pub adaptive_loading: bool,
}

/// Limits in force for the current network quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    /// Loads allowed in flight
    pub max_concurrent: usize,
    /// Budget per item
    pub timeout: Duration,
}

impl LoaderLimits {
    /// Build from the `[loader]` config section
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            timeout: Duration::from_millis(config.timeout_ms),
            adaptive_loading: config.adaptive_loading,
        }
    }

    /// Scale the limits for `quality`
    ///
    /// Slow networks get half the concurrency (at least one) and twice the
    /// timeout. Fast networks get half again as much concurrency.
    pub fn effective(&self, quality: NetworkQuality) -> EffectiveLimits {
        let n = self.max_concurrent.max(1);
        if !self.adaptive_loading {
            return EffectiveLimits {
                max_concurrent: n,
                timeout: self.timeout,
            };
        }
        match quality {
            NetworkQuality::Slow => EffectiveLimits {
                max_concurrent: (n / 2).max(1),
                timeout: self.timeout * 2,
            },
            NetworkQuality::Normal => EffectiveLimits {
                max_concurrent: n,
                timeout: self.timeout,
            },
            NetworkQuality::Fast => EffectiveLimits {
                max_concurrent: n + n / 2,
                timeout: self.timeout,
            },
        }
    }
}

impl Default for LoaderLimits {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

/// Four FIFO tiers served in strict priority order
#[derive(Debug, Default)]
pub(crate) struct TierQueue {
    tiers: [VecDeque<String>; 4],
}

impl TierQueue {
    pub(crate) fn push(&mut self, priority: Priority, item_id: String) {
        self.tiers[priority.tier()].push_back(item_id);
    }

    /// Take the oldest item of the highest non-empty tier
    pub(crate) fn pop(&mut self) -> Option<(Priority, String)> {
        Priority::ALL
            .iter()
            .find_map(|p| self.tiers[p.tier()].pop_front().map(|id| (*p, id)))
    }

    /// Move a queued item to a higher tier; returns false if it is not queued
    /// or already ranks at least as high
    pub(crate) fn raise(&mut self, item_id: &str, to: Priority) -> bool {
        for from in Priority::ALL {
            let tier = &mut self.tiers[from.tier()];
            if let Some(position) = tier.iter().position(|id| id == item_id) {
                if !to.outranks(from) {
                    return false;
                }
                if let Some(id) = tier.remove(position) {
                    self.push(to, id);
                }
                return true;
            }
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn clear(&mut self) -> Vec<String> {
        self.tiers.iter_mut().flat_map(|t| t.drain(..)).collect()
    }
}
