//! # Sync Metrics
//!
//! Drain performance for the sync queue.
//!
//! ## Features
//!
//! - **Performance Metrics**: drain count and rolling average duration
//! - **Error Tracking**: delivered versus dead-lettered operations
//! - **Interruptions**: drains cut short by lost connectivity

use crate::offline::queue::DrainReport;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Drain counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainMetrics {
    /// Drains started, re-entrant calls excluded
    pub total_drains: u64,
    /// Drains that ran until nothing was deliverable
    pub completed_drains: u64,
    /// Drains stopped by a disconnect
    pub paused_drains: u64,
    /// Operations acknowledged across all drains
    pub operations_delivered: u64,
    /// Operations dead-lettered across all drains
    pub operations_failed: u64,
    /// Rolling average over completed drains
    pub average_drain_duration: Duration,
    /// Duration of the most recent drain
    pub last_drain_duration: Option<Duration>,
    #[serde(skip)]
    last_drain_start: Option<Instant>,
}

impl DrainMetrics {
    /// New, zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_drain_start(&mut self) {
        self.last_drain_start = Some(Instant::now());
        self.total_drains += 1;
    }

    pub fn record_drain_end(&mut self, report: &DrainReport) {
        self.operations_delivered += report.delivered as u64;
        self.operations_failed += report.failed as u64;

        let Some(start) = self.last_drain_start.take() else {
            return;
        };
        let duration = start.elapsed();
        self.last_drain_duration = Some(duration);

        if report.paused {
            self.paused_drains += 1;
            return;
        }
        self.completed_drains += 1;

        // Update rolling average
        let total = self.average_drain_duration * (self.completed_drains - 1) as u32 + duration;
        self.average_drain_duration = total / self.completed_drains as u32;
    }

    /// Share of finished operations that were delivered
    pub fn delivery_rate(&self) -> f64 {
        let finished = self.operations_delivered + self.operations_failed;
        if finished == 0 {
            0.0
        } else {
            self.operations_delivered as f64 / finished as f64
        }
    }
}
