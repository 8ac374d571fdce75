//! # Connectivity State Machine
//!
//! Closed set of connectivity states with an explicit transition table.
//!
//! ## Transitions
//!
//! | From      | Event                    | To        |
//! |-----------|--------------------------|-----------|
//! | `Offline` | `Connected { backlog>0 }`| `Syncing` |
//! | `Offline` | `Connected { 0 }`        | `Online`  |
//! | `Online`  | `Disconnected`           | `Offline` |
//! | `Online`  | `DrainStarted`           | `Syncing` |
//! | `Syncing` | `DrainFinished`          | `Online`  |
//! | `Syncing` | `Disconnected`           | `Offline` |
//!
//! Any other pair is rejected with [`CoreError::InvalidTransition`].

use crate::shared::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity as seen by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Channel up, backlog empty
    Online,
    /// Channel down
    Offline,
    /// Channel up, sync queue draining a backlog
    Syncing,
}

impl ConnectivityState {
    /// Apply `event`, returning the next state
    pub fn on(self, event: ConnectivityEvent) -> Result<ConnectivityState> {
        use ConnectivityEvent::*;
        use ConnectivityState::*;

        match (self, event) {
            (Offline, Connected { backlog }) if backlog > 0 => Ok(Syncing),
            (Offline, Connected { .. }) => Ok(Online),
            (Online, Disconnected) => Ok(Offline),
            (Online, DrainStarted) => Ok(Syncing),
            (Syncing, DrainFinished) => Ok(Online),
            (Syncing, Disconnected) => Ok(Offline),
            (from, event) => Err(CoreError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            }),
        }
    }

    /// Online or Syncing
    pub fn is_connected(self) -> bool {
        !matches!(self, ConnectivityState::Offline)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Syncing => "syncing",
        })
    }
}

/// Inputs to the connectivity state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Transport came up; `backlog` is the number of queued operations
    Connected {
        /// Pending sync operations at connect time
        backlog: usize,
    },
    /// Transport went down
    Disconnected,
    /// Sync queue began draining
    DrainStarted,
    /// Sync queue finished draining
    DrainFinished,
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityEvent::Connected { backlog } => write!(f, "connected(backlog={})", backlog),
            ConnectivityEvent::Disconnected => f.write_str("disconnected"),
            ConnectivityEvent::DrainStarted => f.write_str("drain_started"),
            ConnectivityEvent::DrainFinished => f.write_str("drain_finished"),
        }
    }
}
