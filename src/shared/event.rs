//! Typed Event System
//!
//! Each event kind gets its own [`EventBus`], a thin wrapper over
//! `tokio::sync::broadcast`. Every subscriber attached when an event is
//! published receives a copy. Dropping a [`Subscription`] detaches it; an event
//! already in flight at that moment may still be observed.
//!
//! # Event Kinds
//!
//! - [`StateChanged`] - connectivity transitions
//! - [`SyncEvent`] - `sync_queued`, `sync_completed`, `sync_failed`, `sync_retrying`
//! - [`ReactionEvent`] - `reaction_updated`, `reactions_reconciled`

use crate::offline::queue::FailureReason;
use crate::sync::sync_state::ConnectivityState;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Default buffer per bus before slow subscribers start lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Reactions on a single message: emoji -> actors who reacted
pub type ReactionMap = BTreeMap<String, BTreeSet<String>>;

/// Connectivity transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "state_changed")]
pub struct StateChanged {
    /// State before the transition
    pub previous: ConnectivityState,
    /// State after the transition
    pub current: ConnectivityState,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

/// Sync queue lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Operation durably enqueued
    #[serde(rename = "sync_queued")]
    Queued {
        /// Operation id
        operation_id: Uuid,
        /// FIFO ordering key
        entity_key: String,
    },
    /// Remote authority acknowledged the operation
    #[serde(rename = "sync_completed")]
    Completed {
        /// Operation id
        operation_id: Uuid,
        /// FIFO ordering key
        entity_key: String,
        /// Response payload from the authority
        response: serde_json::Value,
    },
    /// Operation moved to the dead-letter view
    #[serde(rename = "sync_failed")]
    Failed {
        /// Operation id
        operation_id: Uuid,
        /// FIFO ordering key
        entity_key: String,
        /// Why it failed
        reason: FailureReason,
    },
    /// Attempt failed, another one is scheduled
    #[serde(rename = "sync_retrying")]
    Retrying {
        /// Operation id
        operation_id: Uuid,
        /// Attempts made so far
        attempts: u32,
        /// Delay before the next attempt
        delay_ms: u64,
    },
}

impl SyncEvent {
    /// Operation the event refers to
    pub fn operation_id(&self) -> Uuid {
        match self {
            Self::Queued { operation_id, .. }
            | Self::Completed { operation_id, .. }
            | Self::Failed { operation_id, .. }
            | Self::Retrying { operation_id, .. } => *operation_id,
        }
    }
}

/// Reaction events for chat messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReactionEvent {
    /// Local optimistic toggle applied
    #[serde(rename = "reaction_updated")]
    Updated {
        /// Message the reaction belongs to
        message_id: String,
        /// Who reacted
        actor_id: String,
        /// Reaction emoji
        emoji: String,
        /// true when added, false when removed
        added: bool,
        /// Reactions after the toggle
        reactions: ReactionMap,
    },
    /// Authoritative reactions replaced the local view
    #[serde(rename = "reactions_reconciled")]
    Reconciled {
        /// Message the reactions belong to
        message_id: String,
        /// Authoritative reactions
        reactions: ReactionMap,
    },
}

/// Publish/subscribe channel for a single event kind
#[derive(Debug)]
pub struct EventBus<E> {
    name: &'static str,
    tx: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + std::fmt::Debug + 'static,
{
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { name, tx }
    }

    /// Publish an event to every attached subscriber
    ///
    /// Returns the number of subscribers that received it (0 if none).
    pub fn publish(&self, event: E) -> usize {
        match self.tx.send(event) {
            Ok(subscriber_count) => {
                tracing::trace!("[Events:{}] delivered to {} subscribers", self.name, subscriber_count);
                subscriber_count
            }
            Err(e) => {
                tracing::trace!("[Events:{}] no subscribers: {:?}", self.name, e.0);
                0
            }
        }
    }

    /// Attach a new subscriber; it sees events published from now on
    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            name: self.name,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle for an attached subscriber
#[derive(Debug)]
pub struct Subscription<E> {
    name: &'static str,
    rx: broadcast::Receiver<E>,
}

impl<E> Subscription<E>
where
    E: Clone + Send + 'static,
{
    /// Wait for the next event, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Events:{}] subscriber lagged, skipped {} events", self.name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("[Events:{}] subscriber lagged, skipped {} events", self.name, skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain_buffered(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Detach explicitly
    pub fn unsubscribe(self) {}

    /// Turn the subscription into a `Stream`, skipping lag notifications
    pub fn into_stream(self) -> impl Stream<Item = E> {
        BroadcastStream::new(self.rx).filter_map(|item| async move { item.ok() })
    }
}

/// All buses exposed by the core
#[derive(Debug, Clone)]
pub struct CoreEvents {
    /// `state_changed`
    pub state: EventBus<StateChanged>,
    /// `sync_*`
    pub sync: EventBus<SyncEvent>,
    /// `reaction_updated` / `reactions_reconciled`
    pub reactions: EventBus<ReactionEvent>,
}

impl CoreEvents {
    /// Create buses with the given per-subscriber capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            state: EventBus::new("state", capacity),
            sync: EventBus::new("sync", capacity),
            reactions: EventBus::new("reactions", capacity),
        }
    }
}

impl Default for CoreEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
