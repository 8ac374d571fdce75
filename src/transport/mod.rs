//! Remote authority channel
//!
//! The core does not define a wire format. It talks to the remote authority
//! through the [`Transport`] trait: request/response for replaying operations,
//! round-trip probes, and a signal stream carrying connect/disconnect
//! transitions and server push events.

pub mod http;

pub use http::HttpTransport;

use crate::offline::queue::OperationKind;
use crate::shared::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One operation delivered to the remote authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Operation id, doubles as the idempotency key
    pub operation_id: Uuid,
    /// What kind of mutation this is
    pub kind: OperationKind,
    /// Logical entity the operation targets
    pub entity_key: String,
    /// Operation payload
    pub payload: serde_json::Value,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// Acknowledgement from the remote authority
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Authoritative state after applying the operation
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Server revision of the entity, when the server versions it
    #[serde(default)]
    pub revision: Option<u64>,
}

/// Out-of-band signals from the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSignal {
    /// Channel is up
    Connected,
    /// Channel is down
    Disconnected,
    /// Server-initiated event
    Push {
        /// Event name, e.g. `reactions_updated`
        event: String,
        /// Event body
        payload: serde_json::Value,
    },
}

/// Bidirectional channel to the remote authority
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one operation and wait for the authority's answer
    async fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError>;

    /// Measure one round trip
    async fn ping(&self) -> Result<Duration, TransportError>;

    /// Subscribe to connect/disconnect/push signals
    fn signals(&self) -> broadcast::Receiver<TransportSignal>;
}
