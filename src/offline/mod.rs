//! # Offline Mutation Pipeline
//!
//! Durable queuing, replay and optimistic application of local mutations.
//!
//! ## Architecture
//!
//! - **Operation Queue**: durable per-entity FIFO of pending mutations
//! - **Retry Logic**: exponential backoff with an attempt cutoff
//! - **Optimistic Updates**: versioned entity records with rebase and
//!   server-wins reconciliation
//! - **Reactions**: chat reaction toggles built on the three above
//!
//! ## Key Components
//!
//! - `queue.rs`: operation queuing system
//! - `retry.rs`: retry logic and backoff strategies
//! - `optimistic.rs`: optimistic update engine
//! - `reactions.rs`: reaction toggles and reconciliation

pub mod optimistic;
pub mod queue;
pub mod reactions;
pub mod retry;

// Re-export main types
pub use optimistic::{EntityRecord, OptimisticEngine, PendingKey, ServerState};
pub use queue::{
    DrainReport, FailureReason, NewOperation, OperationKind, OperationStatus, QueueStats,
    SyncOperation, SyncQueue,
};
pub use reactions::{ReactionService, ReactionToggle};
pub use retry::{BackoffStrategy, RetryPolicy};
