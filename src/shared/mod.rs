//! Shared Module
//!
//! Types used by every component of the synchronization core: the error
//! taxonomy, the typed event bus, the injectable clock and configuration.
//!
//! # Overview
//!
//! Nothing in here performs I/O. Components depend on these types instead of
//! on each other wherever possible.

/// Typed event bus and event payloads
pub mod event;

/// Error taxonomy
pub mod error;

/// Injectable wall clock
pub mod clock;

/// Layered configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{ConfigError, CoreConfig, CoreConfigBuilder};
pub use error::{ConflictReason, CoreError, Result, TransportError};
pub use event::{CoreEvents, EventBus, ReactionEvent, StateChanged, Subscription, SyncEvent};
