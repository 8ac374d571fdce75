//! xfsync - Resilient Synchronization Core
//!
//! Offline-first plumbing for chat clients: connectivity detection, durable
//! local storage, replay of pending mutations with backoff, optimistic
//! updates with server-wins reconciliation, and adaptive loading of remote
//! resources.
//!
//! # Module Structure
//!
//! - **`shared`** - Types every component uses
//!   - Error taxonomy, typed event bus, clock, configuration
//!
//! - **`local_db`** - Durable key/value store with TTL
//!   - In-memory and SQLite backends
//!
//! - **`transport`** - Channel to the remote authority
//!   - `Transport` trait and its reqwest implementation
//!
//! - **`sync`** - Connectivity state machine, drain metrics and the
//!   `SyncService` facade
//!
//! - **`offline`** - Sync queue, retry policy, optimistic engine, reactions
//!
//! - **`loader`** - Priority-tiered progressive resource loader
//!
//! # Usage
//!
//! ```rust,no_run
//! use xfsync::loader::{LoadRequest, Priority};
//! use xfsync::shared::config::CoreConfig;
//! use xfsync::sync::SyncService;
//!
//! # async fn example() -> xfsync::shared::error::Result<()> {
//! let config = CoreConfig::from_file("xfsync.toml")?;
//! let mut service = SyncService::open(config).await?;
//! service.start()?;
//!
//! let avatar = service
//!     .add_item(LoadRequest::new("avatar:7", "https://cdn.example.com/7.png"), Priority::High)
//!     .await
//!     .await?;
//! # let _ = avatar;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Every component is `Send + Sync` and shared through `Arc`. Async state
//! sits behind `tokio::sync::RwLock`; short critical sections that never
//! cross an `.await` use `std::sync::Mutex`.
//!
//! # Error Handling
//!
//! Fallible operations return [`shared::error::Result`]. Sync queue failures
//! are recorded on the operation and reported through events instead of
//! being returned.

/// Shared types and data structures
pub mod shared;

/// Durable local store
pub mod local_db;

/// Remote authority channel
pub mod transport;

/// Connectivity and the service facade
pub mod sync;

/// Offline mutation pipeline
pub mod offline;

/// Progressive resource loader
pub mod loader;

/// In-process doubles for the transport and fetcher
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use shared::error::{CoreError, Result};
pub use sync::SyncService;
