//! Shared Error Types
//!
//! This module defines the error taxonomy used across the synchronization core.
//! Every component reports failures through these types; nothing in the core
//! surfaces presentation, only structured errors and counts.
//!
//! # Error Categories
//!
//! - `TransientNetwork` - retryable, drives sync queue backoff
//! - `Conflict` - non-retryable, surfaced to the caller for manual resolution
//! - `QuotaExceeded` - local storage is full, the write did not happen
//! - `Timeout` - a single resource load ran out of time
//! - `PermanentFailure` - a sync operation exhausted its attempts
//!
//! # Usage
//!
//! ```rust
//! use xfsync::shared::error::{CoreError, ConflictReason};
//!
//! let error = CoreError::conflict("message:42", ConflictReason::EntityMissing);
//! assert!(!error.is_retryable());
//! ```
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Why the remote authority refused to apply an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    /// The target entity no longer exists on the server
    EntityMissing,
    /// The entity was changed concurrently in an incompatible way
    ConcurrentModification {
        /// Server-side revision at the time of the conflict, when known
        server_revision: Option<u64>,
    },
    /// Any other conflict the server reports
    Other {
        /// Server supplied description
        detail: String,
    },
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityMissing => write!(f, "entity no longer exists"),
            Self::ConcurrentModification { server_revision: Some(rev) } => {
                write!(f, "concurrently modified (server revision {})", rev)
            }
            Self::ConcurrentModification { server_revision: None } => {
                write!(f, "concurrently modified")
            }
            Self::Other { detail } => write!(f, "{}", detail),
        }
    }
}

/// Errors produced by the synchronization core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Retryable network failure
    #[error("Transient network error: {message}")]
    TransientNetwork {
        /// Human-readable error message
        message: String,
    },

    /// The remote authority rejected an operation because of a conflict
    #[error("Conflict on '{entity}': {reason}")]
    Conflict {
        /// Entity key the conflict refers to
        entity: String,
        /// Structured reason reported by the server
        reason: ConflictReason,
    },

    /// Local storage is full
    #[error("Storage quota exceeded writing '{key}': requested {requested} bytes, {available} available")]
    QuotaExceeded {
        /// Key that could not be written
        key: String,
        /// Size of the rejected write
        requested: u64,
        /// Space left in the store
        available: u64,
    },

    /// A resource load exceeded its per-item budget
    #[error("Timed out after {after:?}")]
    Timeout {
        /// Budget that was exceeded
        after: Duration,
    },

    /// A sync operation exceeded its maximum attempts
    #[error("Operation {operation_id} failed permanently after {attempts} attempts: {last_error}")]
    PermanentFailure {
        /// Operation that failed
        operation_id: Uuid,
        /// Number of delivery attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// An optimistic mutation with the same identity is already in flight
    #[error("Mutation '{kind}' by '{actor}' on '{entity}' is already pending")]
    AlreadyPending {
        /// Entity the mutation targets
        entity: String,
        /// Actor issuing the mutation
        actor: String,
        /// Operation kind
        kind: String,
    },

    /// A state machine was asked to perform a transition it does not define
    #[error("Invalid transition: {event} while {from}")]
    InvalidTransition {
        /// State the machine was in
        from: String,
        /// Event that was rejected
        event: String,
    },

    /// Load was abandoned through cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Server refused the request for a non-conflict reason
    #[error("Rejected by server: {message}")]
    Rejected {
        /// Human-readable error message
        message: String,
    },

    /// Backend storage failure
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message
        message: String,
    },

    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// Lookup of something that is not there
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
    },
}

impl CoreError {
    /// Create a new transient network error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(entity: impl Into<String>, reason: ConflictReason) -> Self {
        Self::Conflict {
            entity: entity.into(),
            reason,
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. } | Self::Timeout { .. })
    }
}

/// Failure reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// Connection dropped, server unavailable, 5xx
    #[error("transient: {0}")]
    Transient(String),
    /// Entity missing or concurrently modified
    #[error("conflict: {0}")]
    Conflict(ConflictReason),
    /// Request refused for good
    #[error("rejected: {0}")]
    Rejected(String),
    /// Request did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether the sync queue should back off and try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Convert into a [`CoreError`] for the given entity
    pub fn into_core(self, entity: &str) -> CoreError {
        match self {
            Self::Transient(message) => CoreError::transient(message),
            Self::Conflict(reason) => CoreError::conflict(entity, reason),
            Self::Rejected(message) => CoreError::Rejected { message },
            Self::Timeout(after) => CoreError::Timeout { after },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Transient(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}
