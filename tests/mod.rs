//! xfsync test suite
//!
//! `integration` drives the whole core through `SyncService`; `property`
//! checks queue, store and optimistic invariants with generated inputs.

pub mod common;
pub mod integration;
pub mod property;
