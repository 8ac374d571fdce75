//! Shared fixtures and assertions
//!
//! Every suite builds its core through [`fixtures`], which wires a
//! `SyncService` to scripted transport, fetcher and clock handles.

pub mod assertions;
pub mod fixtures;

pub use fixtures::*;
