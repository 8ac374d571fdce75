//! Property-based tests

mod optimistic_proptest;
mod queue_proptest;
mod retry_proptest;
mod store_proptest;
