//! Integration tests driving the full core

mod loader_test;
mod persistence_test;
mod reactions_test;
mod scenarios_test;
