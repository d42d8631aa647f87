//! Observability initialization for Tickflow.
//!
//! One place owns the global tracing subscriber so every embedding binary
//! (demos, the local scheduler, operational tooling) logs the same way.
//! Engine and infra crates only emit `tracing` events; none of them ever
//! install a subscriber, and neither do tests.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
