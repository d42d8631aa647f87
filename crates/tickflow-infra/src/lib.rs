//! Infrastructure layer for Tickflow.
//!
//! Concrete implementations of the ports defined in `tickflow-engine`:
//! in-memory and filesystem pointer stores, the SQLite and in-memory
//! metadata sinks, an in-memory definition loader, a JSONL bulk-item
//! reader, TOML configuration loading, and a local scheduler harness that
//! drives an interpreter loop to a terminal directive.

pub mod bulk;
pub mod config;
pub mod definitions;
pub mod harness;
pub mod sinks;
pub mod sqlite;
pub mod storage;
