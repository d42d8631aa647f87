//! Shared domain types for Tickflow.
//!
//! This crate contains the wire-visible data model exchanged between the
//! engine and the external durable-execution scheduler: flow definitions,
//! runtime state, directives, branch payloads, blob pointers, and mapping
//! events.
//!
//! Everything here serializes as camelCase JSON (the scheduler contract);
//! union types are internally tagged. Zero infrastructure dependencies --
//! only serde, uuid, chrono, semver, thiserror.

pub mod directive;
pub mod error;
pub mod event;
pub mod flow;
pub mod pointer;
pub mod state;
