//! Flow interpretation engine for Tickflow.
//!
//! This crate contains the pure execution logic: path resolution over context
//! documents, template rendering, step execution, fork/aggregate handling, and
//! the top-level interpreter that turns one `InterpreterInvocation` into one
//! `Directive`. It defines the "ports" (async traits) that the infrastructure
//! layer implements and depends only on `tickflow-types` -- never on a
//! database or IO crate.

pub mod audit;
pub mod condition;
pub mod definition;
pub mod error;
pub mod executor;
pub mod handler;
pub mod interpreter;
pub mod parallel;
pub mod ports;
pub mod recovery;
pub mod settings;
pub mod template;
pub mod transition;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;
