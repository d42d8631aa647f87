//! Wire-visible error shapes and port-level error types.
//!
//! `FlowErrorInfo` is the structured error the scheduler persists when a
//! flow fails. The port errors (`StoreError`, `SinkError`,
//! `DefinitionError`) are shared between the engine's trait definitions and
//! the infra implementations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Structured flow error
// ---------------------------------------------------------------------------

/// Stable error names carried in `FlowErrorInfo::error_name`. Handlers and
/// the scheduler match on these, so they are part of the wire contract.
pub mod error_names {
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const UNKNOWN_HANDLER: &str = "UNKNOWN_HANDLER";
    pub const CONTENT_VALIDATION_FAILED: &str = "CONTENT_VALIDATION_FAILED";
    pub const SAFETY_VIOLATION: &str = "SAFETY_VIOLATION";
    pub const TEMPLATE_RENDER_FAILED: &str = "TEMPLATE_RENDER_FAILED";
    pub const DYNAMIC_PATH_UNRESOLVED: &str = "DYNAMIC_PATH_UNRESOLVED";
    pub const POINTER_DEREF_FAILED: &str = "POINTER_DEREF_FAILED";
    pub const POINTER_STORE_FAILED: &str = "POINTER_STORE_FAILED";
    pub const SAFETY_CHECK_UNAVAILABLE: &str = "SAFETY_CHECK_UNAVAILABLE";
    pub const BRANCH_AGGREGATION_FAILED: &str = "BRANCH_AGGREGATION_FAILED";
    pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
    pub const STEP_NOT_FOUND: &str = "STEP_NOT_FOUND";
    pub const FLOW_NOT_FOUND: &str = "FLOW_NOT_FOUND";
    pub const DEFINITION_UNAVAILABLE: &str = "DEFINITION_UNAVAILABLE";
}

/// Structured error recorded on a failed execution and inside tolerated
/// branch failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowErrorInfo {
    /// Stable machine-readable name (see [`error_names`]).
    pub error_name: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    /// Whether the scheduler may retry the whole invocation.
    pub is_retryable: bool,
}

impl FlowErrorInfo {
    pub fn terminal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_name: name.into(),
            error_message: message.into(),
            error_details: None,
            is_retryable: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error_details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Errors from pointer-store operations (used by trait definitions in
/// tickflow-engine). `Io` is transport-retryable; the rest are terminal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage i/o error: {0}")]
    Io(String),

    #[error("payload too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("stored content corrupt: {0}")]
    Corrupt(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Errors from the metadata sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metadata sink unavailable: {0}")]
    Unavailable(String),

    #[error("metadata write failed: {0}")]
    Write(String),
}

/// Errors from definition loading and validation.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("flow '{flow_id}' version {version} not found")]
    NotFound { flow_id: String, version: semver::Version },

    #[error("definition source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid definition: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
}
