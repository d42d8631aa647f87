//! Failure taxonomy for step execution.
//!
//! Every failure inside the engine is classified into one of three classes,
//! and the class alone decides the control flow upstream: transport failures
//! bubble out of the interpreter untouched so the scheduler re-delivers the
//! same invocation, content failures consume the step's bounded retry
//! budget, and terminal failures go straight to the terminal-error resolver.

use serde_json::Value;
use tickflow_types::error::{error_names, FlowErrorInfo, StoreError};
use tickflow_types::state::RuntimeState;

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

/// A classified failure raised anywhere between input mapping and the audit
/// entry of a single step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepFailure {
    /// Transient infrastructure failure (store unreachable, sink down).
    /// Re-delivering the same invocation may succeed, so no retry budget is
    /// consumed.
    #[error("{error_name}: {message}")]
    Transport { error_name: String, message: String },

    /// The step ran but its result failed a semantic check. Retried via the
    /// step's own attempt counter, then terminal.
    #[error("{error_name}: {message}")]
    Content {
        error_name: String,
        message: String,
        details: Option<Value>,
    },

    /// Not retryable: bad configuration, unknown handler, handler crash,
    /// safety violation.
    #[error("{error_name}: {message}")]
    Terminal {
        error_name: String,
        message: String,
        details: Option<Value>,
    },
}

impl StepFailure {
    pub fn transport(error_name: &str, message: impl Into<String>) -> Self {
        StepFailure::Transport {
            error_name: error_name.to_string(),
            message: message.into(),
        }
    }

    pub fn content(error_name: &str, message: impl Into<String>) -> Self {
        StepFailure::Content {
            error_name: error_name.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn terminal(error_name: &str, message: impl Into<String>) -> Self {
        StepFailure::Terminal {
            error_name: error_name.to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// Shorthand for the most common terminal failure: a definition or
    /// mapping that cannot be interpreted.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::terminal(error_names::CONFIGURATION_ERROR, message)
    }

    /// Attach structured details. No-op for transport failures, which never
    /// surface to flow state.
    pub fn with_details(mut self, value: Value) -> Self {
        match &mut self {
            StepFailure::Content { details, .. } | StepFailure::Terminal { details, .. } => {
                *details = Some(value);
            }
            StepFailure::Transport { .. } => {}
        }
        self
    }

    pub fn error_name(&self) -> &str {
        match self {
            StepFailure::Transport { error_name, .. }
            | StepFailure::Content { error_name, .. }
            | StepFailure::Terminal { error_name, .. } => error_name,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepFailure::Transport { message, .. }
            | StepFailure::Content { message, .. }
            | StepFailure::Terminal { message, .. } => message,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StepFailure::Transport { .. })
    }

    pub fn is_content(&self) -> bool {
        matches!(self, StepFailure::Content { .. })
    }

    /// Reclassify a content failure as terminal, keeping its name, message
    /// and details. Used when the retry budget is exhausted.
    pub fn into_terminal(self) -> Self {
        match self {
            StepFailure::Content {
                error_name,
                message,
                details,
            } => StepFailure::Terminal {
                error_name,
                message,
                details,
            },
            other => other,
        }
    }

    /// The wire-visible structured error for this failure.
    pub fn to_error_info(&self) -> FlowErrorInfo {
        let details = match self {
            StepFailure::Content { details, .. } | StepFailure::Terminal { details, .. } => {
                details.clone()
            }
            StepFailure::Transport { .. } => None,
        };
        FlowErrorInfo {
            error_name: self.error_name().to_string(),
            error_message: self.message().to_string(),
            error_details: details,
            is_retryable: self.is_transport(),
        }
    }
}

impl From<StoreError> for StepFailure {
    fn from(err: StoreError) -> Self {
        match &err {
            // transient by definition; the blob may well be there next time
            StoreError::Io(_) => {
                StepFailure::transport(error_names::POINTER_STORE_FAILED, err.to_string())
            }
            // a missing or corrupt blob will not heal on re-delivery
            StoreError::NotFound(_) | StoreError::Corrupt(_) => {
                StepFailure::terminal(error_names::POINTER_DEREF_FAILED, err.to_string())
            }
            StoreError::TooLarge { .. } | StoreError::InvalidKey(_) => {
                StepFailure::terminal(error_names::POINTER_STORE_FAILED, err.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InterpreterError
// ---------------------------------------------------------------------------

/// Errors surfaced to the scheduler from [`crate::interpreter`].
///
/// Both variants are signals rather than flow outcomes: the flow is still
/// RUNNING and the scheduler is expected to invoke again. Genuine flow
/// failures are not errors at this level; they come back as a
/// `TERMINATE` directive carrying the structured error.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    /// Transient infrastructure failure. Re-deliver the same invocation
    /// with unchanged state; no retry budget was consumed.
    #[error("transport failure, re-deliver invocation: {error_name}: {message}")]
    Transport { error_name: String, message: String },

    /// A content check failed with retry budget remaining. Persist `state`
    /// (its attempt counter is already incremented) and deliver a fresh
    /// invocation for the same step.
    #[error("content retry for step '{step_id}', attempt {attempt}: {}", error.error_message)]
    ContentRetry {
        step_id: String,
        /// Attempts consumed so far, including the one that just failed.
        attempt: u32,
        error: FlowErrorInfo,
        state: Box<RuntimeState>,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification_predicates() {
        let transport = StepFailure::transport(error_names::POINTER_STORE_FAILED, "down");
        assert!(transport.is_transport());
        assert!(!transport.is_content());

        let content = StepFailure::content(error_names::CONTENT_VALIDATION_FAILED, "missing");
        assert!(content.is_content());
        assert!(!content.is_transport());
    }

    #[test]
    fn test_into_terminal_preserves_name_and_details() {
        let failure = StepFailure::content(error_names::CONTENT_VALIDATION_FAILED, "missing id")
            .with_details(json!({"missing": ["$.id"]}));
        let terminal = failure.into_terminal();
        assert!(matches!(terminal, StepFailure::Terminal { .. }));
        assert_eq!(terminal.error_name(), error_names::CONTENT_VALIDATION_FAILED);
        let info = terminal.to_error_info();
        assert_eq!(info.error_details, Some(json!({"missing": ["$.id"]})));
        assert!(!info.is_retryable);
    }

    #[test]
    fn test_store_error_classification() {
        let io: StepFailure = StoreError::Io("connection refused".to_string()).into();
        assert!(io.is_transport());
        assert_eq!(io.error_name(), error_names::POINTER_STORE_FAILED);

        let missing: StepFailure = StoreError::NotFound("values/x".to_string()).into();
        assert!(!missing.is_transport());
        assert_eq!(missing.error_name(), error_names::POINTER_DEREF_FAILED);
    }

    #[test]
    fn test_error_info_retryable_only_for_transport() {
        let transport = StepFailure::transport(error_names::POINTER_STORE_FAILED, "down");
        assert!(transport.to_error_info().is_retryable);

        let terminal = StepFailure::terminal(error_names::HANDLER_FAILED, "boom");
        assert!(!terminal.to_error_info().is_retryable);
    }
}
