//! Step handler abstraction and registry.
//!
//! Handlers are the only extension point that touches the outside world
//! during a step. The engine hands them a fully materialized input (mapped,
//! hydrated, rendered) and receives either a completed output or a parking
//! instruction. Handlers never see pointers and never touch context
//! assembly.
//!
//! `StepHandler` uses RPITIT so concrete handlers stay allocation-free;
//! `StepHandlerDyn` + blanket impl provide the object-safe form the
//! registry stores:
//! 1. Define an object-safe `StepHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `StepHandlerDyn` for all `T: StepHandler`
//! 3. `HandlerRegistry` stores `Arc<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tickflow_types::error::error_names;

use crate::error::StepFailure;

// ---------------------------------------------------------------------------
// Input / outcome
// ---------------------------------------------------------------------------

/// Everything a handler sees for one attempt.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub step_id: String,
    /// Mapped input document built from `input_mappings` and `literals`.
    pub data: Value,
    /// Rendered step config.
    pub config: Value,
    /// Previous poll payload, set when re-checking a polling task.
    pub poll_payload: Option<Value>,
}

/// What a handler invocation produced.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// The step finished; `output` feeds output mappings and transitions.
    Completed {
        output: Value,
        /// Operational metadata kept out of the context document and
        /// recorded only in the audit trail.
        side_meta: Option<Value>,
    },
    /// Park the run until an external callback arrives.
    AwaitCallback { payload: Option<Value> },
    /// Not done yet; re-invoke later with this payload.
    Pending {
        payload: Value,
        interval_seconds: Option<u64>,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Handler-declared failure, classified by the handler itself.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure hiccup; safe to re-run the whole invocation.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// The input or produced content was semantically unacceptable;
    /// eligible for the step's bounded content-retry budget.
    #[error("content rejected: {0}")]
    Content(String),

    /// The handler cannot succeed on this input.
    #[error("handler failed: {0}")]
    Failed(String),
}

impl From<HandlerError> for StepFailure {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Transient(msg) => {
                StepFailure::transport(error_names::HANDLER_FAILED, msg)
            }
            HandlerError::Content(msg) => StepFailure::content(error_names::HANDLER_FAILED, msg),
            HandlerError::Failed(msg) => StepFailure::terminal(error_names::HANDLER_FAILED, msg),
        }
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// A named unit of step work.
pub trait StepHandler: Send + Sync {
    /// Registry key; `StepInstance::handler_name` values refer to this.
    fn name(&self) -> &str;

    fn execute(
        &self,
        input: HandlerInput,
    ) -> impl Future<Output = Result<HandlerOutcome, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn StepHandlerDyn`).
/// A blanket implementation is provided for all types implementing
/// `StepHandler`.
pub trait StepHandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        input: HandlerInput,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>>;
}

/// Blanket implementation: any `StepHandler` automatically implements
/// `StepHandlerDyn`.
impl<T: StepHandler> StepHandlerDyn for T {
    fn name(&self) -> &str {
        StepHandler::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: HandlerInput,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>> {
        Box::pin(self.execute(input))
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Handlers keyed by name, built once at startup and shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name. Re-registering a name
    /// replaces the previous handler.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    impl StepHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, input: HandlerInput) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Completed {
                output: input.data,
                side_meta: None,
            })
        }
    }

    fn input(data: Value) -> HandlerInput {
        HandlerInput {
            step_id: "s1".to_string(),
            data,
            config: json!({}),
            poll_payload: None,
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler);

        let handler = registry.get("echo").unwrap();
        assert_eq!(handler.name(), "echo");
        let outcome = handler
            .execute_boxed(input(json!({"k": 1})))
            .await
            .unwrap();
        match outcome {
            HandlerOutcome::Completed { output, .. } => assert_eq!(output, json!({"k": 1})),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_handler_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_error_classification() {
        let transient: StepFailure = HandlerError::Transient("socket".to_string()).into();
        assert!(transient.is_transport());

        let content: StepFailure = HandlerError::Content("empty".to_string()).into();
        assert!(content.is_content());

        let failed: StepFailure = HandlerError::Failed("bad".to_string()).into();
        assert!(!failed.is_transport());
        assert!(!failed.is_content());
        assert_eq!(failed.error_name(), error_names::HANDLER_FAILED);
    }
}
