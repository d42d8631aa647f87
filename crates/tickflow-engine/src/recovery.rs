//! Default terminal-error routing.
//!
//! Once a step failure is terminal, the flow either redirects to the
//! step's declared fallback or fails. The resolver is a port so richer
//! policies (dead-letter steps, operator holds) can replace this one
//! without touching the interpreter.

use tickflow_types::error::FlowErrorInfo;
use tickflow_types::flow::{FlowDefinition, StepInstance};

use crate::ports::{TerminalDecision, TerminalErrorResolver};

/// Honors the failed step's `fallback_step_id` when it names a different,
/// existing step; fails the flow otherwise.
///
/// A fallback pointing at the failed step itself would loop the failure
/// forever, so it is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyFallbackResolver;

impl TerminalErrorResolver for PolicyFallbackResolver {
    async fn resolve(
        &self,
        flow: &FlowDefinition,
        step: Option<&StepInstance>,
        error: &FlowErrorInfo,
    ) -> TerminalDecision {
        let Some(step) = step else {
            return TerminalDecision::Fail;
        };
        let Some(fallback) = &step.on_error.fallback_step_id else {
            return TerminalDecision::Fail;
        };
        if fallback == &step.id {
            tracing::warn!(
                step_id = %step.id,
                "fallback points at the failed step itself, failing the flow"
            );
            return TerminalDecision::Fail;
        }
        if flow.step(fallback).is_none() {
            tracing::warn!(
                step_id = %step.id,
                fallback,
                "fallback step not in the definition, failing the flow"
            );
            return TerminalDecision::Fail;
        }

        tracing::debug!(
            step_id = %step.id,
            fallback,
            error_name = %error.error_name,
            "redirecting terminal failure to fallback step"
        );
        TerminalDecision::Fallback {
            next_step_id: fallback.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
