//! First-match transition evaluation.
//!
//! Rules are evaluated in declaration order against the post-step context.
//! A rule with no condition always matches. A condition that fails against
//! the context never fails the step: the rule is skipped and the failure is
//! recorded in the trace, so a missing field in one rule degrades to "rule
//! did not apply" instead of poisoning the run. An expression that does not
//! parse is different: it can never match on any context, so it fails the
//! step as a configuration error.

use serde_json::Value;
use tickflow_types::event::{TransitionOutcome, TransitionTrace};
use tickflow_types::flow::StepInstance;

use crate::condition::{ConditionError, ConditionEvaluator};
use crate::error::StepFailure;

/// Outcome of transition resolution. `next_step_id: None` means the flow
/// has no further step on this path.
#[derive(Debug)]
pub struct NextStep {
    pub next_step_id: Option<String>,
    pub trace: Vec<TransitionTrace>,
}

/// Pick the next step for `step` given the current context document.
pub fn resolve_next(
    step: &StepInstance,
    context: &Value,
    evaluator: &ConditionEvaluator,
) -> Result<NextStep, StepFailure> {
    let mut trace = Vec::with_capacity(step.transitions.len() + 1);

    for (index, rule) in step.transitions.iter().enumerate() {
        let matched = match &rule.condition {
            None => true,
            Some(condition) => match evaluator.evaluate_bool(condition, context) {
                Ok(result) => result,
                Err(e @ ConditionError::Syntax(_)) => {
                    return Err(StepFailure::configuration(format!(
                        "transition rule {index} of step '{}': {e}",
                        step.id
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        step_id = %step.id,
                        rule_index = index,
                        error = %e,
                        "transition condition failed to evaluate, skipping rule"
                    );
                    trace.push(TransitionTrace {
                        rule_index: index,
                        condition: rule.condition.clone(),
                        outcome: TransitionOutcome::EvaluationError,
                        next_step_id: None,
                    });
                    continue;
                }
            },
        };

        if matched {
            trace.push(TransitionTrace {
                rule_index: index,
                condition: rule.condition.clone(),
                outcome: TransitionOutcome::Matched,
                next_step_id: Some(rule.next_step_id.clone()),
            });
            return Ok(NextStep {
                next_step_id: Some(rule.next_step_id.clone()),
                trace,
            });
        }
        trace.push(TransitionTrace {
            rule_index: index,
            condition: rule.condition.clone(),
            outcome: TransitionOutcome::NotMatched,
            next_step_id: None,
        });
    }

    if let Some(default) = &step.default_next_step_id {
        trace.push(TransitionTrace {
            rule_index: step.transitions.len(),
            condition: None,
            outcome: TransitionOutcome::DefaultApplied,
            next_step_id: Some(default.clone()),
        });
        return Ok(NextStep {
            next_step_id: Some(default.clone()),
            trace,
        });
    }

    Ok(NextStep {
        next_step_id: None,
        trace,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
