//! Invocation-scoped audit records.
//!
//! Mapping events record every value resolution, default, and pointer
//! dereference that happens while building inputs, templating, or mapping
//! outputs. Transition traces record why a successor was (or was not)
//! chosen. Both are informational only: collected in scratch during one
//! invocation, bundled into the step's audit entry, then discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mapping events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingEventStatus {
    Success,
    Warn,
    Error,
    Info,
}

/// One resolution outcome during mapping or templating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEvent {
    /// What produced the event ("resolve", "dereference", "outputMapping",
    /// "templateContext", ...).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub status: MappingEventStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl MappingEvent {
    /// Event stamped with the current time and no details.
    pub fn now(
        event_type: impl Into<String>,
        status: MappingEventStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            status,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Transition trace
// ---------------------------------------------------------------------------

/// Why one transition rule matched or was skipped. Attached to the step's
/// audit entry for explainability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionTrace {
    /// Position of the rule in the step's ordered transition list.
    pub rule_index: usize,
    /// The rule's condition expression, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub outcome: TransitionOutcome,
    /// Successor chosen by this rule, when it matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionOutcome {
    /// Condition evaluated truthy (or was absent); rule chose the successor.
    Matched,
    /// Condition evaluated falsy; rule skipped.
    NotMatched,
    /// Condition failed to evaluate; rule skipped, error recorded.
    EvaluationError,
    /// No rule matched; the default successor (or path end) applied.
    DefaultApplied,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapping_event_wire_shape() {
        let event = MappingEvent::now("resolve", MappingEventStatus::Warn, "source undefined")
            .with_details(json!({"path": "$.missing"}));
        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("\"eventType\":\"resolve\""));
        assert!(json_str.contains("\"status\":\"WARN\""));
        assert!(json_str.contains("\"$.missing\""));

        let parsed: MappingEvent = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.status, MappingEventStatus::Warn);
        assert_eq!(parsed.message, "source undefined");
    }

    #[test]
    fn test_mapping_event_omits_empty_details() {
        let event = MappingEvent::now("dereference", MappingEventStatus::Info, "hydrated");
        let json_str = serde_json::to_string(&event).unwrap();
        assert!(!json_str.contains("details"));
    }

    #[test]
    fn test_transition_trace_roundtrip() {
        let trace = TransitionTrace {
            rule_index: 1,
            condition: Some("steps.a.output.ok == true".to_string()),
            outcome: TransitionOutcome::Matched,
            next_step_id: Some("b".to_string()),
        };
        let json_str = serde_json::to_string(&trace).unwrap();
        assert!(json_str.contains("\"outcome\":\"MATCHED\""));
        assert!(json_str.contains("\"nextStepId\":\"b\""));
        let parsed: TransitionTrace = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.rule_index, 1);
        assert_eq!(parsed.outcome, TransitionOutcome::Matched);
    }
}
