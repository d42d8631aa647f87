//! The scheduler contract: invocation inputs and returned directives.
//!
//! Every interpreter call receives a [`RuntimeState`] plus at most one of a
//! resume payload, a polling result, or an aggregate batch, and returns the
//! updated state plus a [`Directive`] telling the scheduler what to do
//! next. Both sides are tagged unions so an invocation can never carry, say,
//! a resume payload and an aggregate batch at once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowErrorInfo;
use crate::flow::{AggregationConfig, BranchTemplate, StepInstance};
use crate::pointer::BlobPointer;
use crate::state::{FlowStatus, RuntimeState};

// ---------------------------------------------------------------------------
// Invocation input
// ---------------------------------------------------------------------------

/// One interpreter invocation as delivered by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterInvocation {
    pub state: RuntimeState,
    #[serde(default)]
    pub input: InvocationInput,
}

/// What kind of work this invocation delivers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "inputType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationInput {
    /// Execute the current step from scratch.
    #[default]
    Fresh,
    /// An async step's external callback arrived; `payload` is its output.
    Resume { payload: serde_json::Value },
    /// A polling step's status check result.
    PollResult { payload: serde_json::Value },
    /// All branches of a fan-out finished; aggregate this batch.
    Aggregate { results: Vec<BranchResult> },
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Instruction returned to the scheduler after one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
    /// Re-invoke immediately with the (already advanced) current step.
    Continue,
    /// Park the execution until an external resume payload arrives.
    Wait {
        /// Handler-provided correlation data (callback token, channel id).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Re-invoke with a polling result after the interval.
    #[serde(rename_all = "camelCase")]
    Poll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_seconds: Option<u64>,
    },
    /// Fan out branch executions, then deliver one aggregate batch.
    Fork(ForkDirective),
    /// A branch execution finished; route its result into the parent's
    /// pending aggregation batch.
    Aggregate { result: BranchResult },
    /// The execution reached a terminal status.
    Terminate {
        status: FlowStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FlowErrorInfo>,
    },
}

/// Fan-out instruction. In-memory mode carries the materialized branch
/// payloads; manifest mode defers iteration of an oversized collection to
/// the scheduler's bulk-item reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForkDirective {
    #[serde(rename_all = "camelCase")]
    Branches {
        branches: Vec<BranchExecutionPayload>,
        aggregation: AggregationConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Manifest {
        /// Pointer to the delimited item collection.
        items_pointer: BlobPointer,
        /// Templates to instantiate per item read from the manifest.
        branch_templates: Vec<BranchTemplate>,
        /// Context snapshot branches start from.
        base_context: serde_json::Value,
        aggregation: AggregationConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        /// The parallel step that requested this fan-out.
        fork_step_id: String,
    },
}

// ---------------------------------------------------------------------------
// Branch payloads and results
// ---------------------------------------------------------------------------

/// Everything the scheduler needs to start one branch execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchExecutionPayload {
    pub branch_id: String,
    /// The branch's entry step definition, carried so the payload is
    /// self-contained.
    pub step: StepInstance,
    /// Branch-scoped context copy with `currentItem`, `itemIndex`, and
    /// `branchId` injected.
    pub context: serde_json::Value,
    pub flow_id: String,
    pub flow_version: semver::Version,
    pub parent_execution_id: Uuid,
    pub root_execution_id: Uuid,
    pub logging_enabled: bool,
}

/// Outcome of one branch, matched by `branch_id` (delivery order is not
/// guaranteed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResult {
    pub branch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowErrorInfo>,
}

impl BranchResult {
    pub fn success(branch_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            branch_id: branch_id.into(),
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(branch_id: impl Into<String>, error: FlowErrorInfo) -> Self {
        Self {
            branch_id: branch_id.into(),
            output: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Branch id `<fork step>:<item index, zero-padded>:<template>`. The padded
/// index makes lexicographic branch-id order equal item order, which is what
/// keeps COLLECT_ARRAY output deterministic.
pub fn format_branch_id(fork_step_id: &str, item_index: usize, template_id: &str) -> String {
    format!("{fork_step_id}:{item_index:05}:{template_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_input_defaults_to_fresh() {
        let parsed: InvocationInput = serde_json::from_str(r#"{"inputType":"FRESH"}"#).unwrap();
        assert!(matches!(parsed, InvocationInput::Fresh));
        assert!(matches!(InvocationInput::default(), InvocationInput::Fresh));
    }

    #[test]
    fn test_invocation_input_variants_wire_tags() {
        let resume = InvocationInput::Resume {
            payload: json!({"approved": true}),
        };
        let json_str = serde_json::to_string(&resume).unwrap();
        assert!(json_str.contains("\"inputType\":\"RESUME\""));

        let aggregate = InvocationInput::Aggregate {
            results: vec![BranchResult::success("f:00000:b", json!(1))],
        };
        let json_str = serde_json::to_string(&aggregate).unwrap();
        assert!(json_str.contains("\"inputType\":\"AGGREGATE\""));
        assert!(json_str.contains("\"branchId\":\"f:00000:b\""));
    }

    #[test]
    fn test_directive_wire_tags() {
        let wait = Directive::Wait {
            payload: Some(json!({"token": "cb-123"})),
        };
        let json_str = serde_json::to_string(&wait).unwrap();
        assert!(json_str.contains("\"directive\":\"WAIT\""));

        let poll = Directive::Poll {
            payload: None,
            interval_seconds: Some(30),
        };
        let json_str = serde_json::to_string(&poll).unwrap();
        assert!(json_str.contains("\"directive\":\"POLL\""));
        assert!(json_str.contains("\"intervalSeconds\":30"));
        assert!(!json_str.contains("payload"));

        let terminate = Directive::Terminate {
            status: FlowStatus::Completed,
            error: None,
        };
        let json_str = serde_json::to_string(&terminate).unwrap();
        assert!(json_str.contains("\"directive\":\"TERMINATE\""));
        assert!(json_str.contains("\"status\":\"COMPLETED\""));
    }

    #[test]
    fn test_fork_directive_manifest_mode_roundtrip() {
        let fork = ForkDirective::Manifest {
            items_pointer: BlobPointer::new("manifests/batch-1.jsonl", 10_485_760),
            branch_templates: vec![],
            base_context: json!({"steps": {}}),
            aggregation: serde_json::from_value(json!({})).unwrap(),
            max_concurrency: Some(16),
            fork_step_id: "split".to_string(),
        };
        let json_str = serde_json::to_string(&fork).unwrap();
        assert!(json_str.contains("\"mode\":\"MANIFEST\""));
        assert!(json_str.contains("\"itemsPointer\""));
        assert!(json_str.contains("\"forkStepId\":\"split\""));
        let parsed: ForkDirective = serde_json::from_str(&json_str).unwrap();
        assert!(matches!(parsed, ForkDirective::Manifest { .. }));
    }

    #[test]
    fn test_branch_result_constructors() {
        let ok = BranchResult::success("s:00001:t", json!({"n": 1}));
        assert!(!ok.is_error());
        let failed = BranchResult::failure(
            "s:00002:t",
            FlowErrorInfo::terminal("HANDLER_FAILED", "boom"),
        );
        assert!(failed.is_error());
        assert!(failed.output.is_none());
    }

    #[test]
    fn test_branch_id_order_matches_item_order() {
        let ids: Vec<String> = [0usize, 2, 10, 99999]
            .iter()
            .map(|i| format_branch_id("split", *i, "t"))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids[1], "split:00002:t");
    }
}
