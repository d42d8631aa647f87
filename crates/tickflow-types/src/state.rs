//! Runtime state for one flow (or branch) execution.
//!
//! The state is the only memory that survives between interpreter
//! invocations: the scheduler persists it after every call and hands a
//! private copy to the next one. Everything invocation-local lives in the
//! [`InvocationScratch`] area, which is `#[serde(skip)]` and additionally
//! reset before the state is returned, so it can never leak across calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowErrorInfo;
use crate::event::{MappingEvent, TransitionTrace};
use crate::flow::FlowDefinition;

// ---------------------------------------------------------------------------
// Flow status
// ---------------------------------------------------------------------------

/// Overall status of an execution. Exactly one of these at all times; once
/// non-`Running`, `current_step_instance_id` never advances again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Branch identity
// ---------------------------------------------------------------------------

/// Present only on branch executions spawned by a parallel fan-out.
/// Identifies where the branch's result must be routed at path end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchIdentity {
    /// Branch id, unique within the parent's fan-out batch.
    pub branch_id: String,
    /// Execution that forked this branch.
    pub parent_execution_id: Uuid,
    /// Top-most execution of the whole tree (equals parent for depth-1).
    pub root_execution_id: Uuid,
    /// Whether this branch writes step audit entries.
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Serializable memory threaded through invocations for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    /// UUIDv7 execution id, assigned at flow start.
    pub flow_execution_id: Uuid,
    /// Definition this execution runs.
    pub flow_id: String,
    pub flow_version: semver::Version,
    pub status: FlowStatus,
    /// Step the next fresh invocation executes. Absent -> path ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_instance_id: Option<String>,
    /// Nested working memory steps read from and write into.
    #[serde(default = "empty_object")]
    pub current_context_data: serde_json::Value,
    /// Content-retry counters per step id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_retry_attempts: BTreeMap<String, u32>,
    /// Branch identity, present only on branch executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchIdentity>,
    /// Structured error once the execution has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<FlowErrorInfo>,
    /// Invocation-local scratch. Never serialized, reset on every return.
    #[serde(skip)]
    pub scratch: InvocationScratch,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl RuntimeState {
    /// State for a fresh execution of `flow`, positioned at its start step.
    pub fn fresh(flow: &FlowDefinition) -> Self {
        Self {
            flow_execution_id: Uuid::now_v7(),
            flow_id: flow.id.clone(),
            flow_version: flow.version.clone(),
            status: FlowStatus::Running,
            current_step_instance_id: Some(flow.start_step_id.clone()),
            current_context_data: empty_object(),
            step_retry_attempts: BTreeMap::new(),
            branch: None,
            error_info: None,
            scratch: InvocationScratch::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    /// Content-retry attempts recorded so far for `step_id` (0 if none).
    pub fn retry_attempts(&self, step_id: &str) -> u32 {
        self.step_retry_attempts.get(step_id).copied().unwrap_or(0)
    }

    /// Increment and return the content-retry counter for `step_id`.
    pub fn bump_retry_attempts(&mut self, step_id: &str) -> u32 {
        let counter = self.step_retry_attempts.entry(step_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Mark the execution failed. The current step is frozen to `None` so
    /// the position can never advance past a terminal status.
    pub fn mark_failed(&mut self, error: FlowErrorInfo) {
        self.status = FlowStatus::Failed;
        self.current_step_instance_id = None;
        self.error_info = Some(error);
    }

    /// Mark the execution completed at the end of its path.
    pub fn mark_completed(&mut self) {
        self.status = FlowStatus::Completed;
        self.current_step_instance_id = None;
    }

    /// Drop everything invocation-local. Runs on every return path so
    /// scratch never leaves the process even in-memory.
    pub fn strip_scratch(&mut self) {
        self.scratch = InvocationScratch::default();
    }
}

// ---------------------------------------------------------------------------
// Invocation scratch
// ---------------------------------------------------------------------------

/// Private per-invocation working area. Meaningless across invocations.
#[derive(Debug, Clone, Default)]
pub struct InvocationScratch {
    /// Mapping events collected while resolving/templating this invocation.
    pub mapping_events: Vec<MappingEvent>,
    /// Transition evaluation trace for the step that just ran.
    pub transition_trace: Vec<TransitionTrace>,
    /// Set once a failure audit entry has been written, so terminal errors
    /// are never logged twice nor silently dropped.
    pub failure_logged: bool,
}

impl InvocationScratch {
    pub fn record_event(&mut self, event: MappingEvent) {
        self.mapping_events.push(event);
    }

    pub fn record_events(&mut self, events: impl IntoIterator<Item = MappingEvent>) {
        self.mapping_events.extend(events);
    }

    /// Move the collected events out (for the audit entry).
    pub fn take_events(&mut self) -> Vec<MappingEvent> {
        std::mem::take(&mut self.mapping_events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
