//! Flow definition types for Tickflow.
//!
//! A flow is a versioned, immutable graph of steps with one start step.
//! Definitions are authored outside the engine, published once, and loaded
//! read-only per (id, version); the interpreter never mutates them. Steps
//! carry their mappings, transitions, and error policy inline so a single
//! `StepInstance` is everything an invocation needs besides runtime state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// An immutable, versioned flow definition.
///
/// Published definitions never change; a new behavior is a new version.
/// This makes the definition safely cacheable per process (§`DefinitionCache`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Stable flow identifier (e.g. "order-fulfillment").
    pub id: String,
    /// Definition version. Loads are always pinned to an exact version.
    pub version: semver::Version,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the step every fresh execution starts at.
    pub start_step_id: String,
    /// Steps keyed by their id. Keys must match `StepInstance::id`.
    pub steps: BTreeMap<String, StepInstance>,
    /// Opaque actions the scheduler performs after the flow terminates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completion_actions: Vec<CompletionAction>,
}

impl FlowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepInstance> {
        self.steps.get(step_id)
    }
}

/// An opaque post-completion action (notify, archive, ...). The engine only
/// transports these; the scheduler interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionAction {
    pub action_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Step Instance
// ---------------------------------------------------------------------------

/// One node of the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    /// Step id, unique within the flow.
    pub id: String,
    /// What kind of step this is and how it executes.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Handler configuration. String leaves may embed `{{...}}` templates,
    /// rendered against the merged context right before handler invocation.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    /// Target path in the handler input -> source path in context data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mappings: BTreeMap<String, String>,
    /// Declarative template-context mappings, built right before the step's
    /// config templates are rendered and merged into the render context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_mappings: Vec<TemplateMapping>,
    /// Target path in the handler input -> literal value, overlaid after
    /// `input_mappings`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub literals: BTreeMap<String, serde_json::Value>,
    /// Target context path -> source path inside the handler output.
    /// Empty means identity: the whole output lands under
    /// `steps.<step_id>.output`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mappings: BTreeMap<String, String>,
    /// Ordered transition rules; the first rule whose condition is truthy
    /// wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRule>,
    /// Successor when no transition rule matches. Absent -> end of path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step_id: Option<String>,
    /// Error policy: content-retry bound and terminal fallback target.
    #[serde(default, skip_serializing_if = "OnErrorPolicy::is_empty")]
    pub on_error: OnErrorPolicy,
    /// Optional pre/post execution delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySpec>,
    /// Opt out of offloading oversized output to blob storage.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_offload: bool,
    /// Opt out of dereferencing pointers while building handler input.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_input_hydration: bool,
    /// Semantic checks applied to the handler output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_validation: Option<OutputValidation>,
}

impl StepInstance {
    /// Handler name for handler-backed kinds, `None` for `Parallel`/`End`.
    pub fn handler_name(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Task { handler }
            | StepKind::AsyncTask { handler }
            | StepKind::PollingTask { handler } => Some(handler),
            StepKind::Parallel { .. } | StepKind::End => None,
        }
    }
}

/// The kind of step, tagged by `stepType` on the wire.
///
/// Modeled as a union so a parallel step cannot carry a handler name and an
/// end step cannot carry branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Ordinary synchronous handler; the flow continues when it returns.
    Task { handler: String },
    /// Handler arranges an external callback; the execution parks on a
    /// `wait` directive until the scheduler delivers a resume payload.
    AsyncTask { handler: String },
    /// Handler starts a long-running operation; the scheduler re-invokes
    /// with a polling result until the handler reports completion.
    PollingTask { handler: String },
    /// Fork manager: fans out branches over a collection and aggregates.
    #[serde(rename_all = "camelCase")]
    Parallel {
        /// Path to the collection to iterate. A pointer-valued result
        /// switches fan-out to manifest mode.
        items_path: String,
        /// Branch templates instantiated per item.
        branches: Vec<BranchTemplate>,
        /// How branch results are combined.
        aggregation: AggregationConfig,
    },
    /// Terminal step: closes the path.
    End,
}

/// One branch template of a parallel step. Each eligible (item, template)
/// pair becomes a child execution of the same flow starting at
/// `entry_step_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchTemplate {
    /// Template id, unique within the parallel step.
    pub id: String,
    /// Optional eligibility condition evaluated per item against
    /// `{...context, currentItem, itemIndex}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step the branch execution starts at.
    pub entry_step_id: String,
    /// Whether branch step executions write audit entries.
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// One ordered transition rule. `condition: None` is unconditionally true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub next_step_id: String,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// Per-step error policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnErrorPolicy {
    /// Bounded retry for content-retryable failures (required-field check,
    /// handler-declared content errors). Absent -> no content retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_content_error: Option<ContentRetryPolicy>,
    /// Step to redirect to when a terminal error reaches the resolver.
    /// Absent -> the flow fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
}

impl OnErrorPolicy {
    pub fn is_empty(&self) -> bool {
        self.retry_on_content_error.is_none() && self.fallback_step_id.is_none()
    }
}

/// Bounded content-retry policy. `count` is the total number of attempts,
/// including the first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRetryPolicy {
    #[serde(default = "default_retry_count")]
    pub count: u32,
}

fn default_retry_count() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Delays
// ---------------------------------------------------------------------------

/// Fixed or random-in-range execution delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelaySpec {
    /// Whether the delay runs before or after the handler (default after).
    #[serde(default)]
    pub position: DelayPosition,
    /// Fixed delay in seconds. Ignored when `range` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    /// Random delay drawn uniformly from `[min_seconds, max_seconds]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<DelayRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayPosition {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRange {
    pub min_seconds: u64,
    pub max_seconds: u64,
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

/// Semantic checks applied to handler output before mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputValidation {
    /// Paths that must resolve present and non-null in the output.
    /// A miss raises a content-retryable error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// Template mappings
// ---------------------------------------------------------------------------

/// One declarative mapping consumed by the template engine's
/// `build_context`: resolve `source_json_path` (always hydrating), optionally
/// narrow to `select_fields`, then format per `format_as`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMapping {
    /// Key the formatted value is stored under in the template context.
    pub context_key: String,
    /// Source path resolved against context data.
    pub source_json_path: String,
    /// For object or array-of-objects sources, keep only these fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_fields: Option<Vec<String>>,
    #[serde(default)]
    pub format_as: MappingFormat,
    /// Rendered once per item for `CUSTOM_STRING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_template: Option<String>,
    /// Joins rendered items for `CUSTOM_STRING` (default "\n").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_separator: Option<String>,
}

/// How a resolved mapping value lands in the template context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingFormat {
    /// Pass the resolved value through unchanged.
    #[default]
    Raw,
    /// Compact JSON string.
    Json,
    /// Per-item template rendering joined by `join_separator`; requires an
    /// array source and `item_template`.
    CustomString,
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// How branch results are combined after a parallel fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,
    /// Fail the whole flow if any branch errored (default true).
    #[serde(default = "default_true")]
    pub fail_on_branch_error: bool,
    /// Upper bound on concurrently running branches, enforced by the
    /// scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Path extracted from each branch output before combining. Absent ->
    /// the whole branch output is aggregated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::default(),
            fail_on_branch_error: true,
            max_concurrency: None,
            data_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStrategy {
    /// Array in branch-id order; tolerated failures appear as
    /// `{branchId, error}` entries.
    #[default]
    CollectArray,
    /// Shallow merge of successful object outputs plus a `branchErrors`
    /// side channel.
    MergeObjects,
    /// Numeric sum. Branch errors are silently excluded when tolerated --
    /// known limitation, kept as specified.
    Sum,
    /// Reserved; currently degrades to `CollectArray`.
    Custom,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
