//! Async ports implemented by the infrastructure layer.
//!
//! The engine depends only on these traits, never on a concrete store or
//! database. Implementations live in `tickflow-infra`; tests use in-memory
//! stand-ins.

use std::future::Future;

use serde_json::Value;
use tickflow_types::error::{DefinitionError, FlowErrorInfo, SinkError, StoreError};
use tickflow_types::flow::{FlowDefinition, StepInstance};
use tickflow_types::pointer::BlobPointer;

use crate::audit::{FlowAuditRecord, StepAuditSummary};

// ---------------------------------------------------------------------------
// Pointer store
// ---------------------------------------------------------------------------

/// Blob storage for oversized values and full audit records.
pub trait PointerStore: Send + Sync {
    /// Store `bytes` under a store-generated key.
    fn put(
        &self,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> impl Future<Output = Result<BlobPointer, StoreError>> + Send;

    /// Store `bytes` under a caller-chosen key. Audit records use stable
    /// per-execution keys so they can be found without an index.
    fn put_at(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> impl Future<Output = Result<BlobPointer, StoreError>> + Send;

    fn get(
        &self,
        pointer: &BlobPointer,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Definition loading
// ---------------------------------------------------------------------------

/// Loads published flow definitions by id and exact version.
pub trait DefinitionLoader: Send + Sync {
    fn load(
        &self,
        flow_id: &str,
        version: &semver::Version,
    ) -> impl Future<Output = Result<FlowDefinition, DefinitionError>> + Send;
}

// ---------------------------------------------------------------------------
// Metadata sink
// ---------------------------------------------------------------------------

/// Receives size-capped execution summaries. The full records live in the
/// pointer store; this sink only gets enough to list and filter executions.
pub trait MetadataSink: Send + Sync {
    fn log_step(
        &self,
        summary: StepAuditSummary,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn create_flow_record(
        &self,
        record: FlowAuditRecord,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn update_final_status(
        &self,
        flow_execution_id: uuid::Uuid,
        status: tickflow_types::state::FlowStatus,
        error: Option<FlowErrorInfo>,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

// ---------------------------------------------------------------------------
// Bulk item reader
// ---------------------------------------------------------------------------

/// Iterates a pointer to a large delimited collection without loading it
/// into process memory. Used by the scheduler for manifest-mode fan-outs.
pub trait BulkItemReader: Send + Sync {
    /// Read up to `limit` items starting at `offset`.
    fn read_items(
        &self,
        pointer: &BlobPointer,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Value>, StoreError>> + Send;

    fn count_items(
        &self,
        pointer: &BlobPointer,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Safety validation
// ---------------------------------------------------------------------------

/// Verdict of a content-safety check over handler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Pass,
    Violation { reason: String },
}

/// Validator infrastructure failure. Treated as transport-retryable: the
/// check itself could not run, which says nothing about the content.
#[derive(Debug, thiserror::Error)]
#[error("safety validator unavailable: {0}")]
pub struct ValidatorUnavailable(pub String);

/// External content-safety check applied to handler output.
pub trait SafetyValidator: Send + Sync {
    fn validate(
        &self,
        step_id: &str,
        output: &Value,
    ) -> impl Future<Output = Result<SafetyVerdict, ValidatorUnavailable>> + Send;
}

// ---------------------------------------------------------------------------
// Terminal-error routing
// ---------------------------------------------------------------------------

/// What to do with an execution after a terminal step failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalDecision {
    /// Redirect to a fallback step; the flow stays RUNNING.
    Fallback { next_step_id: String },
    /// Mark the flow FAILED.
    Fail,
}

/// Decides between fallback redirection and flow failure once a step has
/// failed terminally. The default policy lives in [`crate::recovery`].
pub trait TerminalErrorResolver: Send + Sync {
    fn resolve(
        &self,
        flow: &FlowDefinition,
        step: Option<&StepInstance>,
        error: &FlowErrorInfo,
    ) -> impl Future<Output = TerminalDecision> + Send;
}
