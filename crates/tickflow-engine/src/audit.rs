//! Execution audit trail.
//!
//! Every step attempt produces a full record (rendered config, handler
//! input, output, events, trace) written to the pointer store under a
//! stable per-execution key, plus a size-capped summary row for the
//! metadata sink. Writes are fire-and-forget on a spawned task: audit
//! failures degrade to warnings and never fail or slow the step that
//! produced them. [`ExecutionAuditLog::flush`] awaits outstanding writes,
//! which tests and shutdown paths rely on; between flushes, handles of
//! finished writes are dropped as new entries are queued, keeping the
//! backlog bounded.
//!
//! Suppression: branches created with `logging_enabled: false` skip
//! COMPLETED and RETRYING entries. FAILED entries are always written, so a
//! failure is never silently dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tickflow_types::error::FlowErrorInfo;
use tickflow_types::event::{MappingEvent, TransitionTrace};
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::{FlowStatus, RuntimeState};

use crate::ports::{MetadataSink, PointerStore};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// How a step attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepDisposition {
    Completed,
    Failed,
    Retrying,
}

impl StepDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepDisposition::Completed => "COMPLETED",
            StepDisposition::Failed => "FAILED",
            StepDisposition::Retrying => "RETRYING",
        }
    }
}

/// Full record of one step attempt, stored in the pointer store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAuditRecord {
    pub flow_execution_id: Uuid,
    pub flow_id: String,
    pub step_instance_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub disposition: StepDisposition,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_events: Vec<MappingEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transition_trace: Vec<TransitionTrace>,
}

impl StepAuditRecord {
    /// Storage key for this record. Attempts are zero-padded so keys list
    /// in execution order.
    pub fn storage_key(&self) -> String {
        format!(
            "executions/{}/steps/{}/{:03}-{}.json",
            self.flow_execution_id,
            self.step_instance_id,
            self.attempt,
            self.disposition.as_str()
        )
    }

    fn into_summary(self, record_pointer: Option<BlobPointer>, error_cap: usize) -> StepAuditSummary {
        let duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        StepAuditSummary {
            flow_execution_id: self.flow_execution_id,
            flow_id: self.flow_id,
            step_instance_id: self.step_instance_id,
            attempt: self.attempt,
            disposition: self.disposition,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms,
            handler: self.handler,
            error_summary: self
                .error
                .map(|e| truncate_chars(&format!("{}: {}", e.error_name, e.error_message), error_cap)),
            record_pointer,
        }
    }
}

/// Size-capped row for the metadata sink. Full detail stays in the pointer
/// store behind `record_pointer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAuditSummary {
    pub flow_execution_id: Uuid,
    pub flow_id: String,
    pub step_instance_id: String,
    pub attempt: u32,
    pub disposition: StepDisposition,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_pointer: Option<BlobPointer>,
}

/// Creation row for a new execution, written when the execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAuditRecord {
    pub flow_execution_id: Uuid,
    pub flow_id: String,
    pub flow_version: semver::Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionAuditLog
// ---------------------------------------------------------------------------

/// Asynchronous audit writer shared across engine components.
#[derive(Debug)]
pub struct ExecutionAuditLog<S, M> {
    store: S,
    sink: M,
    error_summary_cap: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, M> ExecutionAuditLog<S, M>
where
    S: PointerStore + Clone + 'static,
    M: MetadataSink + Clone + 'static,
{
    pub fn new(store: S, sink: M, error_summary_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            sink,
            error_summary_cap,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Queue one step attempt for writing. Returns immediately; the write
    /// happens on a spawned task.
    pub async fn log_step_execution(&self, record: StepAuditRecord, logging_enabled: bool) {
        if !logging_enabled && record.disposition != StepDisposition::Failed {
            return;
        }

        let store = self.store.clone();
        let sink = self.sink.clone();
        let error_cap = self.error_summary_cap;
        let handle = tokio::spawn(async move {
            let key = record.storage_key();
            let bytes = match serde_json::to_vec(&record) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(key, error = %e, "audit record failed to serialize");
                    return;
                }
            };
            let pointer = match store.put_at(&key, bytes, Some("application/json")).await {
                Ok(pointer) => Some(pointer),
                Err(e) => {
                    tracing::warn!(key, error = %e, "audit record write failed");
                    None
                }
            };
            let summary = record.into_summary(pointer, error_cap);
            if let Err(e) = sink.log_step(summary).await {
                tracing::warn!(key, error = %e, "step summary write failed");
            }
        });
        // drop handles of writes that already finished; a long-running
        // scheduler may never call flush
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Record that an execution exists. Awaited inline so the row is
    /// visible before any step entries reference it.
    pub async fn flow_started(&self, state: &RuntimeState) {
        let record = FlowAuditRecord {
            flow_execution_id: state.flow_execution_id,
            flow_id: state.flow_id.clone(),
            flow_version: state.flow_version.clone(),
            branch_id: state.branch.as_ref().map(|b| b.branch_id.clone()),
            parent_execution_id: state.branch.as_ref().map(|b| b.parent_execution_id),
            started_at: Utc::now(),
        };
        if let Err(e) = self.sink.create_flow_record(record).await {
            tracing::warn!(
                flow_execution_id = %state.flow_execution_id,
                error = %e,
                "execution record write failed"
            );
        }
    }

    /// Record the terminal status of an execution.
    pub async fn flow_finished(
        &self,
        flow_execution_id: Uuid,
        status: FlowStatus,
        error: Option<FlowErrorInfo>,
    ) {
        if let Err(e) = self
            .sink
            .update_final_status(flow_execution_id, status, error)
            .await
        {
            tracing::warn!(
                flow_execution_id = %flow_execution_id,
                error = %e,
                "final status write failed"
            );
        }
    }

    /// Await every queued step write.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "audit task panicked");
            }
        }
    }
}

/// Char-boundary-safe truncation with a marker suffix.
fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let kept: String = s.chars().take(cap).collect();
    format!("{kept}…[truncated]")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, RecordingSink};
    use serde_json::json;
    use tickflow_types::error::error_names;

    fn record(disposition: StepDisposition, attempt: u32) -> StepAuditRecord {
        let started = Utc::now();
        StepAuditRecord {
            flow_execution_id: Uuid::now_v7(),
            flow_id: "order-fulfillment".to_string(),
            step_instance_id: "charge".to_string(),
            attempt,
            disposition,
            started_at: started,
            finished_at: started + chrono::Duration::milliseconds(40),
            handler: Some("payments".to_string()),
            rendered_config: Some(json!({"amount": 10})),
            handler_input: Some(json!({"order": "o-1"})),
            output: Some(json!({"charged": true})),
            side_meta: None,
            error: None,
            mapping_events: vec![],
            transition_trace: vec![],
        }
    }

    #[test]
    fn test_storage_key_orders_attempts() {
        let entry = record(StepDisposition::Retrying, 2);
        let key = entry.storage_key();
        assert!(key.starts_with(&format!("executions/{}/steps/charge/", entry.flow_execution_id)));
        assert!(key.ends_with("002-RETRYING.json"));
    }

    #[tokio::test]
    async fn test_full_record_written_and_summarized() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let log = ExecutionAuditLog::new(store.clone(), sink.clone(), 512);

        let entry = record(StepDisposition::Completed, 1);
        let key = entry.storage_key();
        log.log_step_execution(entry, true).await;
        log.flush().await;

        let bytes = store.get(&BlobPointer::new(key, 0)).await.unwrap();
        let stored: StepAuditRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored.output, Some(json!({"charged": true})));

        let summaries = sink.step_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].disposition, StepDisposition::Completed);
        assert_eq!(summaries[0].duration_ms, 40);
        assert!(summaries[0].record_pointer.is_some());
        assert!(summaries[0].error_summary.is_none());
    }

    #[tokio::test]
    async fn test_disabled_logging_suppresses_all_but_failures() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let log = ExecutionAuditLog::new(store.clone(), sink.clone(), 512);

        log.log_step_execution(record(StepDisposition::Completed, 1), false)
            .await;
        log.log_step_execution(record(StepDisposition::Retrying, 1), false)
            .await;
        let mut failed = record(StepDisposition::Failed, 2);
        failed.error = Some(FlowErrorInfo::terminal(
            error_names::HANDLER_FAILED,
            "card declined",
        ));
        log.log_step_execution(failed, false).await;
        log.flush().await;

        let summaries = sink.step_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].disposition, StepDisposition::Failed);
        assert_eq!(
            summaries[0].error_summary.as_deref(),
            Some("HANDLER_FAILED: card declined")
        );
        assert_eq!(store.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_writes_are_reaped_without_flush() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let log = ExecutionAuditLog::new(store, sink.clone(), 512);

        for attempt in 1..=20 {
            log.log_step_execution(record(StepDisposition::Completed, attempt), true)
                .await;
        }
        // wait for the writes to land, then give the runtime a beat to
        // retire the tasks themselves
        for _ in 0..200 {
            if sink.step_summaries().len() == 20 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        log.log_step_execution(record(StepDisposition::Completed, 21), true)
            .await;
        assert_eq!(log.tasks.lock().await.len(), 1);

        log.flush().await;
        assert_eq!(sink.step_summaries().len(), 21);
    }

    #[tokio::test]
    async fn test_error_summary_truncated() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let log = ExecutionAuditLog::new(store, sink.clone(), 32);

        let mut failed = record(StepDisposition::Failed, 1);
        failed.error = Some(FlowErrorInfo::terminal(
            error_names::HANDLER_FAILED,
            "x".repeat(500),
        ));
        log.log_step_execution(failed, true).await;
        log.flush().await;

        let summary = &sink.step_summaries()[0];
        let text = summary.error_summary.as_deref().unwrap();
        assert!(text.ends_with("…[truncated]"));
        assert_eq!(text.chars().count(), 32 + "…[truncated]".chars().count());
    }

    #[tokio::test]
    async fn test_flow_lifecycle_rows() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        let log = ExecutionAuditLog::new(store, sink.clone(), 512);

        let flow = crate::testing::flow_of("a", vec![crate::testing::end_step("a")]);
        let state = RuntimeState::fresh(&flow);
        log.flow_started(&state).await;
        log.flow_finished(state.flow_execution_id, FlowStatus::Completed, None)
            .await;

        assert_eq!(sink.flows.lock().unwrap().len(), 1);
        let finals = sink.final_statuses();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].1, FlowStatus::Completed);
    }
}
