//! In-memory metadata sink.
//!
//! [`RecordingMetadataSink`] keeps everything it receives in shared
//! vectors. Integration tests and demos assert against it instead of
//! standing up a database; clones share the same buffers.

use std::sync::{Arc, Mutex};

use tickflow_engine::audit::{FlowAuditRecord, StepAuditSummary};
use tickflow_engine::ports::MetadataSink;
use tickflow_types::error::{FlowErrorInfo, SinkError};
use tickflow_types::state::FlowStatus;
use uuid::Uuid;

/// [`MetadataSink`] that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetadataSink {
    steps: Arc<Mutex<Vec<StepAuditSummary>>>,
    flows: Arc<Mutex<Vec<FlowAuditRecord>>>,
    finals: Arc<Mutex<Vec<(Uuid, FlowStatus, Option<FlowErrorInfo>)>>>,
}

impl RecordingMetadataSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_summaries(&self) -> Vec<StepAuditSummary> {
        self.steps.lock().unwrap().clone()
    }

    pub fn flow_records(&self) -> Vec<FlowAuditRecord> {
        self.flows.lock().unwrap().clone()
    }

    pub fn final_statuses(&self) -> Vec<(Uuid, FlowStatus, Option<FlowErrorInfo>)> {
        self.finals.lock().unwrap().clone()
    }
}

impl MetadataSink for RecordingMetadataSink {
    async fn log_step(&self, summary: StepAuditSummary) -> Result<(), SinkError> {
        self.steps.lock().unwrap().push(summary);
        Ok(())
    }

    async fn create_flow_record(&self, record: FlowAuditRecord) -> Result<(), SinkError> {
        self.flows.lock().unwrap().push(record);
        Ok(())
    }

    async fn update_final_status(
        &self,
        flow_execution_id: Uuid,
        status: FlowStatus,
        error: Option<FlowErrorInfo>,
    ) -> Result<(), SinkError> {
        self.finals
            .lock()
            .unwrap()
            .push((flow_execution_id, status, error));
        Ok(())
    }
}
