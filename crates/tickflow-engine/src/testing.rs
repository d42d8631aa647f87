//! Shared in-memory test doubles and flow fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::{json, Value};
use tickflow_types::error::{DefinitionError, FlowErrorInfo, SinkError, StoreError};
use tickflow_types::flow::{FlowDefinition, StepInstance, StepKind};
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::FlowStatus;
use uuid::Uuid;

use crate::audit::{FlowAuditRecord, StepAuditSummary};
use crate::handler::{HandlerError, HandlerInput, HandlerOutcome, StepHandler};
use crate::ports::{
    DefinitionLoader, MetadataSink, PointerStore, SafetyValidator, SafetyVerdict,
    ValidatorUnavailable,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// DashMap-backed [`PointerStore`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Drop a blob so its pointer dangles.
    pub(crate) fn remove(&self, key: &str) {
        self.blobs.remove(key);
    }
}

impl PointerStore for MemoryStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<BlobPointer, StoreError> {
        let key = format!("values/{}", Uuid::now_v7());
        self.put_at(&key, bytes, content_type).await
    }

    async fn put_at(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<BlobPointer, StoreError> {
        let mut pointer = BlobPointer::new(key, bytes.len() as u64);
        pointer.content_type = content_type.map(str::to_string);
        self.blobs.insert(key.to_string(), bytes);
        Ok(pointer)
    }

    async fn get(&self, pointer: &BlobPointer) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(&pointer.key)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::NotFound(pointer.key.clone()))
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// [`MetadataSink`] that records everything it receives.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSink {
    pub(crate) steps: Arc<Mutex<Vec<StepAuditSummary>>>,
    pub(crate) flows: Arc<Mutex<Vec<FlowAuditRecord>>>,
    pub(crate) finals: Arc<Mutex<Vec<(Uuid, FlowStatus, Option<FlowErrorInfo>)>>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn step_summaries(&self) -> Vec<StepAuditSummary> {
        self.steps.lock().unwrap().clone()
    }

    pub(crate) fn final_statuses(&self) -> Vec<(Uuid, FlowStatus, Option<FlowErrorInfo>)> {
        self.finals.lock().unwrap().clone()
    }
}

impl MetadataSink for RecordingSink {
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

// ---------------------------------------------------------------------------
// FnHandler
// ---------------------------------------------------------------------------

/// Closure-backed [`StepHandler`].
pub(crate) struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(HandlerInput) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    pub(crate) fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> StepHandler for FnHandler<F>
where
    F: Fn(HandlerInput) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutcome, HandlerError> {
        (self.f)(input)
    }
}

/// Handler that completes with a fixed output.
pub(crate) fn fixed_output_handler(
    name: &str,
    output: Value,
) -> FnHandler<impl Fn(HandlerInput) -> Result<HandlerOutcome, HandlerError> + Send + Sync> {
    FnHandler::new(name, move |_input| {
        Ok(HandlerOutcome::Completed {
            output: output.clone(),
            side_meta: None,
        })
    })
}

// ---------------------------------------------------------------------------
// StaticValidator
// ---------------------------------------------------------------------------

/// [`SafetyValidator`] with a canned verdict, counting invocations.
#[derive(Debug, Clone)]
pub(crate) struct StaticValidator {
    verdict: SafetyVerdict,
    unavailable: Option<String>,
    pub(crate) calls: Arc<AtomicUsize>,
}

impl StaticValidator {
    pub(crate) fn passing() -> Self {
        Self {
            verdict: SafetyVerdict::Pass,
            unavailable: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn rejecting(reason: &str) -> Self {
        Self {
            verdict: SafetyVerdict::Violation {
                reason: reason.to_string(),
            },
            unavailable: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn unavailable(message: &str) -> Self {
        Self {
            verdict: SafetyVerdict::Pass,
            unavailable: Some(message.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SafetyValidator for StaticValidator {
    async fn validate(
        &self,
        _step_id: &str,
        _output: &Value,
    ) -> Result<SafetyVerdict, ValidatorUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.unavailable {
            Some(message) => Err(ValidatorUnavailable(message.clone())),
            None => Ok(self.verdict.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MapLoader
// ---------------------------------------------------------------------------

/// [`DefinitionLoader`] over a fixed map, counting load calls.
#[derive(Debug, Clone, Default)]
pub(crate) struct MapLoader {
    flows: HashMap<(String, semver::Version), FlowDefinition>,
    pub(crate) calls: Arc<AtomicUsize>,
}

impl MapLoader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows
            .insert((flow.id.clone(), flow.version.clone()), flow);
        self
    }

    pub(crate) fn load_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DefinitionLoader for MapLoader {
    async fn load(
        &self,
        flow_id: &str,
        version: &semver::Version,
    ) -> Result<FlowDefinition, DefinitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.flows
            .get(&(flow_id.to_string(), version.clone()))
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound {
                flow_id: flow_id.to_string(),
                version: version.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// Flow fixtures
// ---------------------------------------------------------------------------

pub(crate) fn task_step(id: &str, handler: &str) -> StepInstance {
    StepInstance {
        id: id.to_string(),
        kind: StepKind::Task {
            handler: handler.to_string(),
        },
        config: json!({}),
        input_mappings: Default::default(),
        template_mappings: vec![],
        literals: Default::default(),
        output_mappings: Default::default(),
        transitions: vec![],
        default_next_step_id: None,
        on_error: Default::default(),
        delay: None,
        skip_offload: false,
        skip_input_hydration: false,
        output_validation: None,
    }
}

pub(crate) fn end_step(id: &str) -> StepInstance {
    StepInstance {
        kind: StepKind::End,
        ..task_step(id, "")
    }
}

/// A flow from the given steps, starting at `start`.
pub(crate) fn flow_of(start: &str, steps: Vec<StepInstance>) -> FlowDefinition {
    FlowDefinition {
        id: "test-flow".to_string(),
        version: semver::Version::new(1, 0, 0),
        name: None,
        start_step_id: start.to_string(),
        steps: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
        completion_actions: vec![],
    }
}
