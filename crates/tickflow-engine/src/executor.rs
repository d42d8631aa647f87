//! Single-step execution pipeline.
//!
//! [`StepExecutor`] runs the whole life of one handler-backed attempt: delay,
//! input build, config render, handler invocation, output validation, offload,
//! output mapping, transition resolution, and the audit entry. It mutates the
//! execution's context data but never moves the step cursor; the interpreter
//! owns the graph walk. Parallel fan-out and end steps never reach this
//! module, only the aggregated result of a parallel step does.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Map, Value};
use tickflow_types::error::{error_names, FlowErrorInfo};
use tickflow_types::event::{MappingEvent, MappingEventStatus};
use tickflow_types::flow::{DelayPosition, StepInstance};
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::RuntimeState;

use crate::audit::{ExecutionAuditLog, StepAuditRecord, StepDisposition};
use crate::condition::ConditionEvaluator;
use crate::error::StepFailure;
use crate::handler::{HandlerInput, HandlerOutcome, HandlerRegistry};
use crate::ports::{MetadataSink, PointerStore, SafetyValidator, SafetyVerdict};
use crate::settings::EngineSettings;
use crate::template::TemplateEngine;
use crate::transition;
use crate::value::offload;
use crate::value::resolver::{set_by_path, ValueResolver};

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// How a step attempt ended, short of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum StepCompletion {
    /// The step finished and its transition was resolved. `None` means the
    /// current path has no successor.
    Advanced { next_step_id: Option<String> },
    /// An async task parked; the execution waits for an external callback.
    Parked { payload: Option<Value> },
    /// A polling task is still running; re-invoke later with this payload.
    Polling {
        payload: Value,
        interval_seconds: Option<u64>,
    },
}

/// Values captured along the pipeline for the audit record. Filled in as the
/// attempt progresses so a failure entry carries everything produced up to
/// the point of failure.
#[derive(Debug)]
struct AttemptCapture {
    /// 1-based attempt number.
    attempt: u32,
    started_at: DateTime<Utc>,
    rendered_config: Option<Value>,
    handler_input: Option<Value>,
    output: Option<Value>,
    side_meta: Option<Value>,
}

impl AttemptCapture {
    fn begin(attempt: u32) -> Self {
        Self {
            attempt,
            started_at: Utc::now(),
            rendered_config: None,
            handler_input: None,
            output: None,
            side_meta: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor<S, M, V> {
    resolver: ValueResolver<S>,
    templates: TemplateEngine<S>,
    conditions: ConditionEvaluator,
    handlers: Arc<HandlerRegistry>,
    audit: Arc<ExecutionAuditLog<S, M>>,
    validator: Option<V>,
    settings: EngineSettings,
}

impl<S, M, V> StepExecutor<S, M, V>
where
    S: PointerStore + Clone + 'static,
    M: MetadataSink + Clone + 'static,
    V: SafetyValidator,
{
    pub fn new(
        resolver: ValueResolver<S>,
        templates: TemplateEngine<S>,
        handlers: Arc<HandlerRegistry>,
        audit: Arc<ExecutionAuditLog<S, M>>,
        validator: Option<V>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            resolver,
            templates,
            conditions: ConditionEvaluator::new(),
            handlers,
            audit,
            validator,
            settings,
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run one attempt of a handler-backed step. `poll_payload` carries the
    /// previous pending payload when re-invoking a polling task.
    pub async fn execute_step(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        poll_payload: Option<Value>,
    ) -> Result<StepCompletion, StepFailure> {
        let mut capture = AttemptCapture::begin(state.retry_attempts(&step.id) + 1);
        let result = self
            .run_attempt(step, state, poll_payload, &mut capture)
            .await;
        self.conclude(step, state, capture, result).await
    }

    /// Complete a parked async task: the callback payload becomes the step
    /// output and flows through validation, offload, mapping, and transition
    /// exactly as a handler result would.
    pub async fn resume_step(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        payload: Value,
    ) -> Result<StepCompletion, StepFailure> {
        let mut capture = AttemptCapture::begin(state.retry_attempts(&step.id) + 1);
        let result = self.finish(step, state, payload, &mut capture, true).await;
        self.conclude(step, state, capture, result).await
    }

    /// Land an aggregated fork result as the parallel step's output. Safety
    /// and required-field checks do not run here; the branch steps already
    /// went through them.
    pub async fn complete_aggregate(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        output: Value,
    ) -> Result<StepCompletion, StepFailure> {
        let mut capture = AttemptCapture::begin(state.retry_attempts(&step.id) + 1);
        let result = self.finish(step, state, output, &mut capture, false).await;
        self.conclude(step, state, capture, result).await
    }

    // -----------------------------------------------------------------------
    // Attempt pipeline
    // -----------------------------------------------------------------------

    async fn run_attempt(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        poll_payload: Option<Value>,
        capture: &mut AttemptCapture,
    ) -> Result<StepCompletion, StepFailure> {
        self.apply_delay(step, DelayPosition::Before).await;

        let input = self.build_input(step, state).await?;
        capture.handler_input = Some(input.clone());

        let rendered_config = self.render_step_config(step, state, &input).await?;
        capture.rendered_config = Some(rendered_config.clone());

        let Some(handler_name) = step.handler_name() else {
            return Err(StepFailure::configuration(format!(
                "step '{}' is not handler-backed",
                step.id
            )));
        };
        let Some(handler) = self.handlers.get(handler_name) else {
            return Err(StepFailure::terminal(
                error_names::UNKNOWN_HANDLER,
                format!("no handler registered under '{handler_name}'"),
            ));
        };

        tracing::debug!(step_id = %step.id, handler = handler_name, "invoking handler");
        let outcome = handler
            .execute_boxed(HandlerInput {
                step_id: step.id.clone(),
                data: input,
                config: rendered_config,
                poll_payload,
            })
            .await
            .map_err(StepFailure::from)?;

        match outcome {
            HandlerOutcome::Completed { output, side_meta } => {
                capture.side_meta = side_meta;
                self.apply_delay(step, DelayPosition::After).await;
                self.finish(step, state, output, capture, true).await
            }
            HandlerOutcome::AwaitCallback { payload } => {
                tracing::debug!(step_id = %step.id, "handler awaits external callback");
                Ok(StepCompletion::Parked { payload })
            }
            HandlerOutcome::Pending {
                payload,
                interval_seconds,
            } => {
                tracing::debug!(step_id = %step.id, "handler still pending");
                Ok(StepCompletion::Polling {
                    payload,
                    interval_seconds,
                })
            }
        }
    }

    /// Shared tail of every successful attempt: validate, offload, map the
    /// output into context, and resolve the transition.
    async fn finish(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        output: Value,
        capture: &mut AttemptCapture,
        validate: bool,
    ) -> Result<StepCompletion, StepFailure> {
        if validate {
            self.check_safety(step, &output).await?;
            self.check_required_fields(step, &output).await?;
        }
        capture.output = Some(output.clone());

        let stored = self.offload_output(step, output).await?;
        self.apply_output_mappings(step, state, stored).await?;

        let next = transition::resolve_next(step, &transition_scope(state), &self.conditions)?;
        state.scratch.transition_trace = next.trace;
        Ok(StepCompletion::Advanced {
            next_step_id: next.next_step_id,
        })
    }

    /// Audit and retry bookkeeping around the attempt result. Transport
    /// failures pass through untouched so the scheduler can redeliver the
    /// invocation; content failures consume retry budget; terminal failures
    /// are logged here so the interpreter does not have to.
    async fn conclude(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        capture: AttemptCapture,
        result: Result<StepCompletion, StepFailure>,
    ) -> Result<StepCompletion, StepFailure> {
        match result {
            Ok(StepCompletion::Advanced { next_step_id }) => {
                self.write_audit(step, state, &capture, StepDisposition::Completed, None)
                    .await;
                Ok(StepCompletion::Advanced { next_step_id })
            }
            // Parked and polling attempts are not audited; the step has not
            // produced an outcome yet.
            Ok(suspended) => Ok(suspended),
            Err(failure) if failure.is_transport() => {
                tracing::warn!(
                    step_id = %step.id,
                    error = %failure.message(),
                    "transport failure, invocation left to the scheduler"
                );
                Err(failure)
            }
            Err(failure) if failure.is_content() => {
                let attempts_made = state.bump_retry_attempts(&step.id);
                let budget = step
                    .on_error
                    .retry_on_content_error
                    .as_ref()
                    .map(|p| p.count)
                    .unwrap_or(1);
                if attempts_made < budget {
                    tracing::debug!(
                        step_id = %step.id,
                        attempt = attempts_made,
                        budget,
                        "content failure, retrying"
                    );
                    self.write_audit(
                        step,
                        state,
                        &capture,
                        StepDisposition::Retrying,
                        Some(failure.to_error_info()),
                    )
                    .await;
                    Err(failure)
                } else {
                    let terminal = failure.into_terminal();
                    self.write_audit(
                        step,
                        state,
                        &capture,
                        StepDisposition::Failed,
                        Some(terminal.to_error_info()),
                    )
                    .await;
                    state.scratch.failure_logged = true;
                    Err(terminal)
                }
            }
            Err(failure) => {
                self.write_audit(
                    step,
                    state,
                    &capture,
                    StepDisposition::Failed,
                    Some(failure.to_error_info()),
                )
                .await;
                state.scratch.failure_logged = true;
                Err(failure)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline stages
    // -----------------------------------------------------------------------

    async fn apply_delay(&self, step: &StepInstance, position: DelayPosition) {
        let Some(delay) = &step.delay else { return };
        if delay.position != position {
            return;
        }
        let seconds = match &delay.range {
            Some(range) if range.max_seconds >= range.min_seconds => {
                rand::thread_rng().gen_range(range.min_seconds..=range.max_seconds)
            }
            Some(_) => 0,
            None => delay.seconds.unwrap_or(0),
        };
        if seconds == 0 {
            return;
        }
        tracing::debug!(step_id = %step.id, seconds, "applying step delay");
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }

    /// Build the handler input document: mapped sources first, literal
    /// overlays second. Undefined sources warn and leave the target absent.
    async fn build_input(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
    ) -> Result<Value, StepFailure> {
        let mut data = Value::Object(Map::new());
        let hydrate = !step.skip_input_hydration;

        for (target, source) in &step.input_mappings {
            let resolved = self
                .resolver
                .resolve(source, &state.current_context_data, hydrate)
                .await?;
            state.scratch.record_events(resolved.events);
            match resolved.value {
                Some(value) => set_by_path(&mut data, target, value)?,
                None => state.scratch.record_event(MappingEvent::now(
                    "inputMapping",
                    MappingEventStatus::Warn,
                    format!("source '{source}' resolved to nothing, target '{target}' left unset"),
                )),
            }
        }
        for (target, literal) in &step.literals {
            set_by_path(&mut data, target, literal.clone())?;
        }
        Ok(data)
    }

    /// Render the step config against context data, runtime identifiers, the
    /// freshly built handler input under `input`, and any declarative
    /// template-context entries. Later sources shadow earlier ones.
    async fn render_step_config(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        input: &Value,
    ) -> Result<Value, StepFailure> {
        if step.config.is_null() {
            return Ok(Value::Null);
        }

        let (built, build_events) = self
            .templates
            .build_context(&step.template_mappings, &state.current_context_data)
            .await?;
        state.scratch.record_events(build_events);

        let mut scope = context_fields(state);
        scope.insert("input".to_string(), input.clone());
        for (key, value) in built {
            scope.insert(key, value);
        }

        let (rendered, render_events) = self
            .templates
            .render_config(step.config.clone(), &Value::Object(scope))
            .await?;
        state.scratch.record_events(render_events);
        Ok(rendered)
    }

    async fn check_safety(&self, step: &StepInstance, output: &Value) -> Result<(), StepFailure> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        if output.is_null() {
            return Ok(());
        }
        match validator.validate(&step.id, output).await {
            Ok(SafetyVerdict::Pass) => Ok(()),
            Ok(SafetyVerdict::Violation { reason }) => Err(StepFailure::terminal(
                error_names::SAFETY_VIOLATION,
                format!("output of step '{}' rejected: {reason}", step.id),
            )),
            Err(unavailable) => Err(StepFailure::transport(
                error_names::SAFETY_CHECK_UNAVAILABLE,
                unavailable.to_string(),
            )),
        }
    }

    /// Every required field must resolve present and non-null inside the
    /// output. All misses are collected into one content-retryable failure.
    async fn check_required_fields(
        &self,
        step: &StepInstance,
        output: &Value,
    ) -> Result<(), StepFailure> {
        let Some(validation) = &step.output_validation else {
            return Ok(());
        };
        let mut missing = Vec::new();
        for field in &validation.required_fields {
            let resolved = self.resolver.resolve(field, output, false).await?;
            match resolved.value {
                Some(value) if !value.is_null() => {}
                _ => missing.push(field.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        Err(StepFailure::content(
            error_names::CONTENT_VALIDATION_FAILED,
            format!("required fields missing: {}", missing.join(", ")),
        )
        .with_details(json!({ "missingFields": missing })))
    }

    /// Offload oversized output to the pointer store unless the step opted
    /// out. Opted-out output beyond the danger size is logged and kept
    /// inline.
    async fn offload_output(
        &self,
        step: &StepInstance,
        output: Value,
    ) -> Result<Value, StepFailure> {
        if step.skip_offload {
            let size_bytes = serde_json::to_vec(&output).map(|b| b.len()).unwrap_or(0);
            if size_bytes > self.settings.danger_size_bytes {
                tracing::warn!(
                    step_id = %step.id,
                    size_bytes,
                    danger_size_bytes = self.settings.danger_size_bytes,
                    "step opted out of offloading an oversized output"
                );
            }
            return Ok(output);
        }
        let outcome = offload::offload_if_large(
            self.resolver.store(),
            output,
            self.settings.offload_threshold_bytes,
        )
        .await?;
        Ok(outcome.value)
    }

    /// Map the (possibly offloaded) output into context data. Without
    /// explicit mappings the whole output lands under
    /// `steps.<step_id>.output`; with mappings, only mapped targets are
    /// written. A pointer wrapper cannot be sub-selected, so non-identity
    /// sources against offloaded output warn and skip.
    async fn apply_output_mappings(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        stored: Value,
    ) -> Result<(), StepFailure> {
        if step.output_mappings.is_empty() {
            let target = format!("steps.{}.output", step.id);
            return set_by_path(&mut state.current_context_data, &target, stored);
        }

        let offloaded = BlobPointer::is_pointer(&stored);
        for (target, source) in &step.output_mappings {
            let piece = if is_whole_output(source) {
                Some(stored.clone())
            } else if offloaded {
                state.scratch.record_event(MappingEvent::now(
                    "outputMapping",
                    MappingEventStatus::Warn,
                    format!(
                        "output of step '{}' was offloaded, cannot sub-select '{source}', \
                         target '{target}' skipped",
                        step.id
                    ),
                ));
                None
            } else {
                let resolved = self.resolver.resolve(source, &stored, false).await?;
                state.scratch.record_events(resolved.events);
                if resolved.value.is_none() {
                    state.scratch.record_event(MappingEvent::now(
                        "outputMapping",
                        MappingEventStatus::Warn,
                        format!(
                            "source '{source}' resolved to nothing in the output, \
                             target '{target}' skipped"
                        ),
                    ));
                }
                resolved.value
            };
            if let Some(piece) = piece {
                set_by_path(&mut state.current_context_data, target, piece)?;
            }
        }
        Ok(())
    }

    async fn write_audit(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        capture: &AttemptCapture,
        disposition: StepDisposition,
        error: Option<FlowErrorInfo>,
    ) {
        let logging_enabled = state
            .branch
            .as_ref()
            .map(|b| b.logging_enabled)
            .unwrap_or(true);
        let record = StepAuditRecord {
            flow_execution_id: state.flow_execution_id,
            flow_id: state.flow_id.clone(),
            step_instance_id: step.id.clone(),
            attempt: capture.attempt,
            disposition,
            started_at: capture.started_at,
            finished_at: Utc::now(),
            handler: step.handler_name().map(str::to_string),
            rendered_config: capture.rendered_config.clone(),
            handler_input: capture.handler_input.clone(),
            output: capture.output.clone(),
            side_meta: capture.side_meta.clone(),
            error,
            mapping_events: state.scratch.take_events(),
            transition_trace: std::mem::take(&mut state.scratch.transition_trace),
        };
        self.audit.log_step_execution(record, logging_enabled).await;
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Context-data fields plus runtime identifiers, the base of both the config
/// render scope and the transition scope.
fn context_fields(state: &RuntimeState) -> Map<String, Value> {
    let mut scope = match &state.current_context_data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert("flowExecutionId".to_string(), json!(state.flow_execution_id));
    scope.insert("flowId".to_string(), json!(state.flow_id));
    scope.insert(
        "flowVersion".to_string(),
        json!(state.flow_version.to_string()),
    );
    if let Some(current) = &state.current_step_instance_id {
        scope.insert("currentStepInstanceId".to_string(), json!(current));
    }
    if let Some(branch) = &state.branch {
        scope.insert("branchId".to_string(), json!(branch.branch_id));
    }
    scope
}

fn transition_scope(state: &RuntimeState) -> Value {
    Value::Object(context_fields(state))
}

/// Output-mapping sources that select the entire output.
fn is_whole_output(source: &str) -> bool {
    matches!(source.trim(), "$" | "$.")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
