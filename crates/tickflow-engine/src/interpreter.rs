//! The invocation loop: one state in, one directive out.
//!
//! [`Interpreter::interpret`] is the engine's single entry point. The
//! scheduler delivers a [`RuntimeState`] plus at most one input payload, the
//! interpreter runs exactly one unit of work on the current step, and hands
//! back the updated state with a [`Directive`]. All persistence, queueing,
//! timers, and branch delivery stay on the scheduler's side of this line;
//! the interpreter itself holds no execution state between calls.

use std::sync::Arc;

use chrono::Utc;
use tickflow_types::directive::{
    BranchResult, Directive, ForkDirective, InterpreterInvocation, InvocationInput,
};
use tickflow_types::error::{error_names, DefinitionError, FlowErrorInfo};
use tickflow_types::flow::{FlowDefinition, StepInstance, StepKind};
use tickflow_types::state::RuntimeState;

use crate::audit::{ExecutionAuditLog, StepAuditRecord, StepDisposition};
use crate::definition::DefinitionCache;
use crate::error::{InterpreterError, StepFailure};
use crate::executor::{StepCompletion, StepExecutor};
use crate::parallel::ParallelHandler;
use crate::ports::{
    DefinitionLoader, MetadataSink, PointerStore, SafetyValidator, TerminalDecision,
    TerminalErrorResolver,
};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one interpreter invocation: the state to persist and the
/// directive telling the scheduler what happens next.
#[derive(Debug)]
pub struct InterpreterOutcome {
    pub state: RuntimeState,
    pub directive: Directive,
}

/// What the dispatched step produced, before directive mapping.
enum StepOutcome {
    Completion(StepCompletion),
    Fork(ForkDirective),
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

pub struct Interpreter<S, M, L, V, R> {
    executor: StepExecutor<S, M, V>,
    parallel: ParallelHandler<S>,
    definitions: DefinitionCache<L>,
    audit: Arc<ExecutionAuditLog<S, M>>,
    recovery: R,
}

impl<S, M, L, V, R> Interpreter<S, M, L, V, R>
where
    S: PointerStore + Clone + 'static,
    M: MetadataSink + Clone + 'static,
    L: DefinitionLoader,
    V: SafetyValidator,
    R: TerminalErrorResolver,
{
    pub fn new(
        executor: StepExecutor<S, M, V>,
        parallel: ParallelHandler<S>,
        definitions: DefinitionCache<L>,
        audit: Arc<ExecutionAuditLog<S, M>>,
        recovery: R,
    ) -> Self {
        Self {
            executor,
            parallel,
            definitions,
            audit,
            recovery,
        }
    }

    /// Shared audit log, exposed so the scheduler can record execution
    /// creation and flush pending writes.
    pub fn audit(&self) -> &Arc<ExecutionAuditLog<S, M>> {
        &self.audit
    }

    /// Run one unit of work.
    ///
    /// An `Err` means the invocation did not produce a flow outcome: the
    /// execution is still RUNNING and the scheduler must invoke again.
    /// Every flow-level failure comes back as `Ok` with a `TERMINATE`
    /// directive (or an `AGGREGATE` result on branch executions).
    pub async fn interpret(
        &self,
        invocation: InterpreterInvocation,
    ) -> Result<InterpreterOutcome, InterpreterError> {
        let InterpreterInvocation { mut state, input } = invocation;
        state.strip_scratch();

        // Invocations can be re-delivered after the execution already
        // terminated; echo the frozen status instead of running anything.
        if !state.is_running() {
            tracing::warn!(
                flow_execution_id = %state.flow_execution_id,
                status = ?state.status,
                "invocation for a terminal execution, nothing to do"
            );
            let status = state.status;
            let error = state.error_info.clone();
            return Ok(finish(state, Directive::Terminate { status, error }));
        }

        let flow = match self
            .definitions
            .get_or_load(&state.flow_id, &state.flow_version)
            .await
        {
            Ok(flow) => flow,
            Err(DefinitionError::Unavailable(message)) => {
                return Err(InterpreterError::Transport {
                    error_name: error_names::DEFINITION_UNAVAILABLE.to_string(),
                    message,
                });
            }
            Err(err @ DefinitionError::NotFound { .. }) => {
                let error = FlowErrorInfo::terminal(error_names::FLOW_NOT_FOUND, err.to_string());
                return Ok(self.fail_path(state, error).await);
            }
            Err(err @ DefinitionError::Invalid { .. }) => {
                let error =
                    FlowErrorInfo::terminal(error_names::CONFIGURATION_ERROR, err.to_string());
                return Ok(self.fail_path(state, error).await);
            }
        };

        let Some(step_id) = state.current_step_instance_id.clone() else {
            let error = FlowErrorInfo::terminal(
                error_names::CONFIGURATION_ERROR,
                "execution is RUNNING but has no current step",
            );
            return Ok(self.fail_path(state, error).await);
        };
        // A step id that left the definition is unrecoverable; fallback
        // routing is not consulted because the graph itself is broken.
        let Some(step) = flow.step(&step_id) else {
            let error = FlowErrorInfo::terminal(
                error_names::STEP_NOT_FOUND,
                format!(
                    "step '{step_id}' not in flow '{}' version {}",
                    state.flow_id, state.flow_version
                ),
            );
            return Ok(self.fail_path(state, error).await);
        };

        match self.dispatch(&flow, step, &mut state, input).await {
            Ok(StepOutcome::Completion(StepCompletion::Advanced { next_step_id })) => {
                match next_step_id {
                    Some(next) => {
                        state.current_step_instance_id = Some(next);
                        Ok(finish(state, Directive::Continue))
                    }
                    None => Ok(self.close_path(state).await),
                }
            }
            Ok(StepOutcome::Completion(StepCompletion::Parked { payload })) => {
                Ok(finish(state, Directive::Wait { payload }))
            }
            Ok(StepOutcome::Completion(StepCompletion::Polling {
                payload,
                interval_seconds,
            })) => Ok(finish(
                state,
                Directive::Poll {
                    payload: Some(payload),
                    interval_seconds,
                },
            )),
            Ok(StepOutcome::Fork(directive)) => Ok(finish(state, Directive::Fork(directive))),
            Err(failure) => self.handle_failure(&flow, step, state, failure).await,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route the invocation input to the right execution path for the
    /// current step kind.
    async fn dispatch(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
        input: InvocationInput,
    ) -> Result<StepOutcome, StepFailure> {
        match input {
            InvocationInput::Fresh => match &step.kind {
                StepKind::End => Ok(StepOutcome::Completion(StepCompletion::Advanced {
                    next_step_id: None,
                })),
                StepKind::Parallel { .. } => self.fork(flow, step, state).await,
                _ => self
                    .executor
                    .execute_step(step, state, None)
                    .await
                    .map(StepOutcome::Completion),
            },
            InvocationInput::Resume { payload } => {
                if !matches!(step.kind, StepKind::AsyncTask { .. }) {
                    return Err(StepFailure::configuration(format!(
                        "step '{}' is not an async task, resume payload rejected",
                        step.id
                    )));
                }
                self.executor
                    .resume_step(step, state, payload)
                    .await
                    .map(StepOutcome::Completion)
            }
            InvocationInput::PollResult { payload } => {
                if !matches!(step.kind, StepKind::PollingTask { .. }) {
                    return Err(StepFailure::configuration(format!(
                        "step '{}' is not a polling task, poll result rejected",
                        step.id
                    )));
                }
                self.executor
                    .execute_step(step, state, Some(payload))
                    .await
                    .map(StepOutcome::Completion)
            }
            InvocationInput::Aggregate { results } => {
                let StepKind::Parallel { aggregation, .. } = &step.kind else {
                    return Err(StepFailure::configuration(format!(
                        "step '{}' is not a parallel step, aggregate batch rejected",
                        step.id
                    )));
                };
                let (value, events) = self
                    .parallel
                    .aggregate(&step.id, aggregation, results)
                    .await?;
                state.scratch.record_events(events);
                self.executor
                    .complete_aggregate(step, state, value)
                    .await
                    .map(StepOutcome::Completion)
            }
        }
    }

    /// Expand a parallel step. A fork with zero in-memory branches never
    /// reaches the scheduler; its (empty) aggregation runs inline so the
    /// flow keeps moving.
    async fn fork(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
    ) -> Result<StepOutcome, StepFailure> {
        let (directive, events) = self.parallel.prepare_fork(flow, step, state).await?;
        state.scratch.record_events(events);

        if let ForkDirective::Branches {
            branches,
            aggregation,
            ..
        } = &directive
        {
            if branches.is_empty() {
                let (value, events) = self.parallel.aggregate(&step.id, aggregation, Vec::new()).await?;
                state.scratch.record_events(events);
                return self
                    .executor
                    .complete_aggregate(step, state, value)
                    .await
                    .map(StepOutcome::Completion);
            }
        }
        Ok(StepOutcome::Fork(directive))
    }

    // -----------------------------------------------------------------------
    // Terminal paths
    // -----------------------------------------------------------------------

    /// The current path ran out of successors: the execution completed.
    /// Branch executions hand their final context to the parent's
    /// aggregation instead of terminating a flow of their own.
    async fn close_path(&self, mut state: RuntimeState) -> InterpreterOutcome {
        state.mark_completed();
        self.audit
            .flow_finished(state.flow_execution_id, state.status, None)
            .await;
        let directive = match &state.branch {
            Some(branch) => Directive::Aggregate {
                result: BranchResult::success(
                    branch.branch_id.clone(),
                    state.current_context_data.clone(),
                ),
            },
            None => Directive::Terminate {
                status: state.status,
                error: None,
            },
        };
        finish(state, directive)
    }

    /// Mark the execution failed and route the error outward.
    async fn fail_path(&self, mut state: RuntimeState, error: FlowErrorInfo) -> InterpreterOutcome {
        state.mark_failed(error.clone());
        self.audit
            .flow_finished(state.flow_execution_id, state.status, Some(error.clone()))
            .await;
        let directive = match &state.branch {
            Some(branch) => Directive::Aggregate {
                result: BranchResult::failure(branch.branch_id.clone(), error),
            },
            None => Directive::Terminate {
                status: state.status,
                error: Some(error),
            },
        };
        finish(state, directive)
    }

    /// Classify a step failure into the scheduler contract: transport
    /// errors re-deliver, content errors retry with the updated counter,
    /// terminal errors consult fallback routing.
    async fn handle_failure(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        mut state: RuntimeState,
        failure: StepFailure,
    ) -> Result<InterpreterOutcome, InterpreterError> {
        if failure.is_transport() {
            return Err(InterpreterError::Transport {
                error_name: failure.error_name().to_string(),
                message: failure.message().to_string(),
            });
        }
        if failure.is_content() {
            let attempt = state.retry_attempts(&step.id);
            let error = failure.to_error_info();
            let step_id = step.id.clone();
            state.strip_scratch();
            return Err(InterpreterError::ContentRetry {
                step_id,
                attempt,
                error,
                state: Box::new(state),
            });
        }

        let error = failure.to_error_info();
        // Failures raised outside the step executor (fork expansion,
        // aggregation) have no audit entry yet; write one so the attempt
        // trail never ends without a FAILED record.
        if !state.scratch.failure_logged {
            self.log_failure(step, &mut state, &error).await;
        }
        match self.recovery.resolve(flow, Some(step), &error).await {
            TerminalDecision::Fallback { next_step_id } => {
                tracing::debug!(
                    step_id = %step.id,
                    fallback = %next_step_id,
                    error_name = %error.error_name,
                    "terminal failure redirected to fallback step"
                );
                state.current_step_instance_id = Some(next_step_id);
                Ok(finish(state, Directive::Continue))
            }
            TerminalDecision::Fail => Ok(self.fail_path(state, error).await),
        }
    }

    async fn log_failure(
        &self,
        step: &StepInstance,
        state: &mut RuntimeState,
        error: &FlowErrorInfo,
    ) {
        let now = Utc::now();
        let logging_enabled = state
            .branch
            .as_ref()
            .map(|b| b.logging_enabled)
            .unwrap_or(true);
        let record = StepAuditRecord {
            flow_execution_id: state.flow_execution_id,
            flow_id: state.flow_id.clone(),
            step_instance_id: step.id.clone(),
            attempt: state.retry_attempts(&step.id) + 1,
            disposition: StepDisposition::Failed,
            started_at: now,
            finished_at: now,
            handler: step.handler_name().map(str::to_string),
            rendered_config: None,
            handler_input: None,
            output: None,
            side_meta: None,
            error: Some(error.clone()),
            mapping_events: state.scratch.take_events(),
            transition_trace: Vec::new(),
        };
        self.audit.log_step_execution(record, logging_enabled).await;
        state.scratch.failure_logged = true;
    }
}

fn finish(mut state: RuntimeState, directive: Directive) -> InterpreterOutcome {
    state.strip_scratch();
    InterpreterOutcome { state, directive }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
