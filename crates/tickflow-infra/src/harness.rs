//! Local scheduler harness.
//!
//! [`LocalScheduler`] plays the role of the external durable-execution
//! scheduler for tests, demos, and single-process deployments: it drives an
//! interpreter loop until a terminal directive comes back. Continue
//! re-invokes immediately; wait pops a queued resume payload; poll pops a
//! queued polling result; fork runs branch executions sequentially (from
//! materialized payloads, or through the bulk-item reader in manifest mode)
//! and delivers their results as one aggregate batch.
//!
//! Delivery semantics match the real scheduler where it matters to the
//! engine: state is persisted (kept) between invocations, transport errors
//! re-deliver the same invocation, content retries re-deliver a fresh one
//! with the returned state, and branch results are matched by id. Timers
//! are the one thing not simulated -- delays and poll intervals collapse to
//! immediate re-delivery.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{bail, Context};
use serde_json::{json, Map, Value};
use tickflow_engine::condition::ConditionEvaluator;
use tickflow_engine::error::InterpreterError;
use tickflow_engine::interpreter::{Interpreter, InterpreterOutcome};
use tickflow_engine::ports::{
    BulkItemReader, DefinitionLoader, MetadataSink, PointerStore, SafetyValidator,
    TerminalErrorResolver,
};
use tickflow_types::directive::{
    format_branch_id, BranchResult, Directive, ForkDirective, InterpreterInvocation,
    InvocationInput,
};
use tickflow_types::flow::BranchTemplate;
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::{BranchIdentity, FlowStatus, RuntimeState};
use uuid::Uuid;

/// Consecutive transport re-deliveries before the harness gives up. The
/// real scheduler backs off instead; locally a failure that survives this
/// many immediate retries is not transient.
const MAX_TRANSPORT_REDELIVERIES: u32 = 3;

/// Items pulled from the bulk reader per chunk in manifest mode.
const MANIFEST_CHUNK_SIZE: usize = 256;

/// Drives an [`Interpreter`] to a terminal directive.
pub struct LocalScheduler<S, M, L, V, R, B> {
    interpreter: Interpreter<S, M, L, V, R>,
    bulk_reader: B,
    conditions: ConditionEvaluator,
    resume_payloads: Mutex<VecDeque<Value>>,
    poll_results: Mutex<VecDeque<Value>>,
}

impl<S, M, L, V, R, B> LocalScheduler<S, M, L, V, R, B>
where
    S: PointerStore + Clone + 'static,
    M: MetadataSink + Clone + 'static,
    L: DefinitionLoader,
    V: SafetyValidator,
    R: TerminalErrorResolver,
    B: BulkItemReader,
{
    pub fn new(interpreter: Interpreter<S, M, L, V, R>, bulk_reader: B) -> Self {
        Self {
            interpreter,
            bulk_reader,
            conditions: ConditionEvaluator::new(),
            resume_payloads: Mutex::new(VecDeque::new()),
            poll_results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn interpreter(&self) -> &Interpreter<S, M, L, V, R> {
        &self.interpreter
    }

    /// Queue the payload delivered for the next `WAIT` directive.
    pub fn queue_resume(&self, payload: Value) {
        self.resume_payloads.lock().unwrap().push_back(payload);
    }

    /// Queue the result delivered for the next `POLL` directive.
    pub fn queue_poll_result(&self, payload: Value) {
        self.poll_results.lock().unwrap().push_back(payload);
    }

    /// Record the execution and drive it until it terminates or parks with
    /// no queued payload. The returned outcome carries the final state and
    /// the directive the loop stopped on (`TERMINATE`, `AGGREGATE` for a
    /// branch execution, or `WAIT`/`POLL` when parked).
    pub async fn run(&self, state: RuntimeState) -> anyhow::Result<InterpreterOutcome> {
        self.interpreter.audit().flow_started(&state).await;
        self.drive(state).await
    }

    async fn drive(&self, state: RuntimeState) -> anyhow::Result<InterpreterOutcome> {
        let mut invocation = InterpreterInvocation {
            state,
            input: InvocationInput::Fresh,
        };
        let mut redeliveries = 0u32;

        loop {
            let outcome = match self.interpreter.interpret(invocation.clone()).await {
                Ok(outcome) => {
                    redeliveries = 0;
                    outcome
                }
                Err(InterpreterError::Transport {
                    error_name,
                    message,
                }) => {
                    redeliveries += 1;
                    if redeliveries >= MAX_TRANSPORT_REDELIVERIES {
                        bail!(
                            "transport failure persisted across {redeliveries} deliveries: \
                             {error_name}: {message}"
                        );
                    }
                    tracing::debug!(error_name, redeliveries, "re-delivering invocation");
                    continue;
                }
                Err(InterpreterError::ContentRetry { step_id, attempt, state, .. }) => {
                    tracing::debug!(%step_id, attempt, "re-delivering after content retry");
                    invocation = InterpreterInvocation {
                        state: *state,
                        input: InvocationInput::Fresh,
                    };
                    continue;
                }
            };

            invocation = match outcome.directive {
                Directive::Continue => InterpreterInvocation {
                    state: outcome.state,
                    input: InvocationInput::Fresh,
                },
                Directive::Wait { .. } => {
                    let Some(payload) = self.resume_payloads.lock().unwrap().pop_front() else {
                        return Ok(outcome);
                    };
                    InterpreterInvocation {
                        state: outcome.state,
                        input: InvocationInput::Resume { payload },
                    }
                }
                Directive::Poll { .. } => {
                    let Some(payload) = self.poll_results.lock().unwrap().pop_front() else {
                        return Ok(outcome);
                    };
                    InterpreterInvocation {
                        state: outcome.state,
                        input: InvocationInput::PollResult { payload },
                    }
                }
                Directive::Fork(fork) => {
                    let results = self.run_fork(&outcome.state, fork).await?;
                    InterpreterInvocation {
                        state: outcome.state,
                        input: InvocationInput::Aggregate { results },
                    }
                }
                Directive::Aggregate { .. } | Directive::Terminate { .. } => return Ok(outcome),
            };
        }
    }

    //  -------------------------------------------------------------------
    //  Fork handling
    //  -------------------------------------------------------------------

    /// Run every branch of a fork as a child execution and collect their
    /// results into one batch.
    async fn run_fork(
        &self,
        parent: &RuntimeState,
        fork: ForkDirective,
    ) -> anyhow::Result<Vec<BranchResult>> {
        let children = match fork {
            ForkDirective::Branches { branches, .. } => branches
                .into_iter()
                .map(|payload| RuntimeState {
                    flow_execution_id: Uuid::now_v7(),
                    flow_id: payload.flow_id,
                    flow_version: payload.flow_version,
                    status: FlowStatus::Running,
                    current_step_instance_id: Some(payload.step.id),
                    current_context_data: payload.context,
                    step_retry_attempts: Default::default(),
                    branch: Some(BranchIdentity {
                        branch_id: payload.branch_id,
                        parent_execution_id: payload.parent_execution_id,
                        root_execution_id: payload.root_execution_id,
                        logging_enabled: payload.logging_enabled,
                    }),
                    error_info: None,
                    scratch: Default::default(),
                })
                .collect(),
            ForkDirective::Manifest {
                items_pointer,
                branch_templates,
                base_context,
                fork_step_id,
                ..
            } => {
                self.expand_manifest(
                    parent,
                    &items_pointer,
                    &branch_templates,
                    &base_context,
                    &fork_step_id,
                )
                .await?
            }
        };

        let mut results = Vec::with_capacity(children.len());
        for child in children {
            let branch_id = child
                .branch
                .as_ref()
                .map(|b| b.branch_id.clone())
                .unwrap_or_default();
            let outcome = Box::pin(self.run(child)).await?;
            match outcome.directive {
                Directive::Aggregate { result } => results.push(result),
                other => bail!(
                    "branch '{branch_id}' stopped on {other:?} instead of delivering a result"
                ),
            }
        }
        Ok(results)
    }

    /// Instantiate branch executions from a manifest directive, reading the
    /// item collection through the bulk reader one chunk at a time.
    async fn expand_manifest(
        &self,
        parent: &RuntimeState,
        items_pointer: &BlobPointer,
        templates: &[BranchTemplate],
        base_context: &Value,
        fork_step_id: &str,
    ) -> anyhow::Result<Vec<RuntimeState>> {
        let total = self
            .bulk_reader
            .count_items(items_pointer)
            .await
            .context("counting manifest items")?;
        tracing::debug!(fork_step_id, total, "expanding manifest fan-out");

        let root_execution_id = parent
            .branch
            .as_ref()
            .map(|b| b.root_execution_id)
            .unwrap_or(parent.flow_execution_id);

        let mut children = Vec::new();
        let mut offset = 0;
        while offset < total {
            let items = self
                .bulk_reader
                .read_items(items_pointer, offset, MANIFEST_CHUNK_SIZE)
                .await
                .context("reading manifest chunk")?;
            if items.is_empty() {
                break;
            }

            for (chunk_index, item) in items.iter().enumerate() {
                let item_index = offset + chunk_index;
                for template in templates {
                    if let Some(condition) = &template.condition {
                        let scope = item_scope(base_context, item, item_index, None);
                        match self.conditions.evaluate_bool(condition, &scope) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                tracing::warn!(
                                    template_id = %template.id,
                                    item_index,
                                    error = %e,
                                    "manifest branch condition failed, skipping item"
                                );
                                continue;
                            }
                        }
                    }

                    let branch_id = format_branch_id(fork_step_id, item_index, &template.id);
                    let context = item_scope(base_context, item, item_index, Some(&branch_id));
                    children.push(RuntimeState {
                        flow_execution_id: Uuid::now_v7(),
                        flow_id: parent.flow_id.clone(),
                        flow_version: parent.flow_version.clone(),
                        status: FlowStatus::Running,
                        current_step_instance_id: Some(template.entry_step_id.clone()),
                        current_context_data: context,
                        step_retry_attempts: Default::default(),
                        branch: Some(BranchIdentity {
                            branch_id,
                            parent_execution_id: parent.flow_execution_id,
                            root_execution_id,
                            logging_enabled: template.logging_enabled,
                        }),
                        error_info: None,
                        scratch: Default::default(),
                    });
                }
            }
            offset += items.len();
        }
        Ok(children)
    }
}

/// Branch scope: the base context plus `currentItem`, `itemIndex`, and
/// (once the branch exists) `branchId`. Mirrors what the engine builds for
/// in-memory forks.
fn item_scope(base: &Value, item: &Value, index: usize, branch_id: Option<&str>) -> Value {
    let mut scope = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert("currentItem".to_string(), item.clone());
    scope.insert("itemIndex".to_string(), json!(index));
    if let Some(branch_id) = branch_id {
        scope.insert("branchId".to_string(), json!(branch_id));
    }
    Value::Object(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_scope_layers_branch_fields() {
        let base = json!({"steps": {"seed": {"output": 1}}});
        let eligibility = item_scope(&base, &json!({"sku": "a"}), 3, None);
        assert_eq!(eligibility["currentItem"], json!({"sku": "a"}));
        assert_eq!(eligibility["itemIndex"], json!(3));
        assert!(eligibility.get("branchId").is_none());

        let branch = item_scope(&base, &json!({"sku": "a"}), 3, Some("split:00003:t"));
        assert_eq!(branch["branchId"], json!("split:00003:t"));
        assert_eq!(branch["steps"]["seed"]["output"], json!(1));
    }
}
