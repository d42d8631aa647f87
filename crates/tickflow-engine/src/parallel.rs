//! Fork preparation and branch aggregation for parallel steps.
//!
//! Fork side: expand a parallel step's item collection into branch
//! execution payloads, or hand back a manifest directive when the
//! collection sits behind a pointer the engine should not materialize.
//! Aggregate side: combine delivered branch results into a single output
//! value. Results are matched and ordered by branch id, never by delivery
//! order; the zero-padded item index inside the id makes lexicographic
//! order equal item order.

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tickflow_types::directive::{format_branch_id, BranchExecutionPayload, BranchResult, ForkDirective};
use tickflow_types::error::{error_names, FlowErrorInfo};
use tickflow_types::event::{MappingEvent, MappingEventStatus};
use tickflow_types::flow::{
    AggregationConfig, AggregationStrategy, FlowDefinition, StepInstance, StepKind,
};
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::RuntimeState;

use crate::condition::ConditionEvaluator;
use crate::error::StepFailure;
use crate::ports::PointerStore;
use crate::value::offload;
use crate::value::resolver::ValueResolver;

// ---------------------------------------------------------------------------
// ParallelHandler
// ---------------------------------------------------------------------------

pub struct ParallelHandler<S> {
    resolver: ValueResolver<S>,
    conditions: ConditionEvaluator,
    default_branch_concurrency: usize,
}

impl<S: PointerStore + Clone> ParallelHandler<S> {
    pub fn new(resolver: ValueResolver<S>, default_branch_concurrency: usize) -> Self {
        Self {
            resolver,
            conditions: ConditionEvaluator::new(),
            default_branch_concurrency,
        }
    }

    //  -------------------------------------------------------------------
    //  Fork
    //  -------------------------------------------------------------------

    /// Expand a parallel step into a fork directive.
    ///
    /// The items path is first resolved without hydration: a pointer-valued
    /// collection switches to manifest mode so the item set never enters
    /// process memory. An undefined items path forks zero branches.
    pub async fn prepare_fork(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &RuntimeState,
    ) -> Result<(ForkDirective, Vec<MappingEvent>), StepFailure> {
        let StepKind::Parallel {
            items_path,
            branches,
            aggregation,
        } = &step.kind
        else {
            return Err(StepFailure::configuration(format!(
                "step '{}' is not a parallel step",
                step.id
            )));
        };

        let context = &state.current_context_data;
        let max_concurrency = Some(
            aggregation
                .max_concurrency
                .unwrap_or(self.default_branch_concurrency),
        );

        let resolved = self.resolver.resolve(items_path, context, false).await?;
        let mut events = resolved.events;

        let items = match resolved.value {
            None => {
                events.push(MappingEvent::now(
                    "fork",
                    MappingEventStatus::Warn,
                    format!("items path '{items_path}' resolved to nothing, forking zero branches"),
                ));
                Vec::new()
            }
            Some(value) => {
                if let Some(pointer) = BlobPointer::from_value(&value) {
                    tracing::debug!(
                        step_id = %step.id,
                        key = %pointer.key,
                        size_bytes = pointer.size_bytes,
                        "items collection is offloaded, forking in manifest mode"
                    );
                    return Ok((
                        ForkDirective::Manifest {
                            items_pointer: pointer,
                            branch_templates: branches.clone(),
                            base_context: context.clone(),
                            aggregation: aggregation.clone(),
                            max_concurrency,
                            fork_step_id: step.id.clone(),
                        },
                        events,
                    ));
                }
                // in-memory items may still hold nested pointers
                let hydrated = self.resolver.resolve(items_path, context, true).await?;
                events.extend(hydrated.events);
                match hydrated.value {
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(StepFailure::configuration(format!(
                            "items path '{items_path}' resolved to {} instead of an array",
                            type_name(&other)
                        )));
                    }
                    None => Vec::new(),
                }
            }
        };

        let mut payloads = Vec::new();
        for (index, item) in items.iter().enumerate() {
            for template in branches {
                if let Some(condition) = &template.condition {
                    let scope = item_scope(context, item, index);
                    match self.conditions.evaluate_bool(condition, &scope) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            events.push(MappingEvent::now(
                                "fork",
                                MappingEventStatus::Warn,
                                format!(
                                    "branch '{}' condition failed for item {index}: {e}, skipped",
                                    template.id
                                ),
                            ));
                            continue;
                        }
                    }
                }

                let Some(entry) = flow.step(&template.entry_step_id) else {
                    return Err(StepFailure::configuration(format!(
                        "branch '{}' enters unknown step '{}'",
                        template.id, template.entry_step_id
                    )));
                };

                let branch_id = format_branch_id(&step.id, index, &template.id);
                let branch_context = branch_scope(context, item, index, &branch_id);
                payloads.push(BranchExecutionPayload {
                    branch_id,
                    step: entry.clone(),
                    context: branch_context,
                    flow_id: state.flow_id.clone(),
                    flow_version: state.flow_version.clone(),
                    parent_execution_id: state.flow_execution_id,
                    root_execution_id: state
                        .branch
                        .as_ref()
                        .map(|b| b.root_execution_id)
                        .unwrap_or(state.flow_execution_id),
                    logging_enabled: template.logging_enabled,
                });
            }
        }

        tracing::debug!(
            step_id = %step.id,
            branches = payloads.len(),
            items = items.len(),
            "prepared in-memory fork"
        );
        Ok((
            ForkDirective::Branches {
                branches: payloads,
                aggregation: aggregation.clone(),
                max_concurrency,
            },
            events,
        ))
    }

    //  -------------------------------------------------------------------
    //  Aggregate
    //  -------------------------------------------------------------------

    /// Combine branch results into the parallel step's output value.
    ///
    /// Successful outputs are hydrated concurrently, then optionally
    /// narrowed through `data_path`. A dangling pointer in one branch
    /// becomes that branch's failure rather than poisoning the others; a
    /// transport failure propagates and retries the whole aggregation.
    pub async fn aggregate(
        &self,
        step_id: &str,
        aggregation: &AggregationConfig,
        mut results: Vec<BranchResult>,
    ) -> Result<(Value, Vec<MappingEvent>), StepFailure> {
        results.sort_by(|a, b| a.branch_id.cmp(&b.branch_id));
        let total = results.len();
        let mut events = Vec::new();

        // join_all keeps the sorted order
        let mut prepared = Vec::with_capacity(total);
        for outcome in join_all(
            results
                .into_iter()
                .map(|result| self.prepare_branch(step_id, aggregation, result)),
        )
        .await
        {
            let (result, branch_events) = outcome?;
            events.extend(branch_events);
            prepared.push(result);
        }

        let failures: Vec<&BranchResult> = prepared.iter().filter(|r| r.is_error()).collect();
        if !failures.is_empty() && aggregation.fail_on_branch_error {
            let details: Vec<Value> = failures
                .iter()
                .map(|r| json!({"branchId": r.branch_id, "error": r.error}))
                .collect();
            return Err(StepFailure::terminal(
                error_names::BRANCH_AGGREGATION_FAILED,
                format!("{} of {total} branches failed", failures.len()),
            )
            .with_details(json!({ "branchErrors": details })));
        }

        let value = match aggregation.strategy {
            AggregationStrategy::CollectArray => collect_array(&prepared),
            AggregationStrategy::MergeObjects => merge_objects(&prepared, &mut events),
            AggregationStrategy::Sum => sum_numeric(&prepared, &mut events),
            AggregationStrategy::Custom => {
                tracing::debug!(step_id, "no custom aggregation installed, collecting array");
                collect_array(&prepared)
            }
        };
        Ok((value, events))
    }

    /// Hydrate one branch output and apply the `data_path` narrowing. Runs
    /// concurrently with its siblings inside [`Self::aggregate`].
    async fn prepare_branch(
        &self,
        step_id: &str,
        aggregation: &AggregationConfig,
        mut result: BranchResult,
    ) -> Result<(BranchResult, Vec<MappingEvent>), StepFailure> {
        let mut events = Vec::new();
        if let Some(output) = result.output.take() {
            match offload::hydrate_value(self.resolver.store(), output).await {
                Ok(hydrated) => {
                    result.output = Some(
                        self.extract_data(aggregation, &result.branch_id, hydrated, &mut events)
                            .await?,
                    );
                }
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        step_id,
                        branch_id = %result.branch_id,
                        error = %e.message(),
                        "branch output could not be hydrated"
                    );
                    result = BranchResult::failure(result.branch_id, e.to_error_info());
                }
            }
        }
        Ok((result, events))
    }

    async fn extract_data(
        &self,
        aggregation: &AggregationConfig,
        branch_id: &str,
        output: Value,
        events: &mut Vec<MappingEvent>,
    ) -> Result<Value, StepFailure> {
        let Some(data_path) = &aggregation.data_path else {
            return Ok(output);
        };
        let resolved = self.resolver.resolve(data_path, &output, true).await?;
        events.extend(resolved.events);
        match resolved.value {
            Some(value) => Ok(value),
            None => {
                events.push(MappingEvent::now(
                    "aggregate",
                    MappingEventStatus::Warn,
                    format!("data path '{data_path}' resolved to nothing for branch '{branch_id}'"),
                ));
                Ok(Value::Null)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Tolerated-failure entry used by COLLECT_ARRAY and the MERGE_OBJECTS
/// side channel.
fn failure_entry(result: &BranchResult) -> Value {
    json!({"branchId": result.branch_id, "error": result.error})
}

fn collect_array(prepared: &[BranchResult]) -> Value {
    Value::Array(
        prepared
            .iter()
            .map(|result| {
                if result.is_error() {
                    failure_entry(result)
                } else {
                    result.output.clone().unwrap_or(Value::Null)
                }
            })
            .collect(),
    )
}

fn merge_objects(prepared: &[BranchResult], events: &mut Vec<MappingEvent>) -> Value {
    let mut merged = Map::new();
    let mut branch_errors = Vec::new();
    for result in prepared {
        if result.is_error() {
            branch_errors.push(failure_entry(result));
            continue;
        }
        match &result.output {
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            other => {
                events.push(MappingEvent::now(
                    "aggregate",
                    MappingEventStatus::Warn,
                    format!(
                        "branch '{}' produced a non-object ({}), skipped in merge",
                        result.branch_id,
                        type_name(other.as_ref().unwrap_or(&Value::Null))
                    ),
                ));
            }
        }
    }
    if !branch_errors.is_empty() {
        merged.insert("branchErrors".to_string(), Value::Array(branch_errors));
    }
    Value::Object(merged)
}

/// Integer accumulation with checked adds, degrading to f64 on the first
/// float or overflow. Branch errors contribute nothing.
fn sum_numeric(prepared: &[BranchResult], events: &mut Vec<MappingEvent>) -> Value {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut use_float = false;

    for result in prepared {
        if result.is_error() {
            continue;
        }
        let Some(Value::Number(n)) = &result.output else {
            events.push(MappingEvent::now(
                "aggregate",
                MappingEventStatus::Warn,
                format!(
                    "branch '{}' produced a non-numeric value, skipped in sum",
                    result.branch_id
                ),
            ));
            continue;
        };
        if use_float {
            float_sum += n.as_f64().unwrap_or(0.0);
        } else if let Some(i) = n.as_i64() {
            match int_sum.checked_add(i) {
                Some(sum) => int_sum = sum,
                None => {
                    use_float = true;
                    float_sum = int_sum as f64 + i as f64;
                }
            }
        } else {
            use_float = true;
            float_sum = int_sum as f64 + n.as_f64().unwrap_or(0.0);
        }
    }

    if use_float {
        match serde_json::Number::from_f64(float_sum) {
            Some(n) => Value::Number(n),
            None => {
                tracing::warn!(sum = float_sum, "sum is not a representable JSON number");
                Value::Null
            }
        }
    } else {
        json!(int_sum)
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Eligibility scope: the context plus `currentItem` and `itemIndex`.
fn item_scope(context: &Value, item: &Value, index: usize) -> Value {
    let mut scope = match context {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert("currentItem".to_string(), item.clone());
    scope.insert("itemIndex".to_string(), json!(index));
    Value::Object(scope)
}

/// Branch starting context: the eligibility scope plus `branchId`.
fn branch_scope(context: &Value, item: &Value, index: usize, branch_id: &str) -> Value {
    let mut scope = item_scope(context, item, index);
    if let Value::Object(map) = &mut scope {
        map.insert("branchId".to_string(), json!(branch_id));
    }
    scope
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{end_step, flow_of, task_step, MemoryStore};
    use tickflow_types::flow::BranchTemplate;

    fn handler_with(store: MemoryStore) -> ParallelHandler<MemoryStore> {
        ParallelHandler::new(ValueResolver::new(store, 10), 8)
    }

    fn handler() -> ParallelHandler<MemoryStore> {
        handler_with(MemoryStore::new())
    }

    fn template(id: &str, condition: Option<&str>) -> BranchTemplate {
        BranchTemplate {
            id: id.to_string(),
            condition: condition.map(str::to_string),
            entry_step_id: "work".to_string(),
            logging_enabled: true,
        }
    }

    fn parallel_step(templates: Vec<BranchTemplate>, aggregation: AggregationConfig) -> StepInstance {
        StepInstance {
            id: "fan".to_string(),
            kind: StepKind::Parallel {
                items_path: "steps.load.output.items".to_string(),
                branches: templates,
                aggregation,
            },
            ..task_step("fan", "")
        }
    }

    fn fixture(items: Value) -> (FlowDefinition, RuntimeState) {
        let flow = flow_of(
            "fan",
            vec![
                parallel_step(vec![template("main", None)], AggregationConfig::default()),
                task_step("work", "worker"),
                end_step("done"),
            ],
        );
        let mut state = RuntimeState::fresh(&flow);
        state.current_context_data = json!({"steps": {"load": {"output": {"items": items}}}});
        (flow, state)
    }

    fn default_aggregation() -> AggregationConfig {
        AggregationConfig::default()
    }

    fn tolerant_aggregation(strategy: AggregationStrategy) -> AggregationConfig {
        AggregationConfig {
            strategy,
            fail_on_branch_error: false,
            max_concurrency: None,
            data_path: None,
        }
    }

    // -----------------------------------------------------------------------
    // Fork
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fork_expands_eligible_pairs() {
        let (mut flow, state) = fixture(json!([{"kind": "image"}, {"kind": "text"}]));
        let step = parallel_step(
            vec![
                template("all", None),
                template("images", Some("currentItem.kind == 'image'")),
            ],
            default_aggregation(),
        );
        flow.steps.insert("fan".to_string(), step.clone());

        let (directive, _events) = handler().prepare_fork(&flow, &step, &state).await.unwrap();
        let ForkDirective::Branches { branches, max_concurrency, .. } = directive else {
            panic!("expected in-memory fork");
        };
        assert_eq!(max_concurrency, Some(8));

        let ids: Vec<&str> = branches.iter().map(|b| b.branch_id.as_str()).collect();
        assert_eq!(ids, vec!["fan:00000:all", "fan:00000:images", "fan:00001:all"]);

        let first = &branches[0];
        assert_eq!(first.step.id, "work");
        assert_eq!(first.context["currentItem"], json!({"kind": "image"}));
        assert_eq!(first.context["itemIndex"], json!(0));
        assert_eq!(first.context["branchId"], json!("fan:00000:all"));
        assert_eq!(first.parent_execution_id, state.flow_execution_id);
        assert_eq!(first.root_execution_id, state.flow_execution_id);
    }

    #[tokio::test]
    async fn test_fork_undefined_items_forks_nothing() {
        let (flow, mut state) = fixture(json!([])) ;
        state.current_context_data = json!({"steps": {}});
        let step = flow.step("fan").unwrap().clone();

        let (directive, events) = handler().prepare_fork(&flow, &step, &state).await.unwrap();
        let ForkDirective::Branches { branches, .. } = directive else {
            panic!("expected in-memory fork");
        };
        assert!(branches.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e.status, MappingEventStatus::Warn)));
    }

    #[tokio::test]
    async fn test_fork_non_array_items_is_configuration_error() {
        let (flow, state) = fixture(json!("not a list"));
        let step = flow.step("fan").unwrap().clone();
        let err = handler().prepare_fork(&flow, &step, &state).await.unwrap_err();
        assert_eq!(err.error_name(), error_names::CONFIGURATION_ERROR);
    }

    #[tokio::test]
    async fn test_fork_pointer_items_switches_to_manifest() {
        let store = MemoryStore::new();
        let pointer = store
            .put(b"[]".to_vec(), Some("application/json"))
            .await
            .unwrap();
        let (flow, mut state) = fixture(Value::Null);
        state.current_context_data =
            json!({"steps": {"load": {"output": {"items": pointer.to_value()}}}});
        let step = flow.step("fan").unwrap().clone();

        let (directive, _events) = handler_with(store)
            .prepare_fork(&flow, &step, &state)
            .await
            .unwrap();
        let ForkDirective::Manifest { items_pointer, fork_step_id, base_context, .. } = directive
        else {
            panic!("expected manifest fork");
        };
        assert_eq!(items_pointer.key, pointer.key);
        assert_eq!(fork_step_id, "fan");
        assert_eq!(base_context, state.current_context_data);
    }

    // -----------------------------------------------------------------------
    // Aggregate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_collect_array_orders_by_branch_id() {
        let results = vec![
            BranchResult::success("fan:00002:main", json!("c")),
            BranchResult::success("fan:00000:main", json!("a")),
            BranchResult::success("fan:00001:main", json!("b")),
        ];
        let (value, _events) = handler()
            .aggregate("fan", &default_aggregation(), results)
            .await
            .unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_branch_error_fails_aggregation_by_default() {
        let results = vec![
            BranchResult::success("fan:00000:main", json!(1)),
            BranchResult::failure(
                "fan:00001:main",
                FlowErrorInfo::terminal(error_names::HANDLER_FAILED, "boom"),
            ),
        ];
        let err = handler()
            .aggregate("fan", &default_aggregation(), results)
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), error_names::BRANCH_AGGREGATION_FAILED);
        assert!(err.message().contains("1 of 2"));
    }

    #[tokio::test]
    async fn test_tolerated_failures_appear_in_array() {
        let results = vec![
            BranchResult::success("fan:00000:main", json!("ok")),
            BranchResult::failure(
                "fan:00001:main",
                FlowErrorInfo::terminal(error_names::HANDLER_FAILED, "boom"),
            ),
        ];
        let (value, _events) = handler()
            .aggregate(
                "fan",
                &tolerant_aggregation(AggregationStrategy::CollectArray),
                results,
            )
            .await
            .unwrap();
        let Value::Array(entries) = value else { panic!("expected array") };
        assert_eq!(entries[0], json!("ok"));
        assert_eq!(entries[1]["branchId"], json!("fan:00001:main"));
        assert_eq!(entries[1]["error"]["errorName"], json!(error_names::HANDLER_FAILED));
    }

    #[tokio::test]
    async fn test_merge_objects_with_side_channel() {
        let results = vec![
            BranchResult::success("fan:00000:main", json!({"a": 1})),
            BranchResult::success("fan:00001:main", json!({"b": 2})),
            BranchResult::success("fan:00002:main", json!(7)),
            BranchResult::failure(
                "fan:00003:main",
                FlowErrorInfo::terminal(error_names::HANDLER_FAILED, "boom"),
            ),
        ];
        let (value, events) = handler()
            .aggregate(
                "fan",
                &tolerant_aggregation(AggregationStrategy::MergeObjects),
                results,
            )
            .await
            .unwrap();
        assert_eq!(value["a"], json!(1));
        assert_eq!(value["b"], json!(2));
        assert_eq!(value["branchErrors"][0]["branchId"], json!("fan:00003:main"));
        assert!(events
            .iter()
            .any(|e| e.message.contains("non-object")));
    }

    #[tokio::test]
    async fn test_sum_skips_non_numeric_and_errors() {
        let results = vec![
            BranchResult::success("fan:00000:main", json!(2)),
            BranchResult::success("fan:00001:main", json!(3.5)),
            BranchResult::success("fan:00002:main", json!("nope")),
            BranchResult::failure(
                "fan:00003:main",
                FlowErrorInfo::terminal(error_names::HANDLER_FAILED, "boom"),
            ),
        ];
        let (value, events) = handler()
            .aggregate(
                "fan",
                &tolerant_aggregation(AggregationStrategy::Sum),
                results,
            )
            .await
            .unwrap();
        assert_eq!(value, json!(5.5));
        assert!(events.iter().any(|e| e.message.contains("non-numeric")));
    }

    #[tokio::test]
    async fn test_data_path_extraction() {
        let aggregation = AggregationConfig {
            data_path: Some("summary.score".to_string()),
            ..tolerant_aggregation(AggregationStrategy::CollectArray)
        };
        let results = vec![
            BranchResult::success("fan:00000:main", json!({"summary": {"score": 9}})),
            BranchResult::success("fan:00001:main", json!({"other": true})),
        ];
        let (value, events) = handler()
            .aggregate("fan", &aggregation, results)
            .await
            .unwrap();
        assert_eq!(value, json!([9, null]));
        assert!(events
            .iter()
            .any(|e| e.message.contains("resolved to nothing")));
    }

    /// [`PointerStore`] whose reads rendezvous on a barrier, so a test can
    /// require that two dereferences are in flight at the same time.
    #[derive(Clone)]
    struct RendezvousStore {
        inner: MemoryStore,
        barrier: std::sync::Arc<tokio::sync::Barrier>,
    }

    impl PointerStore for RendezvousStore {
        async fn put(
            &self,
            bytes: Vec<u8>,
            content_type: Option<&str>,
        ) -> Result<BlobPointer, tickflow_types::error::StoreError> {
            self.inner.put(bytes, content_type).await
        }

        async fn put_at(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: Option<&str>,
        ) -> Result<BlobPointer, tickflow_types::error::StoreError> {
            self.inner.put_at(key, bytes, content_type).await
        }

        async fn get(
            &self,
            pointer: &BlobPointer,
        ) -> Result<Vec<u8>, tickflow_types::error::StoreError> {
            self.barrier.wait().await;
            self.inner.get(pointer).await
        }
    }

    #[tokio::test]
    async fn test_branch_outputs_hydrate_concurrently() {
        let inner = MemoryStore::new();
        let first = offload::offload_if_large(&inner, json!({"n": 1}), 0).await.unwrap();
        let second = offload::offload_if_large(&inner, json!({"n": 2}), 0).await.unwrap();

        // both reads must be in flight together or the barrier never opens
        let store = RendezvousStore {
            inner,
            barrier: std::sync::Arc::new(tokio::sync::Barrier::new(2)),
        };
        let handler = ParallelHandler::new(ValueResolver::new(store, 10), 8);
        let results = vec![
            BranchResult::success("fan:00000:main", first.value),
            BranchResult::success("fan:00001:main", second.value),
        ];

        let (value, _events) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            handler.aggregate(
                "fan",
                &tolerant_aggregation(AggregationStrategy::CollectArray),
                results,
            ),
        )
        .await
        .expect("hydration stalled on a sequential read")
        .unwrap();
        assert_eq!(value, json!([{"n": 1}, {"n": 2}]));
    }

    #[tokio::test]
    async fn test_pointer_outputs_hydrate_and_dangling_becomes_failure() {
        let store = MemoryStore::new();
        let good = offload::offload_if_large(&store, json!({"n": 4}), 0).await.unwrap();
        let dangling = offload::offload_if_large(&store, json!({"n": 5}), 0).await.unwrap();
        let dangling_pointer = dangling.pointer.clone().unwrap();
        store.remove(&dangling_pointer.key);

        let results = vec![
            BranchResult::success("fan:00000:main", good.value),
            BranchResult::success("fan:00001:main", dangling.value),
        ];
        let (value, _events) = handler_with(store)
            .aggregate(
                "fan",
                &tolerant_aggregation(AggregationStrategy::CollectArray),
                results,
            )
            .await
            .unwrap();
        let Value::Array(entries) = value else { panic!("expected array") };
        assert_eq!(entries[0], json!({"n": 4}));
        assert_eq!(
            entries[1]["error"]["errorName"],
            json!(error_names::POINTER_DEREF_FAILED)
        );
    }
}
