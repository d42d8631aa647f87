//! Context path resolution with transparent pointer dereferencing.
//!
//! Two strategies, chosen per path. Simple paths (keys and indexes only)
//! are walked segment-by-segment so a pointer found at ANY intermediate
//! segment is dereferenced before the walk continues; previously-offloaded
//! data can bury pointers mid-path, and only manual traversal can intercept
//! them. Complex paths (wildcard, descent, filter) go through a one-shot
//! evaluator over the whole document, and only the final result is
//! hydrated. Dynamic segments are resolved against the root document first
//! and substituted as literal keys or indexes, recursively, up to a fixed
//! depth.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tickflow_types::error::error_names;
use tickflow_types::event::{MappingEvent, MappingEventStatus};
use tickflow_types::pointer::BlobPointer;

use crate::error::StepFailure;
use crate::ports::PointerStore;
use crate::value::offload;
use crate::value::path::{self, FilterExpr, FilterOp, FilterTest, PathSegment};

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of a [`ValueResolver::resolve`] call. `value: None` means the
/// path resolved to nothing, which is not itself an error -- callers decide
/// whether to warn-and-skip or proceed silently.
#[derive(Debug, Default)]
pub struct Resolution {
    pub value: Option<Value>,
    pub events: Vec<MappingEvent>,
}

impl Resolution {
    fn undefined(events: Vec<MappingEvent>) -> Self {
        Self {
            value: None,
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// ValueResolver
// ---------------------------------------------------------------------------

/// Resolves path expressions against context documents.
#[derive(Debug, Clone)]
pub struct ValueResolver<S> {
    store: S,
    max_dynamic_depth: u32,
}

impl<S: PointerStore + Clone> ValueResolver<S> {
    pub fn new(store: S, max_dynamic_depth: u32) -> Self {
        Self {
            store,
            max_dynamic_depth,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve `path_expr` against `context`. With `hydrate`, pointers met
    /// along a simple walk and pointers in the final result are swapped for
    /// their stored content; without it, pointers come back as-is.
    pub async fn resolve(
        &self,
        path_expr: &str,
        context: &Value,
        hydrate: bool,
    ) -> Result<Resolution, StepFailure> {
        self.resolve_at_depth(path_expr, context, hydrate, 0).await
    }

    /// Boxed indirection so dynamic-segment resolution can recurse.
    fn resolve_boxed<'a>(
        &'a self,
        path_expr: &'a str,
        context: &'a Value,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Resolution, StepFailure>> + Send + 'a>> {
        Box::pin(self.resolve_at_depth(path_expr, context, true, depth))
    }

    async fn resolve_at_depth(
        &self,
        path_expr: &str,
        context: &Value,
        hydrate: bool,
        depth: u32,
    ) -> Result<Resolution, StepFailure> {
        if depth > self.max_dynamic_depth {
            return Err(StepFailure::terminal(
                error_names::DYNAMIC_PATH_UNRESOLVED,
                format!(
                    "dynamic segments nested deeper than {} levels at '{path_expr}'",
                    self.max_dynamic_depth
                ),
            ));
        }

        let mut segments = path::parse_path(path_expr)
            .map_err(|e| StepFailure::configuration(format!("invalid path '{path_expr}': {e}")))?;
        let mut events = Vec::new();

        // Substitute dynamic segments before choosing a strategy.
        for segment in segments.iter_mut() {
            if let PathSegment::Dynamic(sub_path) = segment {
                let resolved = self.resolve_boxed(sub_path, context, depth + 1).await?;
                events.extend(resolved.events);
                let substituted = dynamic_to_segment(path_expr, sub_path, resolved.value)?;
                events.push(MappingEvent::now(
                    "dynamicSegment",
                    MappingEventStatus::Info,
                    format!("substituted [{sub_path}] in '{path_expr}'"),
                ));
                *segment = substituted;
            }
        }

        if segments.iter().any(PathSegment::is_complex) {
            let matches = eval_complex(&segments, context);
            if matches.is_empty() {
                return Ok(Resolution::undefined(events));
            }
            let mut value = Value::Array(matches.into_iter().cloned().collect());
            if hydrate {
                value = offload::hydrate_value(&self.store, value).await?;
            }
            return Ok(Resolution {
                value: Some(value),
                events,
            });
        }

        self.walk_simple(&segments, context, hydrate, events).await
    }

    /// Segment-by-segment walk with mid-path pointer interception.
    async fn walk_simple(
        &self,
        segments: &[PathSegment],
        context: &Value,
        hydrate: bool,
        mut events: Vec<MappingEvent>,
    ) -> Result<Resolution, StepFailure> {
        // Reference walk until a pointer blocks the way (or the path ends).
        let mut index = 0usize;
        let mut current_ref: &Value = context;
        while index < segments.len() {
            if hydrate && BlobPointer::is_pointer(current_ref) {
                break;
            }
            match step_ref(&segments[index], current_ref) {
                Some(next) => {
                    current_ref = next;
                    index += 1;
                }
                None => return Ok(Resolution::undefined(events)),
            }
        }

        // Owned walk from the first pointer onward.
        let mut current = current_ref.clone();
        while index < segments.len() {
            if hydrate {
                if let Some(pointer) = BlobPointer::from_value(&current) {
                    current = offload::fetch_pointer(&self.store, &pointer).await?;
                    events.push(dereference_event(&pointer));
                    continue;
                }
            }
            match step_owned(&segments[index], current) {
                Some(next) => {
                    current = next;
                    index += 1;
                }
                None => return Ok(Resolution::undefined(events)),
            }
        }

        if hydrate {
            current = offload::hydrate_value(&self.store, current).await?;
        }
        Ok(Resolution {
            value: Some(current),
            events,
        })
    }
}

fn dereference_event(pointer: &BlobPointer) -> MappingEvent {
    MappingEvent::now(
        "dereference",
        MappingEventStatus::Info,
        format!(
            "dereferenced pointer '{}' ({} bytes) mid-path",
            pointer.key, pointer.size_bytes
        ),
    )
}

fn dynamic_to_segment(
    path_expr: &str,
    sub_path: &str,
    resolved: Option<Value>,
) -> Result<PathSegment, StepFailure> {
    match resolved {
        Some(Value::String(key)) => Ok(PathSegment::Key(key)),
        Some(Value::Number(n)) if n.as_u64().is_some() => {
            Ok(PathSegment::Index(n.as_u64().unwrap_or(0) as usize))
        }
        other => Err(StepFailure::terminal(
            error_names::DYNAMIC_PATH_UNRESOLVED,
            format!(
                "dynamic segment [{sub_path}] in '{path_expr}' resolved to {}, expected a string or index",
                match &other {
                    Some(v) => v.to_string(),
                    None => "nothing".to_string(),
                }
            ),
        )),
    }
}

// ---------------------------------------------------------------------------
// Segment stepping
// ---------------------------------------------------------------------------

fn step_ref<'v>(segment: &PathSegment, value: &'v Value) -> Option<&'v Value> {
    match (segment, value) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        // lenient numeric-string indexing, `items.0` and `items["0"]`
        (PathSegment::Key(key), Value::Array(items)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
        (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string()),
        _ => None,
    }
}

fn step_owned(segment: &PathSegment, value: Value) -> Option<Value> {
    match (segment, value) {
        (PathSegment::Key(key), Value::Object(mut map)) => map.remove(key),
        (PathSegment::Key(key), Value::Array(items)) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.into_iter().nth(i)),
        (PathSegment::Index(index), Value::Array(items)) => items.into_iter().nth(*index),
        (PathSegment::Index(index), Value::Object(mut map)) => map.remove(&index.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Complex evaluation
// ---------------------------------------------------------------------------

/// One-shot evaluation: each segment maps the current match set to the
/// next. A non-empty match set becomes an array; zero matches resolve to
/// undefined.
fn eval_complex<'v>(segments: &[PathSegment], root: &'v Value) -> Vec<&'v Value> {
    let mut current: Vec<&'v Value> = vec![root];
    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match segment {
                PathSegment::Key(_) | PathSegment::Index(_) => {
                    if let Some(child) = step_ref(segment, value) {
                        next.push(child);
                    }
                }
                PathSegment::Wildcard => match value {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {}
                },
                PathSegment::Descent(key) => collect_descent(value, key, &mut next),
                PathSegment::Filter(filter) => {
                    if let Value::Array(items) = value {
                        next.extend(items.iter().filter(|item| filter_matches(filter, item)));
                    }
                }
                // substituted before evaluation
                PathSegment::Dynamic(_) => {}
            }
        }
        current = next;
    }
    current
}

/// Depth-first, document-order collection of every value under `key`.
fn collect_descent<'v>(value: &'v Value, key: &str, out: &mut Vec<&'v Value>) {
    match value {
        Value::Object(map) => {
            for (k, child) in map {
                if k == key {
                    out.push(child);
                }
                collect_descent(child, key, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descent(child, key, out);
            }
        }
        _ => {}
    }
}

fn filter_matches(filter: &FilterExpr, element: &Value) -> bool {
    let mut actual = element;
    for segment in &filter.path {
        match step_ref(segment, actual) {
            Some(next) => actual = next,
            None => return false,
        }
    }
    match &filter.test {
        FilterTest::Exists => !actual.is_null(),
        FilterTest::Compare { op, literal } => compare_values(actual, *op, literal),
    }
}

/// JSON comparison: equality with numeric coercion, ordering for numbers
/// and strings only.
pub(crate) fn compare_values(actual: &Value, op: FilterOp, literal: &Value) -> bool {
    match op {
        FilterOp::Eq => values_equal(actual, literal),
        FilterOp::Ne => !values_equal(actual, literal),
        FilterOp::Gt => matches!(ord_of(actual, literal), Some(Ordering::Greater)),
        FilterOp::Ge => matches!(
            ord_of(actual, literal),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => matches!(ord_of(actual, literal), Some(Ordering::Less)),
        FilterOp::Le => matches!(
            ord_of(actual, literal),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // 1 == 1.0
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ord_of(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// setByPath
// ---------------------------------------------------------------------------

/// Write `value` into `target` at `path_expr`, auto-vivifying intermediate
/// containers: an array when the next segment is an index, an object
/// otherwise. Existing non-container values in the way are overwritten.
pub fn set_by_path(target: &mut Value, path_expr: &str, value: Value) -> Result<(), StepFailure> {
    let segments = path::parse_path(path_expr)
        .map_err(|e| StepFailure::configuration(format!("invalid path '{path_expr}': {e}")))?;
    if segments.is_empty() {
        *target = value;
        return Ok(());
    }
    if segments
        .iter()
        .any(|s| !matches!(s, PathSegment::Key(_) | PathSegment::Index(_)))
    {
        return Err(StepFailure::configuration(format!(
            "path '{path_expr}' cannot be used as a write target"
        )));
    }

    let mut current = target;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match segment {
            PathSegment::Key(key) => {
                if !matches!(current, Value::Object(_)) {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(map) = current else {
                    return Err(StepFailure::configuration("write target vanished"));
                };
                if last {
                    map.insert(key.clone(), value);
                    return Ok(());
                }
                current = map.entry(key.clone()).or_insert(Value::Null);
            }
            PathSegment::Index(index) => {
                if !matches!(current, Value::Array(_)) {
                    *current = Value::Array(Vec::new());
                }
                let Value::Array(items) = current else {
                    return Err(StepFailure::configuration("write target vanished"));
                };
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                if last {
                    items[*index] = value;
                    return Ok(());
                }
                current = &mut items[*index];
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
