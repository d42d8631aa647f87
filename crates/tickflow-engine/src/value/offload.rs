//! Large-value offloading and pointer hydration.
//!
//! Anything whose compact JSON encoding exceeds the offload threshold is
//! written to the pointer store and replaced in place by a tagged wrapper
//! (see `tickflow_types::pointer`). Hydration is the inverse: every wrapper
//! found in a document is swapped back for its stored content. Fetches for
//! independent pointers run concurrently; they are read-only and touch
//! disjoint keys.

use futures_util::future::try_join_all;
use serde_json::Value;
use tickflow_types::error::error_names;
use tickflow_types::pointer::BlobPointer;

use crate::error::StepFailure;
use crate::ports::PointerStore;
use crate::value::path::PathSegment;

/// Offloaded blobs can themselves contain pointers from upstream steps.
/// Hydration repeats until the document is clean, up to this many passes.
const MAX_HYDRATION_PASSES: usize = 10;

// ---------------------------------------------------------------------------
// Offload
// ---------------------------------------------------------------------------

/// Outcome of [`offload_if_large`].
#[derive(Debug)]
pub struct OffloadOutcome {
    /// The original value, or the pointer wrapper that replaced it.
    pub value: Value,
    /// Set when the value was offloaded.
    pub pointer: Option<BlobPointer>,
    /// Compact-JSON size of the original value.
    pub size_bytes: usize,
}

/// Offload `value` to the pointer store when its compact JSON encoding
/// exceeds `threshold_bytes`, replacing it with a pointer wrapper.
pub async fn offload_if_large<S: PointerStore>(
    store: &S,
    value: Value,
    threshold_bytes: usize,
) -> Result<OffloadOutcome, StepFailure> {
    let encoded = serde_json::to_vec(&value).map_err(|e| {
        StepFailure::terminal(
            error_names::POINTER_STORE_FAILED,
            format!("value not serializable: {e}"),
        )
    })?;
    let size_bytes = encoded.len();
    if size_bytes <= threshold_bytes {
        return Ok(OffloadOutcome {
            value,
            pointer: None,
            size_bytes,
        });
    }

    let pointer = store
        .put(encoded, Some("application/json"))
        .await
        .map_err(StepFailure::from)?;
    tracing::debug!(
        key = %pointer.key,
        size_bytes,
        threshold_bytes,
        "offloaded oversized value"
    );
    Ok(OffloadOutcome {
        value: pointer.to_value(),
        pointer: Some(pointer),
        size_bytes,
    })
}

// ---------------------------------------------------------------------------
// Hydration
// ---------------------------------------------------------------------------

/// Fetch a pointer's bytes and decode them as JSON.
pub async fn fetch_pointer<S: PointerStore>(
    store: &S,
    pointer: &BlobPointer,
) -> Result<Value, StepFailure> {
    let bytes = store.get(pointer).await.map_err(StepFailure::from)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StepFailure::terminal(
            error_names::POINTER_DEREF_FAILED,
            format!("stored value at '{}' is not valid JSON: {e}", pointer.key),
        )
    })
}

/// Replace every pointer wrapper in `value` with its stored content.
pub async fn hydrate_value<S: PointerStore>(
    store: &S,
    mut value: Value,
) -> Result<Value, StepFailure> {
    for _ in 0..MAX_HYDRATION_PASSES {
        let mut found = Vec::new();
        collect_pointers(&value, &mut Vec::new(), &mut found);
        if found.is_empty() {
            return Ok(value);
        }

        let fetches = found.iter().map(|(_, pointer)| fetch_pointer(store, pointer));
        let contents = try_join_all(fetches).await?;
        for ((trail, _), content) in found.into_iter().zip(contents) {
            replace_at(&mut value, &trail, content);
        }
    }
    Err(StepFailure::terminal(
        error_names::POINTER_DEREF_FAILED,
        format!("pointers nested deeper than {MAX_HYDRATION_PASSES} levels"),
    ))
}

fn collect_pointers(
    value: &Value,
    trail: &mut Vec<PathSegment>,
    out: &mut Vec<(Vec<PathSegment>, BlobPointer)>,
) {
    if let Some(pointer) = BlobPointer::from_value(value) {
        out.push((trail.clone(), pointer));
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                trail.push(PathSegment::Key(key.clone()));
                collect_pointers(child, trail, out);
                trail.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                trail.push(PathSegment::Index(index));
                collect_pointers(child, trail, out);
                trail.pop();
            }
        }
        _ => {}
    }
}

/// Overwrite the value at `trail` (keys and indexes only). Missing
/// intermediates leave the document untouched.
pub(crate) fn replace_at(value: &mut Value, trail: &[PathSegment], replacement: Value) {
    let mut current = value;
    for segment in trail {
        let next = match segment {
            PathSegment::Key(key) => current.get_mut(key.as_str()),
            PathSegment::Index(index) => current.get_mut(index),
            _ => None,
        };
        match next {
            Some(child) => current = child,
            None => return,
        }
    }
    *current = replacement;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
