//! Large-value pointers.
//!
//! Context data must stay within a small state-payload budget, so any value
//! exceeding the offload threshold is written to blob storage and replaced
//! in place by a tagged wrapper object. The wrapper is ordinary JSON --
//! `{"__blobPointer": {"key": ..., "sizeBytes": ..., "contentType": ...}}`
//! -- so it survives serialization, path traversal, and copying without any
//! special casing. Consumers see the original value transparently unless
//! they opt out of hydration.

use serde::{Deserialize, Serialize};

/// Key of the wrapper object that marks a pointer in context data.
pub const POINTER_TAG: &str = "__blobPointer";

/// Indirection record for an offloaded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobPointer {
    /// Storage key, unique per offloaded value.
    pub key: String,
    /// Size of the stored bytes.
    pub size_bytes: u64,
    /// MIME type of the stored bytes (default application/json).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl BlobPointer {
    pub fn new(key: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            key: key.into(),
            size_bytes,
            content_type: None,
        }
    }

    /// The tagged wrapper form stored in context data.
    pub fn to_value(&self) -> serde_json::Value {
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(
            POINTER_TAG.to_string(),
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        );
        serde_json::Value::Object(wrapper)
    }

    /// Detect and decode a wrapper object. Returns `None` for anything that
    /// is not exactly a one-key `{"__blobPointer": {...}}` object.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let inner = object.get(POINTER_TAG)?;
        serde_json::from_value(inner.clone()).ok()
    }

    /// Whether `value` is a pointer wrapper.
    pub fn is_pointer(value: &serde_json::Value) -> bool {
        Self::from_value(value).is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
