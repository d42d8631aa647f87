//! Bulk item reader for manifest-mode fan-outs.
//!
//! When a parallel step's item collection sits behind a pointer, the
//! scheduler iterates it through [`JsonlBulkItemReader`] instead of
//! hydrating it into the interpreter's context. The blob is either JSON
//! Lines (one item per line) or a single JSON array -- the latter is what
//! the engine's own offload path writes for an oversized array, so both
//! shapes are accepted transparently.
//!
//! This adapter reads the blob in one piece per call; the contract that
//! matters to callers is the `(offset, limit)` windowing, which keeps any
//! single interpreter invocation from seeing more than one chunk of items.

use serde_json::Value;
use tickflow_engine::ports::{BulkItemReader, PointerStore};
use tickflow_types::error::StoreError;
use tickflow_types::pointer::BlobPointer;

/// [`BulkItemReader`] over blobs held in a [`PointerStore`].
#[derive(Debug, Clone)]
pub struct JsonlBulkItemReader<S> {
    store: S,
}

impl<S: PointerStore> JsonlBulkItemReader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn load_items(&self, pointer: &BlobPointer) -> Result<Vec<Value>, StoreError> {
        let bytes = self.store.get(pointer).await?;
        let text = std::str::from_utf8(&bytes).map_err(|e| {
            StoreError::Corrupt(format!("blob '{}' is not UTF-8: {e}", pointer.key))
        })?;

        // A leading '[' means the whole blob is one JSON array.
        if text.trim_start().starts_with('[') {
            return serde_json::from_str::<Vec<Value>>(text).map_err(|e| {
                StoreError::Corrupt(format!("blob '{}' is not a JSON array: {e}", pointer.key))
            });
        }

        let mut items = Vec::new();
        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let item = serde_json::from_str(line).map_err(|e| {
                StoreError::Corrupt(format!(
                    "blob '{}' line {}: invalid JSON: {e}",
                    pointer.key,
                    line_number + 1
                ))
            })?;
            items.push(item);
        }
        Ok(items)
    }
}

impl<S: PointerStore> BulkItemReader for JsonlBulkItemReader<S> {
    async fn read_items(
        &self,
        pointer: &BlobPointer,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let items = self.load_items(pointer).await?;
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_items(&self, pointer: &BlobPointer) -> Result<usize, StoreError> {
        Ok(self.load_items(pointer).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPointerStore;
    use serde_json::json;

    async fn stored(store: &MemoryPointerStore, content: &str) -> BlobPointer {
        store
            .put(content.as_bytes().to_vec(), Some("application/jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_json_lines_with_windowing() {
        let store = MemoryPointerStore::new();
        let reader = JsonlBulkItemReader::new(store.clone());
        let pointer = stored(
            &store,
            "{\"n\": 0}\n{\"n\": 1}\n\n{\"n\": 2}\n{\"n\": 3}\n",
        )
        .await;

        assert_eq!(reader.count_items(&pointer).await.unwrap(), 4);
        let window = reader.read_items(&pointer, 1, 2).await.unwrap();
        assert_eq!(window, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_reads_offloaded_json_array() {
        let store = MemoryPointerStore::new();
        let reader = JsonlBulkItemReader::new(store.clone());
        let pointer = stored(&store, r#"[{"id": "a"}, {"id": "b"}, {"id": "c"}]"#).await;

        assert_eq!(reader.count_items(&pointer).await.unwrap(), 3);
        let all = reader.read_items(&pointer, 0, 100).await.unwrap();
        assert_eq!(all[2], json!({"id": "c"}));
    }

    #[tokio::test]
    async fn test_offset_past_end_is_empty() {
        let store = MemoryPointerStore::new();
        let reader = JsonlBulkItemReader::new(store.clone());
        let pointer = stored(&store, "{\"n\": 0}\n").await;

        let window = reader.read_items(&pointer, 5, 10).await.unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_is_corrupt() {
        let store = MemoryPointerStore::new();
        let reader = JsonlBulkItemReader::new(store.clone());
        let pointer = stored(&store, "{\"n\": 0}\nnot json at all\n").await;

        let err = reader.count_items(&pointer).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_missing_blob_propagates_not_found() {
        let store = MemoryPointerStore::new();
        let reader = JsonlBulkItemReader::new(store);
        let dangling = BlobPointer::new("manifests/never-written.jsonl", 64);

        let err = reader.count_items(&dangling).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
