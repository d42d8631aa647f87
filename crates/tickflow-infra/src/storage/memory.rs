//! In-memory pointer store.
//!
//! DashMap-backed [`PointerStore`] for tests, demos, and single-process
//! deployments where blob durability does not matter. Clones share the
//! same underlying map.

use std::sync::Arc;

use dashmap::DashMap;
use tickflow_engine::ports::PointerStore;
use tickflow_types::error::StoreError;
use tickflow_types::pointer::BlobPointer;
use uuid::Uuid;

/// Shared in-memory blob map.
#[derive(Debug, Clone, Default)]
pub struct MemoryPointerStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    /// Drop a blob, leaving any pointer to it dangling.
    pub fn remove(&self, key: &str) {
        self.blobs.remove(key);
    }
}

impl PointerStore for MemoryPointerStore {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_generates_unique_keys() {
        let store = MemoryPointerStore::new();
        let a = store.put(b"one".to_vec(), None).await.unwrap();
        let b = store.put(b"two".to_vec(), None).await.unwrap();
        assert_ne!(a.key, b.key);
        assert!(a.key.starts_with("values/"));
        assert_eq!(store.blob_count(), 2);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_bytes_and_content_type() {
        let store = MemoryPointerStore::new();
        let pointer = store
            .put_at("executions/e1/steps/s1/output", b"{}".to_vec(), Some("application/json"))
            .await
            .unwrap();
        assert_eq!(pointer.size_bytes, 2);
        assert_eq!(pointer.content_type.as_deref(), Some("application/json"));
        assert_eq!(store.get(&pointer).await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let store = MemoryPointerStore::new();
        let err = store
            .get(&BlobPointer::new("values/ghost", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_clones_share_blobs() {
        let store = MemoryPointerStore::new();
        let clone = store.clone();
        let pointer = store.put(b"shared".to_vec(), None).await.unwrap();
        assert_eq!(clone.get(&pointer).await.unwrap(), b"shared");
        clone.remove(&pointer.key);
        assert!(store.get(&pointer).await.is_err());
    }
}
