//! Filesystem-backed pointer store.
//!
//! Blobs live under a root directory with the storage key as the relative
//! path, so audit records written under `executions/{id}/steps/...` are
//! directly browsable on disk. Store-generated keys are sharded by the
//! first two characters of the blob id to keep any single directory from
//! growing unbounded.

use std::path::{Path, PathBuf};

use tickflow_engine::ports::PointerStore;
use tickflow_types::error::StoreError;
use tickflow_types::pointer::BlobPointer;
use uuid::Uuid;

/// [`PointerStore`] over a local directory tree.
#[derive(Debug, Clone)]
pub struct FsPointerStore {
    root: PathBuf,
    max_blob_bytes: u64,
}

impl FsPointerStore {
    /// Store rooted at `root`. Writes larger than `max_blob_bytes` are
    /// rejected before touching the disk.
    pub fn new(root: impl Into<PathBuf>, max_blob_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_blob_bytes,
        }
    }

    /// Resolve a key to its on-disk path. Keys are `/`-separated relative
    /// paths; anything that could escape the root is rejected.
    fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
        }
        Ok(self.root.join(key))
    }

    async fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create blob directory", &path, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error("write blob", &path, e))
    }
}

impl PointerStore for FsPointerStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<BlobPointer, StoreError> {
        let id = Uuid::now_v7().simple().to_string();
        let key = format!("values/{}/{id}", &id[..2]);
        self.put_at(&key, bytes, content_type).await
    }

    async fn put_at(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<BlobPointer, StoreError> {
        let size = bytes.len() as u64;
        if size > self.max_blob_bytes {
            return Err(StoreError::TooLarge {
                size,
                limit: self.max_blob_bytes,
            });
        }
        self.write_blob(key, &bytes).await?;
        let mut pointer = BlobPointer::new(key, size);
        pointer.content_type = content_type.map(str::to_string);
        tracing::debug!(key, size_bytes = size, "blob written");
        Ok(pointer)
    }

    async fn get(&self, pointer: &BlobPointer) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(&pointer.key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(pointer.key.clone()))
            }
            Err(e) => Err(io_error("read blob", &path, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{action} {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FsPointerStore {
        FsPointerStore::new(dir.path(), 1_048_576)
    }

    #[tokio::test]
    async fn test_put_at_roundtrip_with_nested_key() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let pointer = store
            .put_at(
                "executions/e1/steps/fetch/001-COMPLETED.json",
                b"{\"ok\":true}".to_vec(),
                Some("application/json"),
            )
            .await
            .unwrap();
        assert_eq!(pointer.size_bytes, 11);

        let on_disk = dir
            .path()
            .join("executions/e1/steps/fetch/001-COMPLETED.json");
        assert!(on_disk.exists());
        assert_eq!(store.get(&pointer).await.unwrap(), b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_put_shards_generated_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let pointer = store.put(b"payload".to_vec(), None).await.unwrap();
        let segments: Vec<&str> = pointer.key.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "values");
        assert_eq!(segments[1].len(), 2);
        assert!(segments[2].starts_with(segments[1]));
        assert_eq!(store.get(&pointer).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for key in [
            "../outside",
            "values/../../etc/passwd",
            "/absolute",
            "values//double",
            "values/./here",
            "back\\slash",
            "",
        ] {
            let result = store.put_at(key, b"x".to_vec(), None).await;
            assert!(
                matches!(result, Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_blob_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let store = FsPointerStore::new(dir.path(), 16);

        let err = store
            .put_at("values/big", vec![0u8; 17], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { size: 17, limit: 16 }));
        assert!(!dir.path().join("values/big").exists());
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let err = store
            .get(&BlobPointer::new("values/ab/ghost", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
