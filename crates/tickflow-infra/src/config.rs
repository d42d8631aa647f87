//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.tickflow/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed; a missing file is the
//! normal case and stays silent, a broken one logs a warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tickflow_engine::settings::EngineSettings;

/// Default cap accepted by the filesystem pointer store: 64 MiB.
const DEFAULT_MAX_BLOB_BYTES: u64 = 64 * 1024 * 1024;

/// Top-level engine configuration.
///
/// `[engine]` maps onto [`EngineSettings`] and flows into every engine
/// component; `[storage]` stays on the infra side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    pub storage: StorageConfig,
}

/// Storage locations and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob root directory. Absent -> `{data_dir}/blobs`.
    pub blob_root: Option<PathBuf>,
    /// Largest blob the filesystem pointer store accepts.
    pub max_blob_bytes: u64,
    /// Metadata database URL. Absent -> `sqlite://{data_dir}/tickflow.db`.
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_root: None,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Blob root for the filesystem pointer store.
    pub fn blob_root(&self, data_dir: &Path) -> PathBuf {
        self.storage
            .blob_root
            .clone()
            .unwrap_or_else(|| data_dir.join("blobs"))
    }

    /// Metadata database URL.
    pub fn database_url(&self, data_dir: &Path) -> String {
        self.storage
            .database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}/tickflow.db", data_dir.display()))
    }
}

/// Resolve the data directory: `TICKFLOW_DATA_DIR`, else `~/.tickflow`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("TICKFLOW_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir()
            .map(|home| home.join(".tickflow"))
            .unwrap_or_else(|| PathBuf::from(".tickflow")),
    }
}

/// Load configuration from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config.toml at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.offload_threshold_bytes, 262_144);
        assert_eq!(config.storage.max_blob_bytes, DEFAULT_MAX_BLOB_BYTES);
        assert_eq!(config.blob_root(tmp.path()), tmp.path().join("blobs"));
    }

    #[tokio::test]
    async fn test_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
offload_threshold_bytes = 1024
default_branch_concurrency = 2

[storage]
blob_root = "/var/lib/tickflow/blobs"
max_blob_bytes = 1048576
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.offload_threshold_bytes, 1_024);
        assert_eq!(config.engine.default_branch_concurrency, 2);
        // unset keys keep their defaults
        assert_eq!(config.engine.max_dynamic_path_depth, 10);
        assert_eq!(
            config.blob_root(tmp.path()),
            PathBuf::from("/var/lib/tickflow/blobs")
        );
        assert_eq!(config.storage.max_blob_bytes, 1_048_576);
    }

    #[tokio::test]
    async fn test_invalid_toml_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.offload_threshold_bytes, 262_144);
    }

    #[test]
    fn test_database_url_fallback() {
        let config = EngineConfig::default();
        let url = config.database_url(Path::new("/data"));
        assert_eq!(url, "sqlite:///data/tickflow.db");

        let explicit = EngineConfig {
            storage: StorageConfig {
                database_url: Some("sqlite::memory:".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(explicit.database_url(Path::new("/data")), "sqlite::memory:");
    }
}
