//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Shared tuning knobs, handed to every engine component at construction.
///
/// Loaded from the embedding process's config file; `Default` carries the
/// production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Values whose compact JSON encoding exceeds this are offloaded to the
    /// pointer store.
    pub offload_threshold_bytes: usize,
    /// Warn level for steps that opted out of offloading.
    pub danger_size_bytes: usize,
    /// Payload cap applied to summaries sent to the metadata sink.
    pub metadata_payload_limit_bytes: usize,
    /// Branch concurrency handed to the scheduler when a parallel step does
    /// not set its own.
    pub default_branch_concurrency: usize,
    /// Recursion limit for dynamic path segments.
    pub max_dynamic_path_depth: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            offload_threshold_bytes: 262_144,
            danger_size_bytes: 1_048_576,
            metadata_payload_limit_bytes: 4_096,
            default_branch_concurrency: 8,
            max_dynamic_path_depth: 10,
        }
    }
}
