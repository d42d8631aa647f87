//! In-memory flow definition registry.
//!
//! [`MemoryDefinitionLoader`] holds published definitions in a shared map,
//! validating each one on publish so a broken graph never reaches the
//! interpreter. Definitions are immutable once published: re-publishing an
//! (id, version) pair is rejected, a new behavior needs a new version.

use std::sync::Arc;

use dashmap::DashMap;
use tickflow_engine::definition;
use tickflow_engine::ports::DefinitionLoader;
use tickflow_types::error::DefinitionError;
use tickflow_types::flow::FlowDefinition;

/// [`DefinitionLoader`] over a shared in-memory map. Clones share the same
/// registry.
#[derive(Debug, Clone, Default)]
pub struct MemoryDefinitionLoader {
    flows: Arc<DashMap<(String, semver::Version), FlowDefinition>>,
}

impl MemoryDefinitionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish a definition. Fails on an invalid graph or a
    /// version that is already published.
    pub fn publish(&self, flow: FlowDefinition) -> Result<(), DefinitionError> {
        definition::validate(&flow)?;
        let key = (flow.id.clone(), flow.version.clone());
        if self.flows.contains_key(&key) {
            return Err(DefinitionError::Invalid {
                problems: vec![format!(
                    "flow '{}' version {} is already published",
                    flow.id, flow.version
                )],
            });
        }
        self.flows.insert(key, flow);
        Ok(())
    }

    pub fn published_count(&self) -> usize {
        self.flows.len()
    }
}

impl DefinitionLoader for MemoryDefinitionLoader {
    async fn load(
        &self,
        flow_id: &str,
        version: &semver::Version,
    ) -> Result<FlowDefinition, DefinitionError> {
        self.flows
            .get(&(flow_id.to_string(), version.clone()))
            .map(|entry| entry.clone())
            .ok_or_else(|| DefinitionError::NotFound {
                flow_id: flow_id.to_string(),
                version: version.clone(),
            })
    }
}
