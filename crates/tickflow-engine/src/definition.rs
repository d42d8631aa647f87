//! Definition validation and per-process caching.
//!
//! Published definitions are immutable per (id, version), so a validated
//! definition can be cached for the life of the process. Validation
//! collects every problem instead of stopping at the first, since a
//! definition authored with one broken reference usually has several.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tickflow_types::error::DefinitionError;
use tickflow_types::flow::{FlowDefinition, StepKind};

use crate::ports::DefinitionLoader;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural validation of a loaded definition. Checks reference
/// integrity, not semantics: a flow that validates can still fail at
/// runtime on bad paths or conditions.
pub fn validate(flow: &FlowDefinition) -> Result<(), DefinitionError> {
    let mut problems = Vec::new();

    if !flow.steps.contains_key(&flow.start_step_id) {
        problems.push(format!("start step '{}' not found", flow.start_step_id));
    }

    for (key, step) in &flow.steps {
        if key != &step.id {
            problems.push(format!("step key '{key}' does not match step id '{}'", step.id));
        }

        if let Some(handler) = step.handler_name() {
            if handler.is_empty() {
                problems.push(format!("step '{}' has an empty handler name", step.id));
            }
        }

        for (index, rule) in step.transitions.iter().enumerate() {
            if !flow.steps.contains_key(&rule.next_step_id) {
                problems.push(format!(
                    "step '{}' transition {index} targets unknown step '{}'",
                    step.id, rule.next_step_id
                ));
            }
        }
        if let Some(default) = &step.default_next_step_id {
            if !flow.steps.contains_key(default) {
                problems.push(format!(
                    "step '{}' default transition targets unknown step '{default}'",
                    step.id
                ));
            }
        }
        if let Some(fallback) = &step.on_error.fallback_step_id {
            if !flow.steps.contains_key(fallback) {
                problems.push(format!(
                    "step '{}' fallback targets unknown step '{fallback}'",
                    step.id
                ));
            }
        }
        if let Some(policy) = &step.on_error.retry_on_content_error {
            if policy.count == 0 {
                problems.push(format!(
                    "step '{}' declares a content-retry budget of zero attempts",
                    step.id
                ));
            }
        }
        if let Some(range) = step.delay.as_ref().and_then(|d| d.range.as_ref()) {
            if range.min_seconds > range.max_seconds {
                problems.push(format!(
                    "step '{}' delay range has min {} > max {}",
                    step.id, range.min_seconds, range.max_seconds
                ));
            }
        }

        if let StepKind::Parallel { branches, .. } = &step.kind {
            let mut seen = BTreeSet::new();
            for branch in branches {
                if !seen.insert(branch.id.as_str()) {
                    problems.push(format!(
                        "step '{}' has duplicate branch template id '{}'",
                        step.id, branch.id
                    ));
                }
                if !flow.steps.contains_key(&branch.entry_step_id) {
                    problems.push(format!(
                        "step '{}' branch '{}' enters unknown step '{}'",
                        step.id, branch.id, branch.entry_step_id
                    ));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Invalid { problems })
    }
}

// ---------------------------------------------------------------------------
// DefinitionCache
// ---------------------------------------------------------------------------

/// Validating cache over a [`DefinitionLoader`]. Racing loads of the same
/// (id, version) may both hit the loader; the entries are identical, so
/// the second insert is harmless.
#[derive(Debug)]
pub struct DefinitionCache<L> {
    loader: L,
    cache: DashMap<(String, semver::Version), Arc<FlowDefinition>>,
}

impl<L: DefinitionLoader> DefinitionCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            cache: DashMap::new(),
        }
    }

    /// Fetch a definition, loading and validating on first use. Invalid
    /// definitions are never cached.
    pub async fn get_or_load(
        &self,
        flow_id: &str,
        version: &semver::Version,
    ) -> Result<Arc<FlowDefinition>, DefinitionError> {
        let cache_key = (flow_id.to_string(), version.clone());
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(Arc::clone(&hit));
        }

        let flow = self.loader.load(flow_id, version).await?;
        validate(&flow)?;
        tracing::debug!(flow_id, version = %version, "definition loaded and cached");
        let flow = Arc::new(flow);
        self.cache.insert(cache_key, Arc::clone(&flow));
        Ok(flow)
    }

    pub fn invalidate(&self, flow_id: &str, version: &semver::Version) {
        self.cache.remove(&(flow_id.to_string(), version.clone()));
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{end_step, flow_of, task_step, MapLoader};
    use tickflow_types::flow::{ContentRetryPolicy, TransitionRule};

    fn linear_flow() -> FlowDefinition {
        let mut first = task_step("first", "work");
        first.default_next_step_id = Some("done".to_string());
        flow_of("first", vec![first, end_step("done")])
    }

    #[test]
    fn test_valid_flow_passes() {
        assert!(validate(&linear_flow()).is_ok());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut step = task_step("first", "");
        step.transitions.push(TransitionRule {
            condition: None,
            next_step_id: "ghost".to_string(),
        });
        step.default_next_step_id = Some("also-ghost".to_string());
        step.on_error.fallback_step_id = Some("third-ghost".to_string());
        step.on_error.retry_on_content_error = Some(ContentRetryPolicy { count: 0 });
        let mut flow = flow_of("missing-start", vec![step]);
        flow.steps
            .insert("mismatched".to_string(), end_step("other-id"));

        let Err(DefinitionError::Invalid { problems }) = validate(&flow) else {
            panic!("expected invalid definition");
        };
        assert!(problems.len() >= 6, "problems: {problems:?}");
        assert!(problems.iter().any(|p| p.contains("start step")));
        assert!(problems.iter().any(|p| p.contains("empty handler")));
        assert!(problems.iter().any(|p| p.contains("unknown step 'ghost'")));
        assert!(problems.iter().any(|p| p.contains("zero attempts")));
        assert!(problems.iter().any(|p| p.contains("does not match")));
    }

    #[tokio::test]
    async fn test_cache_loads_once() {
        let flow = linear_flow();
        let version = flow.version.clone();
        let loader = MapLoader::new().with_flow(flow);
        let cache = DefinitionCache::new(loader.clone());

        let first = cache.get_or_load("test-flow", &version).await.unwrap();
        let second = cache.get_or_load("test-flow", &version).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.load_count(), 1);

        cache.invalidate("test-flow", &version);
        cache.get_or_load("test-flow", &version).await.unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_not_cached() {
        let mut flow = linear_flow();
        flow.start_step_id = "ghost".to_string();
        let version = flow.version.clone();
        let loader = MapLoader::new().with_flow(flow);
        let cache = DefinitionCache::new(loader.clone());

        assert!(cache.get_or_load("test-flow", &version).await.is_err());
        assert!(cache.get_or_load("test-flow", &version).await.is_err());
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_flow_is_not_found() {
        let cache = DefinitionCache::new(MapLoader::new());
        let err = cache
            .get_or_load("nope", &semver::Version::new(1, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound { .. }));
    }
}
