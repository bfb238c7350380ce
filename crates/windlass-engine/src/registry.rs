//! Definition registries
//!
//! Workflow definitions and ad-hoc action definitions are process-wide state
//! with an explicit init-once/reset lifecycle, injected into the engine
//! rather than living as module globals so tests can reset them
//! deterministically.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use windlass_core::{AdHocActionSpec, Evaluator, WorkflowSpec};

use crate::error::{EngineError, EngineResult};

/// Registry of workflow definitions by name
#[derive(Default)]
pub struct WorkflowDefinitions {
    specs: RwLock<HashMap<String, WorkflowSpec>>,
}

impl WorkflowDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a workflow definition
    pub fn register(&self, spec: WorkflowSpec) {
        info!(workflow = %spec.name, "registered workflow definition");
        self.specs.write().insert(spec.name.clone(), spec);
    }

    /// Look up a definition by name
    pub fn get(&self, name: &str) -> EngineResult<WorkflowSpec> {
        self.specs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Workflow(format!("workflow definition not found: {name}")))
    }

    /// Drop all definitions (test lifecycle)
    pub fn reset(&self) {
        self.specs.write().clear();
    }
}

/// Registry of ad-hoc action definitions by name
#[derive(Default)]
pub struct ActionDefinitions {
    specs: RwLock<HashMap<String, AdHocActionSpec>>,
}

impl ActionDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an ad-hoc action definition
    pub fn register(&self, spec: AdHocActionSpec) {
        self.specs.write().insert(spec.name.clone(), spec);
    }

    /// Drop all definitions (test lifecycle)
    pub fn reset(&self) {
        self.specs.write().clear();
    }

    /// Resolve an action reference through its ad-hoc base chain
    ///
    /// Walks `base` pointers with a visited-name set, erroring on a repeat,
    /// and folds each level's `base_input` (evaluated against the current
    /// input) into the effective input. Returns the final concrete action
    /// reference and the input to pass it.
    pub fn resolve(
        &self,
        action_ref: &str,
        input: Value,
        evaluator: &dyn Evaluator,
    ) -> EngineResult<(String, Value)> {
        let specs = self.specs.read();

        let mut current = action_ref.to_string();
        let mut input = input;
        let mut visited = std::collections::HashSet::new();

        while let Some(adhoc) = specs.get(&current) {
            if !visited.insert(current.clone()) {
                return Err(EngineError::Workflow(format!(
                    "circular ad-hoc action chain at: {current}"
                )));
            }

            if !adhoc.base_input.is_null() {
                input = evaluator.evaluate_recursively(&adhoc.base_input, &input)?;
            }
            current = adhoc.base.clone();
        }

        Ok((current, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_core::SimpleEvaluator;

    #[test]
    fn test_workflow_registry_lifecycle() {
        let registry = WorkflowDefinitions::new();
        let spec = WorkflowSpec {
            name: "wf".into(),
            tasks: vec![],
            output: None,
            output_on_error: None,
        };

        registry.register(spec);
        assert!(registry.get("wf").is_ok());

        registry.reset();
        assert!(registry.get("wf").is_err());
    }

    #[test]
    fn test_adhoc_chain_resolution() {
        let registry = ActionDefinitions::new();
        let evaluator = SimpleEvaluator::new();

        // greet -> format -> std.echo, each level reshaping the input
        registry.register(AdHocActionSpec {
            name: "greet".into(),
            base: "format".into(),
            base_input: json!({"text": "hello <% name %>"}),
        });
        registry.register(AdHocActionSpec {
            name: "format".into(),
            base: "std.echo".into(),
            base_input: json!({"output": "<% text %>"}),
        });

        let (final_ref, input) = registry
            .resolve("greet", json!({"name": "world"}), &evaluator)
            .unwrap();

        assert_eq!(final_ref, "std.echo");
        assert_eq!(input, json!({"output": "hello world"}));
    }

    #[test]
    fn test_adhoc_cycle_is_an_error() {
        let registry = ActionDefinitions::new();
        let evaluator = SimpleEvaluator::new();

        registry.register(AdHocActionSpec {
            name: "a".into(),
            base: "b".into(),
            base_input: Value::Null,
        });
        registry.register(AdHocActionSpec {
            name: "b".into(),
            base: "a".into(),
            base_input: Value::Null,
        });

        let result = registry.resolve("a", json!({}), &evaluator);
        assert!(matches!(result, Err(EngineError::Workflow(_))));
    }

    #[test]
    fn test_concrete_ref_passes_through() {
        let registry = ActionDefinitions::new();
        let evaluator = SimpleEvaluator::new();

        let (final_ref, input) = registry
            .resolve("std.noop", json!({"a": 1}), &evaluator)
            .unwrap();
        assert_eq!(final_ref, "std.noop");
        assert_eq!(input, json!({"a": 1}));
    }
}
