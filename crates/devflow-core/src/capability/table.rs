//! Explicit name -> capability mapping injected into the engine.

use std::collections::HashMap;

use devflow_types::workflow::{StepKind, StepSpec};

use super::action::{BoxExternalAction, ExternalAction};
use super::generator::{BoxGenerator, Generator};

/// The capabilities one engine may call, keyed by target name.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    actions: HashMap<String, BoxExternalAction>,
    generators: HashMap<String, BoxGenerator>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action<T: ExternalAction + 'static>(
        mut self,
        target: impl Into<String>,
        action: T,
    ) -> Self {
        self.register_action(target, action);
        self
    }

    pub fn with_generator<T: Generator + 'static>(
        mut self,
        target: impl Into<String>,
        generator: T,
    ) -> Self {
        self.register_generator(target, generator);
        self
    }

    pub fn register_action<T: ExternalAction + 'static>(
        &mut self,
        target: impl Into<String>,
        action: T,
    ) {
        self.actions
            .insert(target.into(), BoxExternalAction::new(action));
    }

    pub fn register_generator<T: Generator + 'static>(
        &mut self,
        target: impl Into<String>,
        generator: T,
    ) {
        self.generators
            .insert(target.into(), BoxGenerator::new(generator));
    }

    pub fn action(&self, target: &str) -> Option<&BoxExternalAction> {
        self.actions.get(target)
    }

    pub fn generator(&self, target: &str) -> Option<&BoxGenerator> {
        self.generators.get(target)
    }

    /// Targets referenced by `steps` (recursively, undo steps included)
    /// that have no registered capability of the right kind.
    pub fn missing_targets(&self, steps: &[StepSpec]) -> Vec<String> {
        let mut missing = Vec::new();
        self.collect_missing(steps, &mut missing);
        missing.sort();
        missing.dedup();
        missing
    }

    fn collect_missing<'a>(
        &self,
        steps: impl IntoIterator<Item = &'a StepSpec>,
        missing: &mut Vec<String>,
    ) {
        for step in steps {
            match &step.kind {
                StepKind::ExternalAction { target, .. } if !self.actions.contains_key(target) => {
                    missing.push(format!("action target '{target}' (step '{}')", step.name));
                }
                StepKind::GenerationAction { target, .. }
                    if !self.generators.contains_key(target) =>
                {
                    missing.push(format!("generator '{target}' (step '{}')", step.name));
                }
                _ => {}
            }
            self.collect_missing(step.children(), missing);
            if let Some(undo) = &step.undo {
                self.collect_missing(std::iter::once(undo.as_ref()), missing);
            }
        }
    }
}
