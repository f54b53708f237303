//! Transition definition store

use crate::models::transition::{ObjectKind, SourceMatch, TransitionDefinition};
use crate::transitions::error::{TransitionError, TransitionResult};
use crate::transitions::permission::{Actor, PermissionGate};
use crate::transitions::registry::{ActionRegistry, RegisteredAction};
use crate::transitions::validator::DefinitionValidator;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Validated transition definitions, keyed by object kind and name
///
/// Filled while the process starts, then shared read-only behind an `Arc`.
#[derive(Debug)]
pub struct DefinitionStore {
    registry: Arc<ActionRegistry>,
    /// Valid lifecycle states per object kind
    kinds: BTreeMap<String, BTreeSet<String>>,
    definitions: BTreeMap<(String, String), TransitionDefinition>,
}

impl DefinitionStore {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            kinds: BTreeMap::new(),
            definitions: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Declare the states an object kind may take
    ///
    /// Definitions for a declared kind must use these states; kinds never
    /// declared accept any state name.
    pub fn register_kind(&mut self, kind: ObjectKind) {
        self.kinds.insert(kind.name, kind.states);
    }

    pub fn kind_states(&self, kind: &str) -> Option<&BTreeSet<String>> {
        self.kinds.get(kind)
    }

    /// Validate and store a definition
    pub fn create(&mut self, definition: TransitionDefinition) -> TransitionResult<&TransitionDefinition> {
        let key = (definition.kind.clone(), definition.name.clone());
        if self.definitions.contains_key(&key) {
            return Err(TransitionError::invalid_definition(
                &definition.name,
                format!("a transition with this name already exists for '{}'", definition.kind),
            ));
        }

        let validation = DefinitionValidator::validate_definition(
            &definition,
            &self.registry,
            self.kinds.get(&definition.kind),
        );
        if !validation.is_valid() {
            return Err(TransitionError::invalid_definition(
                &definition.name,
                validation.summary(),
            ));
        }
        for warning in &validation.warnings {
            tracing::warn!(transition = %definition.name, "{}", warning);
        }

        tracing::debug!(
            transition = %definition.name,
            kind = %definition.kind,
            target = %definition.target,
            "Created transition definition"
        );
        Ok(self.definitions.entry(key).or_insert(definition))
    }

    /// Remove a definition; runs referencing it keep their copy of the name
    pub fn remove(&mut self, kind: &str, name: &str) -> Option<TransitionDefinition> {
        self.definitions.remove(&(kind.to_string(), name.to_string()))
    }

    pub fn get(&self, kind: &str, name: &str) -> TransitionResult<&TransitionDefinition> {
        self.definitions
            .get(&(kind.to_string(), name.to_string()))
            .ok_or_else(|| TransitionError::UnknownTransition {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    /// All definitions for a kind, sorted by name
    pub fn definitions_for(&self, kind: &str) -> Vec<&TransitionDefinition> {
        self.definitions
            .values()
            .filter(|d| d.kind == kind)
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &TransitionDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions applicable to an object in `state`
    ///
    /// Explicit source matches come first, wildcard matches after; each group
    /// is sorted by name.
    pub fn find_applicable(&self, kind: &str, state: &str) -> Vec<&TransitionDefinition> {
        let mut matches: Vec<(SourceMatch, &TransitionDefinition)> = self
            .definitions_for(kind)
            .into_iter()
            .filter_map(|d| d.sources.match_rank(state).map(|rank| (rank, d)))
            .collect();
        // stable sort keeps the name order inside each rank
        matches.sort_by_key(|(rank, _)| *rank);
        matches.into_iter().map(|(_, d)| d).collect()
    }

    /// The single definition moving an object from `state` to `target`
    ///
    /// An explicit source match beats a wildcard one; two candidates of the
    /// same rank are ambiguous.
    pub fn select(&self, kind: &str, state: &str, target: &str) -> TransitionResult<&TransitionDefinition> {
        let candidates: Vec<(SourceMatch, &TransitionDefinition)> = self
            .definitions_for(kind)
            .into_iter()
            .filter(|d| d.target == target)
            .filter_map(|d| d.sources.match_rank(state).map(|rank| (rank, d)))
            .collect();

        let Some(best) = candidates.iter().map(|(rank, _)| *rank).min() else {
            return Err(TransitionError::UnknownTransition {
                kind: kind.to_string(),
                name: format!("{} -> {}", state, target),
            });
        };

        let top: Vec<&TransitionDefinition> = candidates
            .into_iter()
            .filter(|(rank, _)| *rank == best)
            .map(|(_, d)| d)
            .collect();

        match top.as_slice() {
            [single] => Ok(*single),
            _ => Err(TransitionError::AmbiguousTransition {
                kind: kind.to_string(),
                state: state.to_string(),
                target: target.to_string(),
                candidates: top.iter().map(|d| d.name.clone()).collect(),
            }),
        }
    }

    /// Applicable definitions the actor is allowed to run
    pub fn available_for(
        &self,
        gate: &dyn PermissionGate,
        actor: &Actor,
        kind: &str,
        state: &str,
    ) -> Vec<&TransitionDefinition> {
        self.find_applicable(kind, state)
            .into_iter()
            .filter(|d| gate.may_run(actor, d))
            .collect()
    }

    /// Registry entries for a definition's actions in execution order
    pub fn ordered_actions(&self, definition: &TransitionDefinition) -> TransitionResult<Vec<RegisteredAction>> {
        let ordered = DefinitionValidator::order_actions(&definition.actions, &self.registry)
            .map_err(|cycle| {
                TransitionError::invalid_definition(
                    &definition.name,
                    format!("circular run_after requirement: {}", cycle.join(" → ")),
                )
            })?;
        ordered
            .iter()
            .map(|name| self.registry.resolve(name).cloned())
            .collect()
    }

    /// Whether runs of this definition go to the background
    pub fn is_async(&self, definition: &TransitionDefinition) -> bool {
        definition.run_asynchronously
            || definition
                .actions
                .iter()
                .filter_map(|name| self.registry.resolve(name).ok())
                .any(|entry| entry.action.is_async())
    }
}
