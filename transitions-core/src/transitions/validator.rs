//! Transition definition validation and action ordering

use crate::models::transition::{ObjectKind, SourceStates, TransitionDefinition};
use crate::transitions::registry::ActionRegistry;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Validation error type
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: String, message: String) {
        self.errors.push(ValidationError { field, message });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Errors joined into one line, for error variants that carry a reason
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn merge(&mut self, prefix: &str, other: ValidationResult) {
        for error in other.errors {
            self.add_error(format!("{}.{}", prefix, error.field), error.message);
        }
        for warning in other.warnings {
            self.add_warning(format!("{}: {}", prefix, warning));
        }
    }
}

/// Transition definition validator
pub struct DefinitionValidator;

impl DefinitionValidator {
    /// Validate one definition against the registry and its kind's states
    ///
    /// `states` is `None` when the kind declares no state catalog; state names
    /// are then not checked.
    pub fn validate_definition(
        definition: &TransitionDefinition,
        registry: &ActionRegistry,
        states: Option<&BTreeSet<String>>,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        if definition.name.trim().is_empty() {
            result.add_error("name".to_string(), "Transition name cannot be empty".to_string());
        }
        if definition.kind.trim().is_empty() {
            result.add_error("kind".to_string(), "Object kind cannot be empty".to_string());
        }

        match &definition.sources {
            SourceStates::Any => {}
            SourceStates::States(sources) if sources.is_empty() => {
                result.add_error(
                    "sources".to_string(),
                    "Source states cannot be empty unless wildcard".to_string(),
                );
            }
            SourceStates::States(sources) => {
                if sources.contains(&definition.target) {
                    result.add_error(
                        "target".to_string(),
                        format!("Target state '{}' is also a source state", definition.target),
                    );
                }
                if let Some(states) = states {
                    for source in sources.iter().filter(|s| !states.contains(*s)) {
                        result.add_error(
                            "sources".to_string(),
                            format!(
                                "Source state '{}' is not a state of '{}'",
                                source, definition.kind
                            ),
                        );
                    }
                }
            }
        }

        if let Some(states) = states {
            if !states.contains(&definition.target) {
                result.add_error(
                    "target".to_string(),
                    format!(
                        "Target state '{}' is not a state of '{}'",
                        definition.target, definition.kind
                    ),
                );
            }
        }

        let mut seen = HashSet::new();
        for action in &definition.actions {
            if !seen.insert(action.as_str()) {
                result.add_error(
                    "actions".to_string(),
                    format!("Action '{}' is listed more than once", action),
                );
            }
            if !registry.contains(action) {
                result.add_error(
                    "actions".to_string(),
                    format!("Action '{}' is not registered", action),
                );
            }
        }

        if result.is_valid() {
            if let Err(cycle) = Self::order_actions(&definition.actions, registry) {
                result.add_error(
                    "actions".to_string(),
                    format!(
                        "Circular run_after requirement detected: {} → {}",
                        cycle.join(" → "),
                        cycle[0]
                    ),
                );
            }
        }

        if definition.actions.is_empty() {
            result.add_warning(format!(
                "Transition '{}' has no actions and only changes state",
                definition.name
            ));
        }

        result
    }

    /// Validate a whole set of kinds and definitions, as read from a file
    pub fn validate_all(
        kinds: &[ObjectKind],
        definitions: &[TransitionDefinition],
        registry: &ActionRegistry,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        let mut catalog: HashMap<&str, &BTreeSet<String>> = HashMap::new();
        for kind in kinds {
            if catalog.insert(kind.name.as_str(), &kind.states).is_some() {
                result.add_error(
                    format!("kinds.{}", kind.name),
                    "Object kind declared more than once".to_string(),
                );
            }
            if kind.states.is_empty() {
                result.add_error(
                    format!("kinds.{}.states", kind.name),
                    "Object kind declares no states".to_string(),
                );
            }
        }

        let mut names = HashSet::new();
        for definition in definitions {
            let prefix = format!("transitions.{}", definition.name);
            if !names.insert((definition.kind.as_str(), definition.name.as_str())) {
                result.add_error(
                    prefix.clone(),
                    format!(
                        "Transition '{}' is defined more than once for '{}'",
                        definition.name, definition.kind
                    ),
                );
            }
            let states = catalog.get(definition.kind.as_str()).copied();
            if states.is_none() && !kinds.is_empty() {
                result.add_error(
                    format!("{}.kind", prefix),
                    format!("Object kind '{}' is not declared", definition.kind),
                );
            }
            result.merge(
                &prefix,
                Self::validate_definition(definition, registry, states),
            );
        }

        for state in Self::find_unreachable_states(kinds, definitions) {
            result.add_warning(format!(
                "State '{}' is never the target of any transition",
                state
            ));
        }

        result
    }

    /// Order action names so every `run_after` requirement runs first
    ///
    /// Among actions free to run, the one declared earliest goes first, so a
    /// definition without requirements keeps its declared order. Requirements
    /// on actions outside the list are ignored. Unknown names are kept in
    /// place. On a cycle the offending path is returned.
    pub fn order_actions(
        actions: &[String],
        registry: &ActionRegistry,
    ) -> Result<Vec<String>, Vec<String>> {
        let position: HashMap<&str, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        // requirements[i] = indices that must run before actions[i]
        let requirements: Vec<Vec<usize>> = actions
            .iter()
            .map(|name| {
                registry
                    .resolve(name)
                    .map(|entry| {
                        entry
                            .run_after
                            .iter()
                            .filter_map(|req| position.get(req.as_str()).copied())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let mut done = vec![false; actions.len()];
        let mut ordered = Vec::with_capacity(actions.len());

        while ordered.len() < actions.len() {
            let next = (0..actions.len())
                .find(|&i| !done[i] && requirements[i].iter().all(|&req| done[req]));

            match next {
                Some(i) => {
                    done[i] = true;
                    ordered.push(actions[i].clone());
                }
                None => {
                    return Err(Self::find_cycle(actions, &requirements, &done));
                }
            }
        }

        Ok(ordered)
    }

    /// Walk unmet requirements from a blocked action until one repeats
    fn find_cycle(actions: &[String], requirements: &[Vec<usize>], done: &[bool]) -> Vec<String> {
        let Some(start) = (0..actions.len()).find(|&i| !done[i]) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&blocker) = requirements[current].iter().find(|&&req| !done[req]) else {
                break;
            };
            if let Some(pos) = path.iter().position(|&i| i == blocker) {
                return path[pos..].iter().map(|&i| actions[i].clone()).collect();
            }
            path.push(blocker);
            current = blocker;
        }
        path.into_iter().map(|i| actions[i].clone()).collect()
    }

    /// States no transition leads into (except those only reachable as sources)
    fn find_unreachable_states(
        kinds: &[ObjectKind],
        definitions: &[TransitionDefinition],
    ) -> Vec<String> {
        let mut unreachable = Vec::new();
        for kind in kinds {
            let targets: HashSet<&str> = definitions
                .iter()
                .filter(|d| d.kind == kind.name)
                .map(|d| d.target.as_str())
                .collect();
            let sources: HashSet<&str> = definitions
                .iter()
                .filter(|d| d.kind == kind.name)
                .filter_map(|d| match &d.sources {
                    SourceStates::States(states) => Some(states.iter().map(String::as_str)),
                    SourceStates::Any => None,
                })
                .flatten()
                .collect();

            for state in &kind.states {
                // A state that is only ever left is an entry state, not unreachable
                if !targets.contains(state.as_str()) && !sources.contains(state.as_str()) {
                    unreachable.push(format!("{}.{}", kind.name, state));
                }
            }
        }
        unreachable
    }
}
