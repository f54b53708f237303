//! Action registry
//!
//! Actions are registered once while the process starts and the registry is
//! frozen afterwards: [`ActionRegistryBuilder::build`] hands out an immutable
//! [`ActionRegistry`] that is shared behind an `Arc` and looked up without
//! locking.

use crate::models::transition::ObjectRef;
use crate::transitions::error::{ActionExecutionError, TransitionError, TransitionResult};
use crate::transitions::permission::Actor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Parameter an action collects from the actor before running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Keep the value out of transition history (secrets, large blobs)
    #[serde(default)]
    pub exclude_from_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActionParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            exclude_from_history: false,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default,
            exclude_from_history: false,
            description: None,
        }
    }

    pub fn excluded_from_history(mut self) -> Self {
        self.exclude_from_history = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Transient context handed to an action for one object
pub struct ActionContext<'a> {
    pub run_id: Uuid,
    pub transition: &'a str,
    pub actor: &'a Actor,
    /// Parameters resolved for this action
    pub params: &'a Map<String, Value>,
    /// Scratch space carried through the object's chain
    pub shared: &'a mut Map<String, Value>,
}

impl ActionContext<'_> {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ActionExecutionError> {
        self.param_str(name)
            .ok_or_else(|| ActionExecutionError::new(format!("missing string parameter '{}'", name)))
    }
}

/// Unit of work executed as part of a transition
#[async_trait]
pub trait TransitionAction: Send + Sync {
    /// Run the action for a single object
    ///
    /// Returning an error is a terminal failure for the object's chain.
    /// Implementations must not leave partial side effects they cannot
    /// safely repeat.
    async fn run(
        &self,
        ctx: &mut ActionContext<'_>,
        object: &ObjectRef,
    ) -> Result<(), ActionExecutionError>;

    /// Per-object reasons why the action cannot run for these objects
    fn precondition(&self, _objects: &[ObjectRef], _actor: &Actor) -> BTreeMap<ObjectRef, String> {
        BTreeMap::new()
    }

    /// Long-running actions force the whole transition into the background
    fn is_async(&self) -> bool {
        false
    }
}

/// Adapter turning a plain closure into an action
pub struct FnAction<F> {
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&mut ActionContext<'_>, &ObjectRef) -> Result<(), ActionExecutionError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> TransitionAction for FnAction<F>
where
    F: Fn(&mut ActionContext<'_>, &ObjectRef) -> Result<(), ActionExecutionError> + Send + Sync,
{
    async fn run(
        &self,
        ctx: &mut ActionContext<'_>,
        object: &ObjectRef,
    ) -> Result<(), ActionExecutionError> {
        (self.func)(ctx, object)
    }
}

/// Registration entry: an action plus its declared metadata
#[derive(Clone)]
pub struct RegisteredAction {
    pub name: String,
    pub action: Arc<dyn TransitionAction>,
    pub params: Vec<ActionParam>,
    /// Actions that must run before this one when both are in a transition
    pub run_after: Vec<String>,
    pub verbose_name: Option<String>,
}

impl RegisteredAction {
    pub fn new(name: impl Into<String>, action: Arc<dyn TransitionAction>) -> Self {
        Self {
            name: name.into(),
            action,
            params: Vec::new(),
            run_after: Vec::new(),
            verbose_name: None,
        }
    }

    pub fn with_params(mut self, params: Vec<ActionParam>) -> Self {
        self.params = params;
        self
    }

    pub fn run_after<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verbose_name(mut self, verbose_name: impl Into<String>) -> Self {
        self.verbose_name = Some(verbose_name.into());
        self
    }

    /// Name shown in history: explicit verbose name or a capitalised one
    pub fn display_name(&self) -> String {
        if let Some(verbose_name) = &self.verbose_name {
            return verbose_name.clone();
        }
        let spaced = self.name.replace('_', " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Resolve this action's parameters from the caller's data
    ///
    /// Unprefixed keys are visible to every action; `<action>__<param>` keys
    /// only to the named action and win over both unprefixed keys and
    /// declared defaults.
    pub fn resolve_params(&self, data: &Map<String, Value>) -> Result<Map<String, Value>, String> {
        let prefix = format!("{}__", self.name);
        let mut resolved: Map<String, Value> = data
            .iter()
            .filter(|(key, _)| !key.contains("__"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for param in &self.params {
            if !resolved.contains_key(&param.name) {
                if let Some(default) = &param.default {
                    resolved.insert(param.name.clone(), default.clone());
                }
            }
        }

        for (key, value) in data {
            if let Some(name) = key.strip_prefix(&prefix) {
                resolved.insert(name.to_string(), value.clone());
            }
        }

        for param in self.params.iter().filter(|p| p.required) {
            if resolved.get(&param.name).map_or(true, Value::is_null) {
                return Err(format!(
                    "action '{}' requires parameter '{}'",
                    self.name, param.name
                ));
            }
        }

        Ok(resolved)
    }

    /// Declared parameters worth keeping in transition history
    pub fn history_params(&self, resolved: &Map<String, Value>) -> Map<String, Value> {
        self.params
            .iter()
            .filter(|p| !p.exclude_from_history)
            .filter_map(|p| {
                resolved
                    .get(&p.name)
                    .map(|value| (format!("{}__{}", self.name, p.name), value.clone()))
            })
            .collect()
    }
}

impl fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("run_after", &self.run_after)
            .field("is_async", &self.action.is_async())
            .finish()
    }
}

/// Collects actions during process start
#[derive(Default)]
pub struct ActionRegistryBuilder {
    actions: HashMap<String, RegisteredAction>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name` with its declared parameters
    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: Arc<dyn TransitionAction>,
        params: Vec<ActionParam>,
    ) -> TransitionResult<&mut Self> {
        self.register_entry(RegisteredAction::new(name, action).with_params(params))
    }

    /// Register a fully described action
    pub fn register_entry(&mut self, entry: RegisteredAction) -> TransitionResult<&mut Self> {
        if self.actions.contains_key(&entry.name) {
            return Err(TransitionError::DuplicateAction(entry.name));
        }
        tracing::debug!(action = %entry.name, "Registered transition action");
        self.actions.insert(entry.name.clone(), entry);
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            actions: self.actions,
        }
    }
}

/// Read-only action registry
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, RegisteredAction>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    /// Build a registry from a static list of entries
    pub fn from_entries<I>(entries: I) -> TransitionResult<Self>
    where
        I: IntoIterator<Item = RegisteredAction>,
    {
        let mut builder = ActionRegistryBuilder::new();
        for entry in entries {
            builder.register_entry(entry)?;
        }
        Ok(builder.build())
    }

    pub fn resolve(&self, name: &str) -> TransitionResult<&RegisteredAction> {
        self.actions
            .get(name)
            .ok_or_else(|| TransitionError::UnknownAction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn TransitionAction> {
        Arc::new(FnAction::new(|_ctx: &mut ActionContext<'_>, _object: &ObjectRef| Ok(())))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut builder = ActionRegistry::builder();
        builder
            .register("assign_owner", noop(), vec![ActionParam::required("owner")])
            .unwrap()
            .register("notify", noop(), vec![])
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["assign_owner", "notify"]);
        assert_eq!(registry.resolve("assign_owner").unwrap().params.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut builder = ActionRegistry::builder();
        builder.register("notify", noop(), vec![]).unwrap();
        let err = builder.register("notify", noop(), vec![]).err().unwrap();
        assert!(matches!(err, TransitionError::DuplicateAction(name) if name == "notify"));
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::default();
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, TransitionError::UnknownAction(name) if name == "missing"));
    }

    #[test]
    fn test_resolve_params_prefix_wins_over_shared_and_default() {
        let entry = RegisteredAction::new("assign_owner", noop()).with_params(vec![
            ActionParam::required("owner"),
            ActionParam::optional("notify", Some(json!(false))),
        ]);

        let mut data = Map::new();
        data.insert("owner".to_string(), json!("bob"));
        data.insert("assign_owner__owner".to_string(), json!("alice"));
        data.insert("other__owner".to_string(), json!("carol"));

        let resolved = entry.resolve_params(&data).unwrap();
        assert_eq!(resolved["owner"], json!("alice"));
        assert_eq!(resolved["notify"], json!(false));
        assert!(!resolved.contains_key("other__owner"));
    }

    #[test]
    fn test_resolve_params_missing_required() {
        let entry =
            RegisteredAction::new("assign_owner", noop()).with_params(vec![ActionParam::required("owner")]);
        let err = entry.resolve_params(&Map::new()).unwrap_err();
        assert!(err.contains("owner"));
    }

    #[test]
    fn test_history_params_skip_excluded() {
        let entry = RegisteredAction::new("set_password", noop()).with_params(vec![
            ActionParam::required("user"),
            ActionParam::required("password").excluded_from_history(),
        ]);
        let mut resolved = Map::new();
        resolved.insert("user".to_string(), json!("alice"));
        resolved.insert("password".to_string(), json!("secret"));

        let history = entry.history_params(&resolved);
        assert_eq!(history.len(), 1);
        assert_eq!(history["set_password__user"], json!("alice"));
    }

    #[test]
    fn test_display_name() {
        let entry = RegisteredAction::new("assign_owner", noop());
        assert_eq!(entry.display_name(), "Assign owner");
        let entry = entry.with_verbose_name("Assign new owner");
        assert_eq!(entry.display_name(), "Assign new owner");
    }
}
