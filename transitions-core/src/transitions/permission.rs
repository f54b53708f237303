//! Permission gate for running transitions

use crate::models::transition::{ObjectRef, TransitionDefinition};
use crate::services::logging::log_permission_denied;
use crate::transitions::error::{TransitionError, TransitionResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity triggering a transition, with the permissions granted to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Superusers pass every permission check
    #[serde(default)]
    pub superuser: bool,
}

impl Actor {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn superuser(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            superuser: true,
            ..Default::default()
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.superuser || self.permissions.contains(permission)
    }
}

/// Decides whether an actor may run a transition
///
/// Implementations only answer the per-object question; the bulk rule
/// (every object must be allowed) lives in [`PermissionGate::authorize`].
pub trait PermissionGate: Send + Sync {
    /// Whether `actor` holds `permission` for `object`
    fn has_permission(&self, actor: &Actor, permission: &str, object: &ObjectRef) -> bool;

    /// Whether `actor` may run `definition` at all, regardless of objects
    fn may_run(&self, actor: &Actor, definition: &TransitionDefinition) -> bool {
        match &definition.permission {
            Some(permission) => actor.has_permission(permission),
            None => true,
        }
    }

    /// All-or-nothing authorization of a bulk run
    fn authorize(
        &self,
        actor: &Actor,
        definition: &TransitionDefinition,
        objects: &[ObjectRef],
    ) -> TransitionResult<()> {
        let Some(permission) = &definition.permission else {
            return Ok(());
        };

        for object in objects {
            if !self.has_permission(actor, permission, object) {
                log_permission_denied(&actor.username, &definition.name, object, permission);
                return Err(TransitionError::PermissionDenied {
                    actor: actor.username.clone(),
                    transition: definition.name.clone(),
                    object: object.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Gate backed by the permission set carried on the actor
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionSetGate;

impl PermissionGate for PermissionSetGate {
    fn has_permission(&self, actor: &Actor, permission: &str, _object: &ObjectRef) -> bool {
        actor.has_permission(permission)
    }
}
