//! Error taxonomy of the transition engine

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of the registry, store, gate, executor and awaiter
#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Action '{0}' is already registered")]
    DuplicateAction(String),

    #[error("Invalid transition definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Transition '{name}' not found for object kind '{kind}'")]
    UnknownTransition { kind: String, name: String },

    #[error("Ambiguous transition from '{state}' to '{target}' for '{kind}': {candidates:?}")]
    AmbiguousTransition {
        kind: String,
        state: String,
        target: String,
        candidates: Vec<String>,
    },

    #[error("Actor '{actor}' is not allowed to run transition '{transition}' on {object}")]
    PermissionDenied {
        actor: String,
        transition: String,
        object: String,
    },

    #[error("Invalid transition request for '{transition}': {reason}")]
    InvalidRequest { transition: String, reason: String },

    #[error("Transition run {0} not found")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TransitionError {
    pub(crate) fn invalid_definition(name: &str, reason: impl Into<String>) -> Self {
        TransitionError::InvalidDefinition {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_request(transition: &str, reason: impl Into<String>) -> Self {
        TransitionError::InvalidRequest {
            transition: transition.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for engine operations
pub type TransitionResult<T> = std::result::Result<T, TransitionError>;

/// Terminal failure signalled by an action
///
/// The executor records it as a failed action result and stops the object's
/// chain; it never reaches the caller of `execute`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionExecutionError {
    pub message: String,
}

impl ActionExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ActionExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}
