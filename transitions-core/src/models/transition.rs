//! Transition engine data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Literal used in definition files for "any source state"
pub const ANY_STATE: &str = "*";

/// Reference to an object owned by another subsystem (asset, licence, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object type, e.g. `back_office_asset`
    pub kind: String,
    /// Identifier within the kind
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ObjectRef {
    type Err = String;

    /// Parse `kind:id`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(format!("expected 'kind:id', got '{}'", s)),
        }
    }
}

/// States an object must be in for a transition to apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum SourceStates {
    /// Wildcard: the transition applies from every state
    Any,
    /// Explicit set of states
    States(BTreeSet<String>),
}

impl SourceStates {
    pub fn states<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::States(states.into_iter().map(Into::into).collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// How the given state matches, if at all
    pub fn match_rank(&self, state: &str) -> Option<SourceMatch> {
        match self {
            Self::Any => Some(SourceMatch::Wildcard),
            Self::States(states) if states.contains(state) => Some(SourceMatch::Explicit),
            Self::States(_) => None,
        }
    }

    pub fn contains(&self, state: &str) -> bool {
        self.match_rank(state).is_some()
    }
}

impl TryFrom<Vec<String>> for SourceStates {
    type Error = String;

    fn try_from(states: Vec<String>) -> Result<Self, Self::Error> {
        if states.iter().any(|s| s == ANY_STATE) {
            if states.len() > 1 {
                return Err(format!("'{}' cannot be combined with other states", ANY_STATE));
            }
            return Ok(Self::Any);
        }
        Ok(Self::States(states.into_iter().collect()))
    }
}

impl From<SourceStates> for Vec<String> {
    fn from(sources: SourceStates) -> Self {
        match sources {
            SourceStates::Any => vec![ANY_STATE.to_string()],
            SourceStates::States(states) => states.into_iter().collect(),
        }
    }
}

/// Precedence of a source match; explicit matches win over wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceMatch {
    Explicit,
    Wildcard,
}

/// Persisted transition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Name, unique within the object kind
    pub name: String,
    /// Object kind the transition applies to
    pub kind: String,
    /// Allowed source states
    pub sources: SourceStates,
    /// State objects end up in
    pub target: String,
    /// Action names in declared order
    #[serde(default)]
    pub actions: Vec<String>,
    /// Permission the actor needs on every target object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    /// Force background execution even when no action is asynchronous
    #[serde(default)]
    pub run_asynchronously: bool,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TransitionDefinition {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        sources: SourceStates,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            sources,
            target: target.into(),
            actions: Vec::new(),
            permission: None,
            run_asynchronously: false,
            description: None,
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn asynchronous(mut self, run_asynchronously: bool) -> Self {
        self.run_asynchronously = run_asynchronously;
        self
    }
}

/// Object kind with the states its lifecycle field may take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectKind {
    pub name: String,
    pub states: BTreeSet<String>,
}

/// Lifecycle of a transition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Queued, no worker picked it up yet
    Pending,
    /// Action chains are executing
    Running,
    /// Every object reached the target state
    Succeeded,
    /// Some objects reached the target state, some did not
    PartiallyFailed,
    /// No object reached the target state
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::PartiallyFailed | RunStatus::Failed
        )
    }

    /// Final status from the number of objects that reached the target
    pub fn from_counts(reached: usize, total: usize) -> Self {
        if reached == total {
            RunStatus::Succeeded
        } else if reached == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially-failed",
            RunStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Where a single object stands within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Waiting for its action chain
    Pending,
    /// Action chain in progress
    Running,
    /// Chain completed and state advanced to the target
    Succeeded,
    /// Already at the target state, nothing ran
    Skipped,
    /// Failed validation (wrong source state, precondition, lock held)
    Rejected,
    /// An action failed; state left untouched
    Failed,
}

impl ObjectStatus {
    pub fn reached_target(&self) -> bool {
        matches!(self, ObjectStatus::Succeeded | ObjectStatus::Skipped)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, ObjectStatus::Pending | ObjectStatus::Running)
    }
}

/// Per-object result record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectOutcome {
    pub object: ObjectRef,
    pub status: ObjectStatus,
    /// State observed before the chain ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ObjectOutcome {
    pub fn pending(object: ObjectRef, source_state: Option<String>) -> Self {
        Self {
            object,
            status: ObjectStatus::Pending,
            source_state,
            message: None,
        }
    }

    pub fn rejected(object: ObjectRef, source_state: Option<String>, message: String) -> Self {
        Self {
            object,
            status: ObjectStatus::Rejected,
            source_state,
            message: Some(message),
        }
    }

    pub fn skipped(object: ObjectRef, source_state: Option<String>) -> Self {
        Self {
            object,
            status: ObjectStatus::Skipped,
            source_state,
            message: Some("already in target state".to_string()),
        }
    }
}

/// Outcome of one action for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
}

/// Append-only record per (run, object, action)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub object: ObjectRef,
    pub action: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// One invocation of a transition against a set of objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRun {
    pub id: Uuid,
    /// Name of the transition definition
    pub transition: String,
    /// Object kind of the definition
    pub kind: String,
    /// Target state of the definition at the time of the run
    pub target: String,
    pub objects: Vec<ObjectRef>,
    /// Username of the actor that triggered the run
    pub actor: String,
    pub status: RunStatus,
    pub outcomes: Vec<ObjectOutcome>,
    #[serde(default)]
    pub results: Vec<ActionResult>,
    /// Extra parameters collected from the actor
    #[serde(default)]
    pub params: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransitionRun {
    pub fn outcome(&self, object: &ObjectRef) -> Option<&ObjectOutcome> {
        self.outcomes.iter().find(|o| &o.object == object)
    }

    pub fn results_for<'a>(&'a self, object: &'a ObjectRef) -> impl Iterator<Item = &'a ActionResult> {
        self.results.iter().filter(move |r| &r.object == object)
    }

    pub fn reached_target_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.reached_target())
            .count()
    }

    /// Status once every object is finished
    ///
    /// A run where no object reached the target still counts as partially
    /// failed when some action succeeded along the way.
    pub fn final_status(&self) -> RunStatus {
        match RunStatus::from_counts(self.reached_target_count(), self.outcomes.len()) {
            RunStatus::Failed
                if self
                    .results
                    .iter()
                    .any(|r| r.status == ActionStatus::Succeeded) =>
            {
                RunStatus::PartiallyFailed
            }
            status => status,
        }
    }
}

/// Domain event emitted once a run finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub transition: String,
    pub status: RunStatus,
    pub outcomes: Vec<ObjectOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl From<&TransitionRun> for RunEvent {
    fn from(run: &TransitionRun) -> Self {
        Self {
            run_id: run.id,
            transition: run.transition.clone(),
            status: run.status,
            outcomes: run.outcomes.clone(),
            finished_at: run.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Audit entry written for every object that reached the target state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionHistory {
    pub id: Uuid,
    pub run_id: Uuid,
    pub transition: String,
    pub object: ObjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    pub actor: String,
    /// Actions that ran, in execution order
    pub actions: Vec<String>,
    /// Parameters the actions used, minus those excluded from history
    #[serde(default)]
    pub params: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}
