//! Transition executor: runs action chains and advances object states

use crate::models::transition::{
    ActionResult, ActionStatus, ObjectOutcome, ObjectRef, ObjectStatus, RunEvent, RunStatus,
    TransitionDefinition, TransitionHistory, TransitionRun,
};
use crate::services::logging::{log_error, log_transition_event};
use crate::transitions::error::{TransitionError, TransitionResult};
use crate::transitions::events::RunEventSink;
use crate::transitions::locks::ObjectLocks;
use crate::transitions::permission::{Actor, PermissionGate, PermissionSetGate};
use crate::transitions::persistence::RunPersistence;
use crate::transitions::registry::{ActionContext, RegisteredAction};
use crate::transitions::state_store::ObjectStateStore;
use crate::transitions::store::DefinitionStore;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An action paired with the parameters resolved for it
type ResolvedAction = (RegisteredAction, Map<String, Value>);

/// Runs transitions against objects
///
/// A run is driven object by object; each object's chain holds that object's
/// lock from the state re-check until the state is advanced or the chain
/// fails.
pub struct TransitionExecutor {
    definitions: Arc<DefinitionStore>,
    state_store: Arc<dyn ObjectStateStore>,
    gate: Arc<dyn PermissionGate>,
    persistence: Arc<RunPersistence>,
    locks: ObjectLocks,
    events: broadcast::Sender<RunEvent>,
    sinks: Vec<Arc<dyn RunEventSink>>,
}

impl TransitionExecutor {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        state_store: Arc<dyn ObjectStateStore>,
        persistence: Arc<RunPersistence>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            definitions,
            state_store,
            gate: Arc::new(PermissionSetGate),
            persistence,
            locks: ObjectLocks::new(),
            events,
            sinks: Vec::new(),
        }
    }

    /// Replace the default actor-permission gate
    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Add a sink receiving every finished run. Failures do not fail the run.
    pub fn with_sink(mut self, sink: Arc<dyn RunEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Share object locks with another executor in the same process
    pub fn with_locks(mut self, locks: ObjectLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Receive an event for every run finished after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    pub fn persistence(&self) -> &Arc<RunPersistence> {
        &self.persistence
    }

    pub fn gate(&self) -> &Arc<dyn PermissionGate> {
        &self.gate
    }

    pub fn locks(&self) -> &ObjectLocks {
        &self.locks
    }

    /// Validate, authorize and run a transition to completion
    pub async fn execute(
        &self,
        definition: &TransitionDefinition,
        objects: &[ObjectRef],
        actor: &Actor,
        params: Map<String, Value>,
    ) -> TransitionResult<TransitionRun> {
        let run = self.prepare(definition, objects, actor, params)?;
        self.run_prepared(definition, run.id, actor).await
    }

    /// Validate and authorize a request, persisting a pending run
    ///
    /// Objects in the wrong state, of another kind, or failing an action
    /// precondition are recorded as rejected; objects already at the target
    /// are recorded as skipped. Permission denial and missing required
    /// parameters reject the whole request and nothing is persisted.
    pub fn prepare(
        &self,
        definition: &TransitionDefinition,
        objects: &[ObjectRef],
        actor: &Actor,
        params: Map<String, Value>,
    ) -> TransitionResult<TransitionRun> {
        let mut seen = HashSet::new();
        let objects: Vec<ObjectRef> = objects
            .iter()
            .filter(|object| seen.insert(*object))
            .cloned()
            .collect();
        if objects.is_empty() {
            return Err(TransitionError::invalid_request(
                &definition.name,
                "no target objects given",
            ));
        }

        let actions = self.resolve_actions(definition, &params)?;
        self.gate.authorize(actor, definition, &objects)?;

        let mut outcomes = Vec::with_capacity(objects.len());
        for object in &objects {
            outcomes.push(self.validate_object(definition, object)?);
        }

        let pending: Vec<ObjectRef> = outcomes
            .iter()
            .filter(|o| o.status == ObjectStatus::Pending)
            .map(|o| o.object.clone())
            .collect();
        if !pending.is_empty() {
            let mut reasons: BTreeMap<ObjectRef, String> = BTreeMap::new();
            for (entry, _) in &actions {
                for (object, reason) in entry.action.precondition(&pending, actor) {
                    reasons
                        .entry(object)
                        .or_insert_with(|| format!("{}: {}", entry.display_name(), reason));
                }
            }
            for outcome in outcomes.iter_mut() {
                if let Some(reason) = reasons.remove(&outcome.object) {
                    *outcome = ObjectOutcome::rejected(
                        outcome.object.clone(),
                        outcome.source_state.take(),
                        reason,
                    );
                }
            }
        }

        let run = TransitionRun {
            id: Uuid::new_v4(),
            transition: definition.name.clone(),
            kind: definition.kind.clone(),
            target: definition.target.clone(),
            objects,
            actor: actor.username.clone(),
            status: RunStatus::Pending,
            outcomes,
            results: Vec::new(),
            params,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.persistence.create_run(run.clone())?;

        tracing::info!(
            run_id = %run.id,
            transition = %definition.name,
            actor = %actor.username,
            objects = run.objects.len(),
            "Prepared transition run"
        );

        Ok(run)
    }

    /// Drive a prepared run to completion
    ///
    /// Action failures are recorded and never returned. A storage error
    /// fails only the object it hit; the run is still finished and published
    /// before the first such error is returned.
    ///
    /// Objects still pending or running are driven, so an interrupted run
    /// can be passed in again: actions already recorded as succeeded for an
    /// object are not repeated, and an object with a recorded failure fails.
    pub async fn run_prepared(
        &self,
        definition: &TransitionDefinition,
        run_id: Uuid,
        actor: &Actor,
    ) -> TransitionResult<TransitionRun> {
        let run = self
            .persistence
            .get_run(run_id)
            .ok_or(TransitionError::RunNotFound(run_id))?;
        let actions = self.resolve_actions(definition, &run.params)?;

        let mut storage_error: Option<TransitionError> = None;
        if let Err(e) = self.persistence.start_run(run_id) {
            log_error(&e.to_string(), Some("start transition run"));
            storage_error = Some(e.into());
        }
        tracing::info!(run_id = %run_id, transition = %definition.name, "Starting transition run");

        let mut outcomes = run.outcomes.clone();
        for outcome in outcomes.iter_mut() {
            if outcome.status.is_finished() {
                continue;
            }
            if storage_error.is_some() {
                outcome.status = ObjectStatus::Failed;
                outcome.message = Some("run could not be started".to_string());
                continue;
            }

            // results recorded before an interruption
            let prior: Vec<&ActionResult> = run
                .results
                .iter()
                .filter(|r| r.object == outcome.object)
                .collect();
            if let Some(failed) = prior.iter().find(|r| r.status == ActionStatus::Failed) {
                *outcome = ObjectOutcome {
                    status: ObjectStatus::Failed,
                    message: Some(format!(
                        "action '{}' failed before the run was interrupted",
                        failed.action
                    )),
                    ..outcome.clone()
                };
            } else {
                let completed: HashSet<String> =
                    prior.iter().map(|r| r.action.clone()).collect();
                *outcome = match self
                    .run_object(definition, run_id, actor, &actions, &outcome.object, &completed)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        log_error(&e.to_string(), Some(outcome.object.to_string().as_str()));
                        ObjectOutcome {
                            status: ObjectStatus::Failed,
                            message: Some(format!("storage error: {}", e)),
                            ..outcome.clone()
                        }
                    }
                };
            }
            if let Err(e) = self
                .persistence
                .record_object_outcome(run_id, outcome.clone())
            {
                log_error(&e.to_string(), Some("record object outcome"));
                storage_error.get_or_insert(e.into());
            }
        }

        let mut snapshot = self.persistence.get_run(run_id).unwrap_or(run);
        snapshot.outcomes = outcomes;
        let status = snapshot.final_status();
        let finished = match self.persistence.finish_run(run_id, status) {
            Ok(finished) => finished,
            Err(e) => {
                log_error(&e.to_string(), Some("finish transition run"));
                storage_error.get_or_insert(e.into());
                snapshot.status = status;
                snapshot.finished_at = Some(Utc::now());
                snapshot
            }
        };
        let reached = finished.reached_target_count();

        tracing::info!(
            run_id = %run_id,
            transition = %definition.name,
            success = reached,
            failed = finished.outcomes.len() - reached,
            "Transition run counters"
        );

        self.publish(RunEvent::from(&finished)).await;
        match storage_error {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }

    /// Finish a run left unfinished by an interrupted process
    ///
    /// The actor is rebuilt from the recorded username; the request was
    /// authorized when the run was prepared. Finished runs are returned as
    /// they are.
    pub async fn resume_run(&self, run_id: Uuid) -> TransitionResult<TransitionRun> {
        self.persistence.refresh()?;
        let run = self
            .persistence
            .get_run(run_id)
            .ok_or(TransitionError::RunNotFound(run_id))?;
        if run.status.is_finished() {
            tracing::warn!(run_id = %run_id, "Run already finished - nothing to resume");
            return Ok(run);
        }

        let definition = self.definitions.get(&run.kind, &run.transition)?.clone();
        tracing::info!(
            run_id = %run_id,
            transition = %definition.name,
            "Resuming interrupted transition run"
        );
        self.run_prepared(&definition, run_id, &Actor::new(run.actor.clone()))
            .await
    }

    fn resolve_actions(
        &self,
        definition: &TransitionDefinition,
        params: &Map<String, Value>,
    ) -> TransitionResult<Vec<ResolvedAction>> {
        self.definitions
            .ordered_actions(definition)?
            .into_iter()
            .map(|entry| {
                let resolved = entry
                    .resolve_params(params)
                    .map_err(|reason| TransitionError::invalid_request(&definition.name, reason))?;
                Ok((entry, resolved))
            })
            .collect()
    }

    /// Classify one object before the run starts
    fn validate_object(
        &self,
        definition: &TransitionDefinition,
        object: &ObjectRef,
    ) -> TransitionResult<ObjectOutcome> {
        if object.kind != definition.kind {
            return Ok(ObjectOutcome::rejected(
                object.clone(),
                None,
                format!(
                    "object kind '{}' does not match transition kind '{}'",
                    object.kind, definition.kind
                ),
            ));
        }

        let state = self.state_store.current_state(object)?;
        Ok(self.classify_state(definition, object, state))
    }

    fn classify_state(
        &self,
        definition: &TransitionDefinition,
        object: &ObjectRef,
        state: Option<String>,
    ) -> ObjectOutcome {
        match state {
            None => ObjectOutcome::rejected(object.clone(), None, "object not found".to_string()),
            Some(state) if state == definition.target => {
                ObjectOutcome::skipped(object.clone(), Some(state))
            }
            Some(state) if !definition.sources.contains(&state) => {
                let message = format!(
                    "state '{}' is not a source state of '{}'",
                    state, definition.name
                );
                ObjectOutcome::rejected(object.clone(), Some(state), message)
            }
            Some(state) => ObjectOutcome::pending(object.clone(), Some(state)),
        }
    }

    /// Run the action chain for one object under its lock
    async fn run_object(
        &self,
        definition: &TransitionDefinition,
        run_id: Uuid,
        actor: &Actor,
        actions: &[ResolvedAction],
        object: &ObjectRef,
        completed: &HashSet<String>,
    ) -> TransitionResult<ObjectOutcome> {
        let Some(_guard) = self.locks.try_acquire(object, run_id) else {
            log_transition_event("locked", &definition.name, object, None);
            return Ok(ObjectOutcome::rejected(
                object.clone(),
                None,
                "another transition is already running".to_string(),
            ));
        };

        // the state may have moved between prepare and the lock
        let outcome = self.classify_state(definition, object, self.state_store.current_state(object)?);
        if outcome.status == ObjectStatus::Skipped
            && !completed.is_empty()
            && actions.iter().all(|(entry, _)| completed.contains(&entry.name))
        {
            return Ok(ObjectOutcome {
                status: ObjectStatus::Succeeded,
                message: Some("state advanced before the run was interrupted".to_string()),
                ..outcome
            });
        }
        if outcome.status != ObjectStatus::Pending {
            return Ok(outcome);
        }
        let source = outcome.source_state.clone().unwrap_or_default();

        self.persistence.record_object_outcome(
            run_id,
            ObjectOutcome {
                status: ObjectStatus::Running,
                ..outcome.clone()
            },
        )?;
        log_transition_event("started", &definition.name, object, Some(source.as_str()));

        let mut shared = Map::new();
        let mut history_params = Map::new();
        for (entry, params) in actions {
            if completed.contains(&entry.name) {
                tracing::debug!(run_id = %run_id, object = %object, action = %entry.name, "Action already performed - skipping");
                history_params.extend(entry.history_params(params));
                continue;
            }
            let started = Instant::now();
            let result = {
                let mut ctx = ActionContext {
                    run_id,
                    transition: &definition.name,
                    actor,
                    params,
                    shared: &mut shared,
                };
                AssertUnwindSafe(entry.action.run(&mut ctx, object))
                    .catch_unwind()
                    .await
            };
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.message),
                Err(payload) => Some(panic_message(payload)),
            };

            self.persistence.record_action_result(
                run_id,
                ActionResult {
                    object: object.clone(),
                    action: entry.name.clone(),
                    status: if error.is_none() {
                        ActionStatus::Succeeded
                    } else {
                        ActionStatus::Failed
                    },
                    message: error.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    recorded_at: Utc::now(),
                },
            )?;

            if let Some(message) = error {
                tracing::warn!(
                    run_id = %run_id,
                    transition = %definition.name,
                    object = %object,
                    action = %entry.name,
                    "Action failed: {}",
                    message
                );
                return Ok(ObjectOutcome {
                    status: ObjectStatus::Failed,
                    message: Some(format!("action '{}' failed: {}", entry.name, message)),
                    ..outcome
                });
            }
            history_params.extend(entry.history_params(params));
        }

        if !self
            .state_store
            .compare_and_set(object, &source, &definition.target)?
        {
            log_transition_event("state_changed", &definition.name, object, Some(source.as_str()));
            return Ok(ObjectOutcome {
                status: ObjectStatus::Failed,
                message: Some(format!(
                    "state changed from '{}' while the transition was running",
                    source
                )),
                ..outcome
            });
        }

        // the state has moved, so the object succeeded even if the audit write fails
        let history = self.persistence.append_history(TransitionHistory {
            id: Uuid::new_v4(),
            run_id,
            transition: definition.name.clone(),
            object: object.clone(),
            source: Some(source),
            target: definition.target.clone(),
            actor: actor.username.clone(),
            actions: actions.iter().map(|(entry, _)| entry.name.clone()).collect(),
            params: history_params,
            recorded_at: Utc::now(),
        });
        log_transition_event("completed", &definition.name, object, Some(definition.target.as_str()));

        let message = match history {
            Ok(()) => None,
            Err(e) => {
                log_error(&e.to_string(), Some("append transition history"));
                Some(format!("history not recorded: {}", e))
            }
        };
        Ok(ObjectOutcome {
            status: ObjectStatus::Succeeded,
            message,
            ..outcome
        })
    }

    async fn publish(&self, event: RunEvent) {
        // no subscribers is fine
        let _ = self.events.send(event.clone());

        for sink in &self.sinks {
            if let Err(e) = sink.publish(&event).await {
                tracing::warn!(
                    sink = sink.name(),
                    run_id = %event.run_id,
                    "Failed to publish run event: {}",
                    e
                );
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("action panicked: {}", detail)
}
