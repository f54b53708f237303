//! Dispatch of transition runs: inline for synchronous definitions, on a
//! bounded pool of tokio tasks for asynchronous ones

use crate::models::transition::{ObjectRef, TransitionDefinition, TransitionRun};
use crate::transitions::error::{TransitionError, TransitionResult};
use crate::transitions::executor::TransitionExecutor;
use crate::transitions::permission::Actor;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of asking for a transition
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Ran inline; the finished run
    Completed(TransitionRun),
    /// Queued in the background; poll the run id
    Queued(Uuid),
}

impl DispatchOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            DispatchOutcome::Completed(run) => run.id,
            DispatchOutcome::Queued(run_id) => *run_id,
        }
    }
}

/// Routes transition requests to the executor
pub struct TransitionDispatcher {
    executor: Arc<TransitionExecutor>,
    /// Background run handles
    active_runs: Arc<DashMap<Uuid, JoinHandle<TransitionResult<TransitionRun>>>>,
    /// Caps how many background runs execute at once
    permits: Arc<Semaphore>,
}

impl TransitionDispatcher {
    pub fn new(executor: Arc<TransitionExecutor>, max_concurrent_runs: usize) -> Self {
        Self {
            executor,
            active_runs: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }

    pub fn executor(&self) -> &Arc<TransitionExecutor> {
        &self.executor
    }

    /// Run a transition by name
    ///
    /// Synchronous definitions run to completion before returning;
    /// asynchronous ones are validated and persisted, then queued.
    pub async fn run_transition(
        &self,
        kind: &str,
        name: &str,
        objects: &[ObjectRef],
        actor: Actor,
        params: Map<String, Value>,
    ) -> TransitionResult<DispatchOutcome> {
        let definitions = self.executor.definitions();
        let definition = definitions.get(kind, name)?.clone();

        if definitions.is_async(&definition) {
            let run_id = self.submit(definition, objects, actor, params)?;
            return Ok(DispatchOutcome::Queued(run_id));
        }

        let run = self
            .executor
            .execute(&definition, objects, &actor, params)
            .await?;
        Ok(DispatchOutcome::Completed(run))
    }

    /// Queue a run in the background and return its id
    ///
    /// Validation, authorization and parameter errors are returned here,
    /// before anything is queued.
    pub fn submit(
        &self,
        definition: TransitionDefinition,
        objects: &[ObjectRef],
        actor: Actor,
        params: Map<String, Value>,
    ) -> TransitionResult<Uuid> {
        let run = self.executor.prepare(&definition, objects, &actor, params)?;
        let run_id = run.id;

        let executor = self.executor.clone();
        self.spawn(run_id, async move {
            tracing::info!(run_id = %run_id, transition = %definition.name, "Picked up queued transition run");
            executor.run_prepared(&definition, run_id, &actor).await
        });
        tracing::info!(run_id = %run_id, "Queued transition run");

        Ok(run_id)
    }

    /// Queue every unfinished run in the store that is not executing here
    ///
    /// Meant for startup after a crash or kill. Runs whose definition no
    /// longer exists are left alone.
    pub fn resume_unfinished(&self) -> TransitionResult<Vec<Uuid>> {
        let persistence = self.executor.persistence();
        persistence.refresh()?;

        let mut resumed = Vec::new();
        for run in persistence.find_unfinished_runs() {
            if self.is_running(run.id) {
                continue;
            }
            if let Err(e) = self.executor.definitions().get(&run.kind, &run.transition) {
                tracing::warn!(run_id = %run.id, "Cannot resume run: {}", e);
                continue;
            }

            let run_id = run.id;
            let executor = self.executor.clone();
            self.spawn(run_id, async move { executor.resume_run(run_id).await });
            tracing::info!(run_id = %run_id, transition = %run.transition, "Queued interrupted transition run");
            resumed.push(run_id);
        }
        Ok(resumed)
    }

    fn spawn<F>(&self, run_id: Uuid, run: F)
    where
        F: std::future::Future<Output = TransitionResult<TransitionRun>> + Send + 'static,
    {
        self.prune_finished();
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|e| {
                TransitionError::Storage(anyhow::anyhow!("Worker pool closed: {}", e))
            })?;
            run.await
        });
        self.active_runs.insert(run_id, handle);
    }

    /// Drop handles of background runs that have finished; their results
    /// stay available from persistence
    fn prune_finished(&self) {
        self.active_runs.retain(|_, handle| !handle.is_finished());
    }

    /// Check if a background run is still executing
    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.active_runs
            .get(&run_id)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Count of background runs still executing or waiting for a worker
    pub fn active_count(&self) -> usize {
        self.prune_finished();
        self.active_runs.len()
    }

    /// Wait for a run to finish and return it
    pub async fn wait_for_completion(&self, run_id: Uuid) -> TransitionResult<TransitionRun> {
        if let Some((_key, handle)) = self.active_runs.remove(&run_id) {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(TransitionError::Storage(anyhow::anyhow!(
                    "Transition run task failed: {}",
                    e
                ))),
            }
        } else {
            // not queued here or already pruned, check persistence
            self.executor
                .persistence()
                .get_run(run_id)
                .ok_or(TransitionError::RunNotFound(run_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transition::{RunStatus, SourceStates};
    use crate::transitions::error::ActionExecutionError;
    use crate::transitions::persistence::RunPersistence;
    use crate::transitions::registry::{ActionContext, ActionRegistry, TransitionAction};
    use crate::transitions::state_store::InMemoryStateStore;
    use crate::transitions::store::DefinitionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Slow action tracking how many copies run at once
    struct SlowAction {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransitionAction for SlowAction {
        async fn run(
            &self,
            _ctx: &mut ActionContext<'_>,
            _object: &ObjectRef,
        ) -> Result<(), ActionExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_async(&self) -> bool {
            true
        }
    }

    fn dispatcher(max_concurrent_runs: usize) -> (TransitionDispatcher, Arc<InMemoryStateStore>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = ActionRegistry::builder();
        builder
            .register(
                "reinstall",
                Arc::new(SlowAction {
                    running: Arc::new(AtomicUsize::new(0)),
                    peak: peak.clone(),
                }),
                vec![],
            )
            .unwrap();

        let mut store = DefinitionStore::new(Arc::new(builder.build()));
        store
            .create(
                TransitionDefinition::new("asset", "reinstall", SourceStates::states(["new"]), "in_use")
                    .with_actions(["reinstall"]),
            )
            .unwrap();
        store
            .create(TransitionDefinition::new("asset", "scrap", SourceStates::Any, "retired"))
            .unwrap();

        let states = Arc::new(InMemoryStateStore::new());
        let executor = TransitionExecutor::new(
            Arc::new(store),
            states.clone(),
            Arc::new(RunPersistence::in_memory()),
        );
        (
            TransitionDispatcher::new(Arc::new(executor), max_concurrent_runs),
            states,
            peak,
        )
    }

    #[tokio::test]
    async fn test_sync_transition_completes_inline() {
        let (dispatcher, states, _) = dispatcher(2);
        let object = ObjectRef::new("asset", "1");
        states.set_state(object.clone(), "new");

        let outcome = dispatcher
            .run_transition("asset", "scrap", &[object.clone()], Actor::new("bob"), Map::new())
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Completed(run) => assert_eq!(run.status, RunStatus::Succeeded),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(states.state(&object).as_deref(), Some("retired"));
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_async_transition_is_queued() {
        let (dispatcher, states, _) = dispatcher(2);
        let object = ObjectRef::new("asset", "1");
        states.set_state(object.clone(), "new");

        let outcome = dispatcher
            .run_transition("asset", "reinstall", &[object.clone()], Actor::new("bob"), Map::new())
            .await
            .unwrap();
        let DispatchOutcome::Queued(run_id) = outcome else {
            panic!("expected a queued run");
        };

        let run = dispatcher.wait_for_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(states.state(&object).as_deref(), Some("in_use"));
        assert!(!dispatcher.is_running(run_id));
    }

    #[tokio::test]
    async fn test_unknown_transition_fails() {
        let (dispatcher, _, _) = dispatcher(1);
        let err = dispatcher
            .run_transition("asset", "teleport", &[ObjectRef::new("asset", "1")], Actor::new("bob"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::UnknownTransition { .. }));
    }

    #[tokio::test]
    async fn test_worker_pool_limits_concurrency() {
        let (dispatcher, states, peak) = dispatcher(1);
        let mut run_ids = Vec::new();
        for i in 0..3 {
            let object = ObjectRef::new("asset", i.to_string());
            states.set_state(object.clone(), "new");
            let outcome = dispatcher
                .run_transition("asset", "reinstall", &[object], Actor::new("bob"), Map::new())
                .await
                .unwrap();
            run_ids.push(outcome.run_id());
        }

        for run_id in run_ids {
            let run = dispatcher.wait_for_completion(run_id).await.unwrap();
            assert_eq!(run.status, RunStatus::Succeeded);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finished_handles_are_pruned() {
        let (dispatcher, states, _) = dispatcher(2);
        let object = ObjectRef::new("asset", "1");
        states.set_state(object.clone(), "new");

        let run_id = dispatcher
            .run_transition("asset", "reinstall", &[object], Actor::new("bob"), Map::new())
            .await
            .unwrap()
            .run_id();

        // nobody collects the handle
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finished run still counted as active");

        assert!(!dispatcher.is_running(run_id));
        let run = dispatcher.wait_for_completion(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resume_unfinished_runs() {
        let (dispatcher, states, _) = dispatcher(2);
        let (a, b) = (ObjectRef::new("asset", "1"), ObjectRef::new("asset", "2"));
        states.set_state(a.clone(), "new");
        states.set_state(b.clone(), "new");

        // prepared but never picked up, as after a crash
        let executor = dispatcher.executor().clone();
        let definition = executor.definitions().get("asset", "reinstall").unwrap().clone();
        let pending = executor
            .prepare(&definition, &[a.clone()], &Actor::new("bob"), Map::new())
            .unwrap();
        let done = executor
            .execute(&definition, &[b.clone()], &Actor::new("bob"), Map::new())
            .await
            .unwrap();

        let resumed = dispatcher.resume_unfinished().unwrap();
        assert_eq!(resumed, vec![pending.id]);
        assert!(!resumed.contains(&done.id));

        let run = dispatcher.wait_for_completion(pending.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.actor, "bob");
        assert_eq!(states.state(&a).as_deref(), Some("in_use"));
        assert!(dispatcher.resume_unfinished().unwrap().is_empty());
    }
}
