//! Integration tests for running transitions against objects

use serde_json::Map;
use std::sync::{Arc, Mutex};
use transitions_core::models::{
    ActionStatus, ObjectKind, ObjectRef, ObjectStatus, RunStatus, SourceStates,
    TransitionDefinition,
};
use transitions_core::transitions::{
    ActionContext, ActionExecutionError, ActionRegistry, Actor, DefinitionStore, FnAction,
    InMemoryStateStore, RunAwaiter, RunPersistence, TransitionExecutor,
};

struct Harness {
    executor: TransitionExecutor,
    states: Arc<InMemoryStateStore>,
    /// Names of actions that ran, as `action:object_id`
    calls: Arc<Mutex<Vec<String>>>,
    deploy: TransitionDefinition,
}

/// Asset lifecycle with `deploy: new -> in_use` running assign_owner then notify
fn harness(notify_fails: bool) -> Harness {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut builder = ActionRegistry::builder();

    let assign_calls = calls.clone();
    builder
        .register(
            "assign_owner",
            Arc::new(FnAction::new(move |_ctx: &mut ActionContext<'_>, object: &ObjectRef| {
                assign_calls
                    .lock()
                    .unwrap()
                    .push(format!("assign_owner:{}", object.id));
                Ok(())
            })),
            vec![],
        )
        .unwrap();

    let notify_calls = calls.clone();
    builder
        .register(
            "notify",
            Arc::new(FnAction::new(move |_ctx: &mut ActionContext<'_>, object: &ObjectRef| {
                notify_calls
                    .lock()
                    .unwrap()
                    .push(format!("notify:{}", object.id));
                if notify_fails {
                    Err(ActionExecutionError::new("mail server unreachable"))
                } else {
                    Ok(())
                }
            })),
            vec![],
        )
        .unwrap();

    let mut store = DefinitionStore::new(Arc::new(builder.build()));
    store.register_kind(ObjectKind {
        name: "asset".to_string(),
        states: ["new", "in_use", "retired"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    });
    let deploy = store
        .create(
            TransitionDefinition::new("asset", "deploy", SourceStates::states(["new"]), "in_use")
                .with_actions(["assign_owner", "notify"]),
        )
        .unwrap()
        .clone();

    let states = Arc::new(InMemoryStateStore::new());
    let executor = TransitionExecutor::new(
        Arc::new(store),
        states.clone(),
        Arc::new(RunPersistence::in_memory()),
    );

    Harness {
        executor,
        states,
        calls,
        deploy,
    }
}

/// Later action failing keeps the object in its source state
#[tokio::test]
async fn test_failed_action_keeps_source_state() {
    let h = harness(true);
    let object = ObjectRef::new("asset", "1");
    h.states.set_state(object.clone(), "new");

    let run = h
        .executor
        .execute(&h.deploy, &[object.clone()], &Actor::new("alice"), Map::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    assert_eq!(h.states.state(&object).as_deref(), Some("new"));

    let results: Vec<_> = run.results_for(&object).collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].action, "assign_owner");
    assert_eq!(results[0].status, ActionStatus::Succeeded);
    assert_eq!(results[1].action, "notify");
    assert_eq!(results[1].status, ActionStatus::Failed);
    assert_eq!(results[1].message.as_deref(), Some("mail server unreachable"));

    assert_eq!(run.outcome(&object).unwrap().status, ObjectStatus::Failed);
    assert!(h.executor.persistence().history(Some(&object)).is_empty());
}

/// Every action succeeding moves the object to the target
#[tokio::test]
async fn test_successful_chain_advances_state() {
    let h = harness(false);
    let object = ObjectRef::new("asset", "1");
    h.states.set_state(object.clone(), "new");

    let run = h
        .executor
        .execute(&h.deploy, &[object.clone()], &Actor::new("alice"), Map::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.states.state(&object).as_deref(), Some("in_use"));
    assert_eq!(
        *h.calls.lock().unwrap(),
        vec!["assign_owner:1".to_string(), "notify:1".to_string()]
    );
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());

    let history = h.executor.persistence().history(Some(&object));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actions, vec!["assign_owner", "notify"]);
}

/// Invalid source state is rejected while the valid object proceeds
#[tokio::test]
async fn test_invalid_source_rejected_valid_processed() {
    let h = harness(false);
    let valid = ObjectRef::new("asset", "1");
    let retired = ObjectRef::new("asset", "2");
    h.states.set_state(valid.clone(), "new");
    h.states.set_state(retired.clone(), "retired");

    let run = h
        .executor
        .execute(
            &h.deploy,
            &[valid.clone(), retired.clone()],
            &Actor::new("alice"),
            Map::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    assert_eq!(run.outcome(&valid).unwrap().status, ObjectStatus::Succeeded);

    let rejected = run.outcome(&retired).unwrap();
    assert_eq!(rejected.status, ObjectStatus::Rejected);
    assert_eq!(rejected.source_state.as_deref(), Some("retired"));
    assert!(rejected.message.as_deref().unwrap().contains("retired"));

    assert_eq!(h.states.state(&valid).as_deref(), Some("in_use"));
    assert_eq!(h.states.state(&retired).as_deref(), Some("retired"));
    assert_eq!(run.results_for(&retired).count(), 0);
}

/// Object already at the target runs nothing and keeps its state
#[tokio::test]
async fn test_no_op_transition_is_idempotent() {
    let h = harness(false);
    let object = ObjectRef::new("asset", "1");
    h.states.set_state(object.clone(), "in_use");

    for _ in 0..2 {
        let run = h
            .executor
            .execute(&h.deploy, &[object.clone()], &Actor::new("alice"), Map::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.outcome(&object).unwrap().status, ObjectStatus::Skipped);
        assert!(run.results.is_empty());
    }

    assert!(h.calls.lock().unwrap().is_empty());
    assert_eq!(h.states.state(&object).as_deref(), Some("in_use"));
    assert!(h.executor.persistence().history(None).is_empty());
}

/// Objects reaching the target plus objects not reaching it equals the total
#[tokio::test]
async fn test_no_object_is_lost() {
    let h = harness(false);
    let objects: Vec<ObjectRef> = (0..6).map(|i| ObjectRef::new("asset", i.to_string())).collect();
    let seeded = ["new", "in_use", "retired", "new", "damaged"];
    for (object, state) in objects.iter().zip(seeded) {
        h.states.set_state(object.clone(), state);
    }
    // objects[5] is unknown to the store

    let run = h
        .executor
        .execute(&h.deploy, &objects, &Actor::new("alice"), Map::new())
        .await
        .unwrap();

    let reached = run.reached_target_count();
    let not_reached = run
        .outcomes
        .iter()
        .filter(|o| !o.status.reached_target())
        .count();
    assert_eq!(reached, 3);
    assert_eq!(reached + not_reached, objects.len());
    assert!(run.outcomes.iter().all(|o| o.status.is_finished()));
    assert_eq!(run.status, RunStatus::PartiallyFailed);
}

/// The awaiter reports the executor's persisted view
#[tokio::test]
async fn test_awaiter_reports_finished_run() {
    let h = harness(false);
    let first = ObjectRef::new("asset", "1");
    let second = ObjectRef::new("asset", "2");
    h.states.set_state(first.clone(), "new");
    h.states.set_state(second.clone(), "retired");

    let run = h
        .executor
        .execute(&h.deploy, &[first, second], &Actor::new("alice"), Map::new())
        .await
        .unwrap();

    let awaiter = RunAwaiter::new(h.executor.persistence().clone());
    let progress = awaiter.get_status(run.id).unwrap();
    assert!(progress.is_finished());
    assert_eq!(progress.status, RunStatus::PartiallyFailed);
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.pending, 0);
}
