//! Command handlers

use crate::cli::builtin_actions::builtin_registry;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use transitions_core::models::{Configuration, ObjectRef, RunStatus, TransitionRun};
use transitions_core::transitions::{
    Actor, DefinitionFile, DefinitionStore, DispatchOutcome, LogSink, PermissionSetGate,
    RunAwaiter, RunPersistence, RunProgress, TransitionDispatcher, TransitionExecutor,
};
use uuid::Uuid;

/// Arguments of the `run` command
pub struct RunArgs {
    pub file: String,
    pub transition: String,
    pub objects: Vec<String>,
    pub actor: Option<String>,
    pub permissions: Vec<String>,
    pub superuser: bool,
    pub params: Vec<String>,
    pub wait: bool,
    pub json: bool,
}

/// Load and validate the configuration, from `path` or the default location
pub fn load_configuration(path: Option<&str>) -> Result<Configuration> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => Configuration::default_config_path()?,
    };
    let config = Configuration::load_from_file(&path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))?;
    config
        .validate()
        .map_err(|errors| anyhow::anyhow!("Invalid configuration: {}", errors.join("; ")))?;
    Ok(config)
}

/// Parse `key=value`; values that parse as JSON keep their type
pub fn parse_param(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid parameter '{}', expected key=value", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid parameter '{}', empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    raw.iter().map(|p| parse_param(p)).collect()
}

pub fn parse_objects(raw: &[String]) -> Result<Vec<ObjectRef>> {
    raw.iter()
        .map(|o| o.parse::<ObjectRef>().map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid run ID: {}", raw))
}

/// Read a definition file, or every definition file of a directory
pub fn load_definitions(path: &str) -> Result<DefinitionFile> {
    let path = Path::new(path);
    if path.is_dir() {
        DefinitionFile::load_dir(path)
    } else {
        DefinitionFile::load(path)
    }
}

fn build_store(path: &str) -> Result<DefinitionStore> {
    let registry = Arc::new(builtin_registry()?);
    let store = load_definitions(path)?
        .into_store(registry)
        .context("Failed to load transition definitions")?;
    Ok(store)
}

pub fn build_actor(username: String, permissions: Vec<String>, superuser: bool) -> Actor {
    let actor = if superuser {
        Actor::superuser(username)
    } else {
        Actor::new(username)
    };
    actor.with_permissions(permissions)
}

/// Handle validate command
pub async fn handle_validate(file: String, json: bool) -> Result<()> {
    let definitions = load_definitions(&file)?;
    let registry = builtin_registry()?;
    let result = definitions.validate(&registry);

    if json {
        let json_output = serde_json::json!({
            "valid": result.is_valid(),
            "kinds": definitions.kinds.len(),
            "transitions": definitions.transitions.len(),
            "errors": result.errors.iter().map(|e| serde_json::json!({
                "field": e.field,
                "message": e.message,
            })).collect::<Vec<_>>(),
            "warnings": result.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else {
        println!("Validating definitions: {}", file);
        println!();
        if result.is_valid() {
            println!("✓ Definitions are valid");
            println!("  Object kinds: {}", definitions.kinds.len());
            println!("  Transitions:  {}", definitions.transitions.len());
        } else {
            println!("✗ Definition validation failed");
            println!();
            println!("Errors:");
            for error in &result.errors {
                println!("  ✗ {}: {}", error.field, error.message);
            }
        }
        if !result.warnings.is_empty() {
            println!();
            println!("Warnings:");
            for warning in &result.warnings {
                println!("  ⚠  {}", warning);
            }
        }
    }

    if !result.is_valid() {
        return Err(anyhow::anyhow!("Definition validation failed"));
    }
    Ok(())
}

/// Handle list command
pub async fn handle_list(
    file: String,
    kind: Option<String>,
    state: Option<String>,
    actor: Option<Actor>,
    json: bool,
) -> Result<()> {
    let store = build_store(&file)?;

    let definitions = match (&kind, &state) {
        (Some(kind), Some(state)) => match &actor {
            Some(actor) => store.available_for(&PermissionSetGate, actor, kind, state),
            None => store.find_applicable(kind, state),
        },
        (None, Some(_)) => anyhow::bail!("--state requires --kind"),
        (Some(kind), None) => store.definitions_for(kind),
        (None, None) => store.all().collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!("No transitions found.");
        return Ok(());
    }

    println!("Found {} transition(s):", definitions.len());
    if let Some(states) = kind.as_deref().and_then(|k| store.kind_states(k)) {
        let states: Vec<&str> = states.iter().map(String::as_str).collect();
        println!("States: {}", states.join(", "));
    }
    println!();
    for definition in definitions {
        let sources: Vec<String> = definition.sources.clone().into();
        println!(
            "  • {}/{}: [{}] → {}",
            definition.kind,
            definition.name,
            sources.join(", "),
            definition.target
        );
        if let Some(description) = &definition.description {
            println!("    Description: {}", description);
        }
        if !definition.actions.is_empty() {
            println!("    Actions:     {}", definition.actions.join(", "));
        }
        if let Some(permission) = &definition.permission {
            println!("    Permission:  {}", permission);
        }
        if store.is_async(definition) {
            println!("    Runs asynchronously");
        }
    }

    Ok(())
}

/// Handle run command
pub async fn handle_run(config: &Configuration, args: RunArgs) -> Result<()> {
    let store = build_store(&args.file)?;
    let objects = parse_objects(&args.objects)?;
    let kind = objects
        .first()
        .map(|o| o.kind.clone())
        .context("At least one --object is required")?;
    let params = parse_params(&args.params)?;
    let actor = build_actor(
        args.actor.unwrap_or_else(|| config.default_actor.clone()),
        args.permissions,
        args.superuser,
    );

    let persistence = Arc::new(
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?,
    );
    let executor = TransitionExecutor::new(Arc::new(store), persistence.clone(), persistence.clone())
        .with_sink(Arc::new(LogSink));
    let dispatcher = TransitionDispatcher::new(Arc::new(executor), config.max_concurrent_runs);

    let outcome = dispatcher
        .run_transition(&kind, &args.transition, &objects, actor, params)
        .await?;

    let run = match outcome {
        DispatchOutcome::Completed(run) => run,
        DispatchOutcome::Queued(run_id) => {
            if !args.json {
                println!("Queued run {}", run_id);
            }
            if args.wait && !args.json {
                let awaiter = RunAwaiter::new(persistence.clone());
                let poll = Duration::from_millis(config.poll_interval_ms);
                let mut last_pending = None;
                while dispatcher.is_running(run_id) {
                    let progress = awaiter.get_status(run_id)?;
                    if last_pending != Some(progress.pending) {
                        println!(
                            "  {} completed, {} failed, {} pending",
                            progress.completed, progress.failed, progress.pending
                        );
                        last_pending = Some(progress.pending);
                    }
                    tokio::time::sleep(poll).await;
                }
            }
            // the process must outlive its background runs
            dispatcher.wait_for_completion(run_id).await?
        }
    };

    print_run(&run, args.json)?;

    if run.status != RunStatus::Succeeded {
        return Err(anyhow::anyhow!("Transition run {} {}", run.id, run.status));
    }
    Ok(())
}

/// Handle resume command
pub async fn handle_resume(config: &Configuration, file: String, json: bool) -> Result<()> {
    let store = build_store(&file)?;
    let persistence = Arc::new(
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?,
    );
    let executor = TransitionExecutor::new(Arc::new(store), persistence.clone(), persistence)
        .with_sink(Arc::new(LogSink));
    let dispatcher = TransitionDispatcher::new(Arc::new(executor), config.max_concurrent_runs);

    let mut runs = Vec::new();
    for run_id in dispatcher.resume_unfinished()? {
        runs.push(dispatcher.wait_for_completion(run_id).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No interrupted runs");
    }
    for run in &runs {
        print_run(run, false)?;
        println!();
    }
    Ok(())
}

fn print_run(run: &TransitionRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!("Run:        {}", run.id);
    println!("Transition: {} ({} → {})", run.transition, run.kind, run.target);
    println!("Actor:      {}", run.actor);
    println!("Status:     {}", run.status);
    println!();
    for outcome in &run.outcomes {
        println!(
            "  {} {:?}{}",
            outcome.object,
            outcome.status,
            outcome
                .message
                .as_deref()
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        );
        for result in run.results_for(&outcome.object) {
            println!(
                "      {} {:?} ({}ms)",
                result.action, result.status, result.duration_ms
            );
        }
    }
    Ok(())
}

fn print_progress(progress: &RunProgress, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(progress)?);
        return Ok(());
    }

    println!("Run:        {}", progress.run_id);
    println!("Transition: {}", progress.transition);
    println!("Status:     {}", progress.status);
    println!(
        "Objects:    {} total, {} completed, {} failed, {} pending",
        progress.total, progress.completed, progress.failed, progress.pending
    );
    if let Some(started_at) = progress.started_at {
        println!("Started:    {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(finished_at) = progress.finished_at {
        println!("Finished:   {}", finished_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

/// Handle set-state command
pub async fn handle_set_state(config: &Configuration, object: String, state: String) -> Result<()> {
    let object = object.parse::<ObjectRef>().map_err(|e| anyhow::anyhow!(e))?;
    let persistence =
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?;
    persistence.set_object_state(&object, &state)?;
    println!("✓ {} is now '{}'", object, state);
    Ok(())
}

/// Handle status command
pub async fn handle_status(config: &Configuration, run_id: String, json: bool) -> Result<()> {
    let run_id = parse_run_id(&run_id)?;
    let persistence =
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?;
    let progress = RunAwaiter::new(Arc::new(persistence)).get_status(run_id)?;
    print_progress(&progress, json)
}

/// Handle wait command
pub async fn handle_wait(
    config: &Configuration,
    run_id: String,
    timeout_seconds: u64,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(&run_id)?;
    let persistence =
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?;
    let awaiter = RunAwaiter::reloading(Arc::new(persistence));

    let progress = awaiter
        .wait_for(
            run_id,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(timeout_seconds),
        )
        .await?;
    print_progress(&progress, json)?;

    if !progress.is_finished() {
        return Err(anyhow::anyhow!(
            "Run {} still {} after {} seconds",
            run_id,
            progress.status,
            timeout_seconds
        ));
    }
    Ok(())
}

/// Handle history command
pub async fn handle_history(config: &Configuration, object: Option<String>, json: bool) -> Result<()> {
    let object = object
        .map(|o| o.parse::<ObjectRef>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;
    let persistence =
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?;
    let history = persistence.history(object.as_ref());

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No transition history found.");
        return Ok(());
    }

    println!("Transition History");
    println!("==================");
    println!();
    for entry in &history {
        println!(
            "  {} {} {}: {} → {} by {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.object,
            entry.transition,
            entry.source.as_deref().unwrap_or("?"),
            entry.target,
            entry.actor
        );
        if !entry.actions.is_empty() {
            println!("      actions: {}", entry.actions.join(", "));
        }
        if !entry.params.is_empty() {
            println!("      params:  {}", Value::Object(entry.params.clone()));
        }
    }
    Ok(())
}

/// Handle metrics command
pub async fn handle_metrics(config: &Configuration, transition: Option<String>, json: bool) -> Result<()> {
    let persistence =
        RunPersistence::new(&config.store_path).context("Failed to open transition store")?;
    let metrics = persistence.query_metrics(transition.as_deref());

    if json {
        let mut json_output = serde_json::to_value(&metrics)?;
        if let Value::Object(fields) = &mut json_output {
            fields.insert("success_rate".to_string(), serde_json::json!(metrics.success_rate()));
            fields.insert("failure_rate".to_string(), serde_json::json!(metrics.failure_rate()));
        }
        println!("{}", serde_json::to_string_pretty(&json_output)?);
        return Ok(());
    }

    println!("Transition Metrics");
    println!("==================");
    if let Some(transition) = &transition {
        println!("Transition: {}", transition);
    }
    println!();
    println!("Runs:             {}", metrics.run_count);
    println!("  Succeeded:      {}", metrics.succeeded_count);
    println!("  Partially failed: {}", metrics.partially_failed_count);
    println!("  Failed:         {}", metrics.failed_count);
    println!("  In flight:      {}", metrics.in_flight_count);
    println!();
    println!("Success rate:     {:.1}%", metrics.success_rate());
    println!("Failure rate:     {:.1}%", metrics.failure_rate());
    println!("Avg duration:     {}ms", metrics.avg_duration_ms);

    if metrics.run_count > 0 {
        println!();
        if metrics.failure_rate() > 10.0 {
            println!("  ⚠️  High failure rate detected");
        } else {
            println!("  ✓  Failure rate within acceptable range");
        }
    }
    Ok(())
}

/// Handle config --init command
pub async fn handle_config_init(path: Option<&str>) -> Result<()> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => Configuration::default_config_path()?,
    };
    if path.exists() {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }

    Configuration::default()
        .save_to_file(&path)
        .with_context(|| format!("Failed to write configuration: {}", path.display()))?;
    println!("✓ Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_param_keeps_json_types() {
        assert_eq!(
            parse_param("run_command__timeout_seconds=30").unwrap(),
            ("run_command__timeout_seconds".to_string(), json!(30))
        );
        assert_eq!(
            parse_param("owner=alice").unwrap(),
            ("owner".to_string(), json!("alice"))
        );
        assert_eq!(
            parse_param("command=echo a=b").unwrap(),
            ("command".to_string(), json!("echo a=b"))
        );
        assert!(parse_param("no-separator").is_err());
        assert!(parse_param("=value").is_err());
    }

    #[test]
    fn test_parse_objects() {
        let objects = parse_objects(&["asset:1".to_string(), "asset:2".to_string()]).unwrap();
        assert_eq!(objects, vec![ObjectRef::new("asset", "1"), ObjectRef::new("asset", "2")]);
        assert!(parse_objects(&["asset".to_string()]).is_err());
    }

    #[test]
    fn test_build_actor() {
        let actor = build_actor("alice".to_string(), vec!["can_deploy".to_string()], false);
        assert!(actor.has_permission("can_deploy"));
        assert!(!actor.has_permission("can_scrap"));
        assert!(build_actor("root".to_string(), vec![], true).has_permission("can_scrap"));
    }

    #[test]
    fn test_load_configuration_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = load_configuration(path.to_str()).unwrap();
        assert_eq!(config.max_concurrent_runs, 4);
    }

    #[test]
    fn test_load_configuration_rejects_invalid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent_runs = 0\n").unwrap();
        assert!(load_configuration(path.to_str()).is_err());
    }

    #[tokio::test]
    async fn test_run_and_history_against_store() {
        let dir = tempdir().unwrap();
        let definitions = dir.path().join("assets.yaml");
        std::fs::write(
            &definitions,
            "transitions:\n  - name: deploy\n    kind: asset\n    sources: [new]\n    target: in_use\n    actions: [notify, assign_owner]\n",
        )
        .unwrap();
        let config = Configuration {
            store_path: dir.path().join("store.json"),
            ..Configuration::default()
        };

        handle_set_state(&config, "asset:1".to_string(), "new".to_string())
            .await
            .unwrap();
        handle_run(
            &config,
            RunArgs {
                file: definitions.to_string_lossy().to_string(),
                transition: "deploy".to_string(),
                objects: vec!["asset:1".to_string()],
                actor: Some("alice".to_string()),
                permissions: vec![],
                superuser: false,
                params: vec!["assign_owner__owner=bob".to_string()],
                wait: false,
                json: true,
            },
        )
        .await
        .unwrap();

        let persistence = RunPersistence::new(&config.store_path).unwrap();
        assert_eq!(
            persistence.object_states().get("asset:1").map(String::as_str),
            Some("in_use")
        );
        let history = persistence.history(None);
        assert_eq!(history.len(), 1);
        // notify runs after assign_owner
        assert_eq!(history[0].actions, vec!["assign_owner", "notify"]);
    }

    #[tokio::test]
    async fn test_failed_run_returns_error() {
        let dir = tempdir().unwrap();
        let definitions = dir.path().join("assets.yaml");
        std::fs::write(
            &definitions,
            "transitions:\n  - name: deploy\n    kind: asset\n    sources: [new]\n    target: in_use\n    actions: [fail]\n",
        )
        .unwrap();
        let config = Configuration {
            store_path: dir.path().join("store.json"),
            ..Configuration::default()
        };
        handle_set_state(&config, "asset:1".to_string(), "new".to_string())
            .await
            .unwrap();

        let result = handle_run(
            &config,
            RunArgs {
                file: definitions.to_string_lossy().to_string(),
                transition: "deploy".to_string(),
                objects: vec!["asset:1".to_string()],
                actor: None,
                permissions: vec![],
                superuser: false,
                params: vec![],
                wait: false,
                json: true,
            },
        )
        .await;
        assert!(result.is_err());

        let persistence = RunPersistence::new(&config.store_path).unwrap();
        assert_eq!(persistence.query_metrics(Some("deploy")).failed_count, 1);
    }

    #[tokio::test]
    async fn test_resume_finishes_interrupted_run() {
        let dir = tempdir().unwrap();
        let definitions = dir.path().join("assets.yaml");
        std::fs::write(
            &definitions,
            "transitions:\n  - name: deploy\n    kind: asset\n    sources: [new]\n    target: in_use\n    actions: [notify]\n",
        )
        .unwrap();
        let config = Configuration {
            store_path: dir.path().join("store.json"),
            ..Configuration::default()
        };
        handle_set_state(&config, "asset:1".to_string(), "new".to_string())
            .await
            .unwrap();

        // a run prepared by a process that died before driving it
        let run_id = {
            let store = build_store(&definitions.to_string_lossy()).unwrap();
            let definition = store.get("asset", "deploy").unwrap().clone();
            let persistence = Arc::new(RunPersistence::new(&config.store_path).unwrap());
            let executor = TransitionExecutor::new(Arc::new(store), persistence.clone(), persistence);
            executor
                .prepare(&definition, &[ObjectRef::new("asset", "1")], &Actor::new("alice"), Map::new())
                .unwrap()
                .id
        };

        handle_resume(&config, definitions.to_string_lossy().to_string(), true)
            .await
            .unwrap();

        let persistence = RunPersistence::new(&config.store_path).unwrap();
        assert_eq!(persistence.get_run(run_id).unwrap().status, RunStatus::Succeeded);
        assert_eq!(
            persistence.object_states().get("asset:1").map(String::as_str),
            Some("in_use")
        );
        assert!(persistence.find_unfinished_runs().is_empty());
    }
}
