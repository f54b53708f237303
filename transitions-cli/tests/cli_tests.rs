use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const DEFINITIONS: &str = r#"
kinds:
  - name: back_office_asset
    states: [new, in_use, damaged, retired]
transitions:
  - name: deploy
    kind: back_office_asset
    sources: [new]
    target: in_use
    actions: [assign_owner, notify]
    permission: can_run_deploy_transition
  - name: scrap
    kind: back_office_asset
    sources: ["*"]
    target: retired
    actions: [fail]
"#;

struct Workspace {
    _dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let definitions = dir.path().join("definitions");
        std::fs::create_dir_all(&definitions).unwrap();
        std::fs::write(definitions.join("assets.yaml"), DEFINITIONS).unwrap();

        let config = dir.path().join("config.toml");
        std::fs::write(
            &config,
            format!(
                "log_level = \"error\"\nstore_path = {:?}\ndefinitions_dir = {:?}\n",
                dir.path().join("store.json"),
                definitions
            ),
        )
        .unwrap();
        Self { _dir: dir, config }
    }

    fn run(&self, args: &[&str]) -> Result<String, String> {
        run_transitions(&self.config, args)
    }
}

pub fn run_transitions(config: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new(env!("CARGO_BIN_EXE_transitions"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .map_err(|e| format!("Failed to run transitions: {}", e))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("Command failed: {}{}", stdout, stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_transitions"))
        .arg("--help")
        .output()
        .unwrap();
    let help = String::from_utf8_lossy(&output.stdout);
    for command in ["validate", "list", "run", "set-state", "status", "wait", "history", "metrics", "resume"] {
        assert!(help.contains(command), "missing {} in help", command);
    }
}

#[test]
fn test_validate_definitions_dir() {
    let workspace = Workspace::new();
    let output = workspace.run(&["validate", "--json"]).unwrap();
    let json: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(json["valid"], Value::Bool(true));
    assert_eq!(json["transitions"], 2);
}

#[test]
fn test_list_filters_by_actor_permissions() {
    let workspace = Workspace::new();
    let list = |extra: &[&str]| -> Vec<String> {
        let mut args = vec!["list", "--kind", "back_office_asset", "--state", "new", "--json"];
        args.extend_from_slice(extra);
        let json: Value = serde_json::from_str(&workspace.run(&args).unwrap()).unwrap();
        json.as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect()
    };

    assert_eq!(list(&[]), vec!["deploy", "scrap"]);
    assert_eq!(list(&["--actor", "guest"]), vec!["scrap"]);
    assert_eq!(
        list(&["--actor", "alice", "--permission", "can_run_deploy_transition"]),
        vec!["deploy", "scrap"]
    );
}

#[test]
fn test_run_then_history_and_metrics() {
    let workspace = Workspace::new();
    workspace
        .run(&["set-state", "back_office_asset:1", "new"])
        .unwrap();

    let denied = workspace.run(&[
        "run",
        "deploy",
        "--object",
        "back_office_asset:1",
        "--actor",
        "guest",
        "--param",
        "assign_owner__owner=bob",
    ]);
    assert!(denied.is_err());

    let output = workspace
        .run(&[
            "run",
            "deploy",
            "--object",
            "back_office_asset:1",
            "--actor",
            "alice",
            "--permission",
            "can_run_deploy_transition",
            "--param",
            "assign_owner__owner=bob",
            "--json",
        ])
        .unwrap();
    let run: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(run["status"], "succeeded");
    let run_id = run["id"].as_str().unwrap().to_string();

    let status: Value =
        serde_json::from_str(&workspace.run(&["status", &run_id, "--json"]).unwrap()).unwrap();
    assert_eq!(status["completed"], 1);
    assert_eq!(status["pending"], 0);

    let history: Value = serde_json::from_str(
        &workspace
            .run(&["history", "--object", "back_office_asset:1", "--json"])
            .unwrap(),
    )
    .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["target"], "in_use");
    assert_eq!(history[0]["params"]["assign_owner__owner"], "bob");

    // failed scrap leaves the object in use
    assert!(workspace
        .run(&["run", "scrap", "--object", "back_office_asset:1", "--param", "fail__reason=broken"])
        .is_err());

    let metrics: Value =
        serde_json::from_str(&workspace.run(&["metrics", "--json"]).unwrap()).unwrap();
    assert_eq!(metrics["run_count"], 2);
    assert_eq!(metrics["succeeded_count"], 1);
    assert_eq!(metrics["failed_count"], 1);
}

#[test]
fn test_status_of_unknown_run_fails() {
    let workspace = Workspace::new();
    assert!(workspace
        .run(&["status", "00000000-0000-0000-0000-000000000000"])
        .is_err());
}

#[test]
fn test_resume_with_nothing_interrupted() {
    let workspace = Workspace::new();
    let output = workspace.run(&["resume", "--json"]).unwrap();
    let json: Value = serde_json::from_str(&output).unwrap();
    assert!(json.as_array().unwrap().is_empty());
}
