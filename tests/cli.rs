use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

fn relay(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.current_dir(root).env_remove("RELAY_LOG").env_remove("RUST_LOG");
    cmd
}

fn init(root: &Path, workers: &str) {
    relay(root)
        .args(["init", "--no-interactive", "--name", "demo", "--workers", workers])
        .assert()
        .success()
        .stdout(predicate::str::contains("Generated .relay.toml"));
}

fn json(cmd: &mut Command) -> Value {
    let output = cmd.args(["--format", "json"]).output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path(), "junior=2.0");
    assert!(dir.path().join(".relay").is_dir());

    relay(dir.path())
        .args(["init", "--no-interactive", "--name", "demo"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--force"));

    relay(dir.path())
        .args(["init", "--no-interactive", "--name", "demo", "--force"])
        .assert()
        .success();
    let config = std::fs::read_to_string(dir.path().join(".relay.toml")).unwrap();
    assert!(config.contains("[workers.generalist]"));
}

#[test]
fn commands_outside_a_project_fail_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    relay(dir.path()).args(["status"]).assert().code(2);
}

#[test]
fn task_flows_from_submission_to_validated_completion() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    init(root, "junior=2.0");

    let task = json(relay(root).args([
        "submit",
        "fix login redirect",
        "--id",
        "tk-login",
        "-r",
        "2",
        "-v",
        "1",
        "--criterion",
        "functional:user lands on the dashboard",
    ]));
    assert_eq!(task["id"], "tk-login");
    assert_eq!(task["score"]["band"], 1);

    let plan = json(relay(root).args(["plan", "tk-login"]));
    assert_eq!(plan["decision"], "direct_assign");
    assert_eq!(plan["worker_type"], "junior");

    let assigned = json(relay(root).args(["assign", "tk-login", "--worker", "w1"]));
    assert_eq!(assigned["outcome"], "assigned");
    let attempt = assigned["handle"]["attempt_id"].as_str().unwrap().to_string();
    let brief = assigned["brief"].as_str().unwrap();
    assert!(std::fs::read_to_string(brief).unwrap().contains("user lands on the dashboard"));

    relay(root)
        .args(["assign", "tk-login", "--worker", "w2"])
        .assert()
        .code(7);

    relay(root).args(["start", "tk-login", attempt.as_str()]).assert().success();

    let evidence = root.join("evidence.json");
    std::fs::write(
        &evidence,
        r#"{"functional": [{"uri": "tests/login.rs:42", "covers": ["c1"], "reproduction": ["cargo test login"]}]}"#,
    )
    .unwrap();
    let reported = json(relay(root).args([
        "report",
        "tk-login",
        attempt.as_str(),
        "--outcome",
        "success",
        "--evidence",
        evidence.to_str().unwrap(),
    ]));
    assert_eq!(reported["status"], "in_progress");

    relay(root)
        .args(["validate", "tk-login", attempt.as_str(), "--validator", "w1"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("w1"));

    let verdict = json(relay(root).args([
        "validate",
        "tk-login",
        attempt.as_str(),
        "--validator",
        "reviewer",
    ]));
    assert_eq!(verdict["status"], "completed");

    let tasks = json(relay(root).args(["status"]));
    assert_eq!(tasks.as_array().unwrap().len(), 1);
    assert_eq!(tasks[0]["status"], "completed");

    relay(root)
        .args(["status", "tk-login", "--log", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task  id=tk-login  status=completed"))
        .stdout(predicate::str::contains("entry  seq="));
}

#[test]
fn oversized_task_exits_escalated() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    init(root, "junior=2.0");

    relay(root)
        .args([
            "submit", "rewrite billing", "--id", "tk-big", "-r", "8", "-d", "4", "-c", "3", "-v",
            "2",
        ])
        .assert()
        .success();
    relay(root)
        .args(["plan", "tk-big", "--format", "text"])
        .assert()
        .code(6)
        .stdout(predicate::str::contains("decision=escalate"))
        .stderr(predicate::str::contains("needs operator decision"));

    relay(root)
        .args(["assign", "tk-big", "--worker", "w1"])
        .assert()
        .code(7);
}

#[test]
fn unknown_task_exits_eight() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path(), "junior=2.0");
    relay(dir.path())
        .args(["status", "tk-missing"])
        .assert()
        .code(8)
        .stderr(predicate::str::contains("tk-missing"));
}

#[test]
fn cancel_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    init(root, "junior=2.0");
    relay(root)
        .args(["submit", "tidy docs", "--id", "tk-docs", "-r", "1"])
        .assert()
        .success();
    let cancelled = json(relay(root).args(["cancel", "tk-docs", "--reason", "superseded"]));
    assert_eq!(cancelled["status"], "failed");
    relay(root)
        .args(["assign", "tk-docs", "--worker", "w1"])
        .assert()
        .code(7);
}

#[test]
fn schema_describes_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = relay(dir.path()).arg("schema").output().unwrap();
    assert!(output.status.success());
    let schema: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(schema["title"], "Config");
    assert!(schema["properties"]["workers"].is_object());
    assert!(schema["description"].as_str().unwrap().contains(".relay.toml"));
}

#[test]
fn worker_modifiers_are_kept_in_config_and_lapse_after_their_uses() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    init(root, "junior=2.0,senior=4.0");

    relay(root)
        .args(["worker", "modifier", "add", "junior", "warmup", "--delta", "-0.5", "--uses", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 uses left"));
    let config = std::fs::read_to_string(root.join(".relay.toml")).unwrap();
    assert!(config.contains("[[workers.junior.modifiers]]"), "{config}");

    let workers = json(relay(root).args(["worker", "list"]));
    let junior = workers
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["worker_type"] == "junior")
        .unwrap();
    assert!((junior["capacity"]["adjusted"].as_f64().unwrap() - 1.5).abs() < 1e-9);
    assert_eq!(junior["default"], true);

    for id in ["tk-a", "tk-b"] {
        relay(root)
            .args(["submit", "small fix", "--id", id, "-r", "1"])
            .assert()
            .success();
    }
    let first = json(relay(root).args(["plan", "tk-a", "--worker-type", "junior"]));
    assert_eq!(first["capacity"]["applied"][0]["name"], "warmup");
    let second = json(relay(root).args(["plan", "tk-b", "--worker-type", "junior"]));
    assert_eq!(second["capacity"]["applied"].as_array().unwrap().len(), 0);
    let config = std::fs::read_to_string(root.join(".relay.toml")).unwrap();
    assert!(!config.contains("warmup"), "{config}");
}

#[test]
fn worker_deactivation_persists() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    init(root, "junior=2.0,senior=4.0");

    relay(root)
        .args(["worker", "deactivate", "senior"])
        .assert()
        .success();
    relay(root)
        .args(["worker", "list", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("type=senior  baseline=4.00  capacity=4.00  active=false"));

    relay(root).args(["worker", "deactivate", "ghost"]).assert().code(8);
    relay(root)
        .args(["worker", "deactivate", "junior"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("default_worker"));
}
