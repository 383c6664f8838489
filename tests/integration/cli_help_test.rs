use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const GRAPH: &str = r#"
version: "1"
graph:
  name: review
  variables:
    score: 90
  nodes:
    - id: gate
      type: conditional
      condition: { $expr: "score > 80" }
    - id: approve
      type: function
      callable: set
      params:
        decision: approved
      outputs:
        decision: decision
    - id: reject
      type: function
      callable: set
      params:
        decision: rejected
      outputs:
        decision: decision
  edges:
    - { from: gate, to: approve, kind: on_true }
    - { from: gate, to: reject, kind: on_false }
"#;

fn graphflow(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("graphflow"));
    cmd.current_dir(dir)
        .env("GRAPHFLOW_LOG_DIR", dir.join("logs"))
        .env_remove("GRAPHFLOW_CHECKPOINT_DIR");
    cmd
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("review.yaml"), GRAPH).unwrap();
    dir
}

#[test]
fn test_help_lists_graph_commands() {
    let dir = TempDir::new().unwrap();
    graphflow(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("GRAPH COMMANDS"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("checkpoints"));
}

#[test]
fn test_run_help_includes_example() {
    let dir = TempDir::new().unwrap();
    graphflow(dir.path())
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("graphflow run review.yaml"))
        .stdout(predicate::str::contains("--checkpoint-dir"));
}

#[test]
fn test_validate_reports_valid_graph() {
    let dir = workspace();
    graphflow(dir.path())
        .args(["validate", "review.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Graph 'review' is valid"))
        .stdout(predicate::str::contains("3 nodes"));
}

#[test]
fn test_validate_rejects_unknown_callable() {
    let dir = workspace();
    let broken = GRAPH.replace("callable: set\n      params:\n        decision: rejected", "callable: publish\n      params:\n        decision: rejected");
    std::fs::write(dir.path().join("broken.yaml"), broken).unwrap();
    graphflow(dir.path())
        .args(["validate", "broken.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("publish"));
}

#[test]
fn test_render_mermaid() {
    let dir = workspace();
    graphflow(dir.path())
        .args(["render", "review.yaml", "--format", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flowchart TD"));
}

#[test]
fn test_run_follows_variables() {
    let dir = workspace();
    graphflow(dir.path())
        .args(["run", "review.yaml", "--var", "score=40"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: completed at 'reject'"))
        .stdout(predicate::str::contains("\"rejected\""));
}

#[test]
fn test_run_with_checkpoints_then_list() {
    let dir = workspace();
    graphflow(dir.path())
        .args([
            "run",
            "review.yaml",
            "--execution-id",
            "cli-run",
            "--checkpoint-dir",
            "ckpt",
        ])
        .assert()
        .success();
    graphflow(dir.path())
        .args(["checkpoints", "list", "--dir", "ckpt"])
        .assert()
        .success();
}
