use graphflow::core::config::{ConfigLoader, EngineConfig};
use graphflow::core::workflow_graph::events::OverflowPolicy;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn clear_graphflow_env() {
    for v in &[
        "GRAPHFLOW_MAX_TOTAL_STEPS",
        "GRAPHFLOW_MAX_TIME",
        "GRAPHFLOW_MAX_CONCURRENT_RUNS",
        "GRAPHFLOW_IDEMPOTENCY_WINDOW",
        "GRAPHFLOW_EVENTS_CAPACITY",
        "GRAPHFLOW_EVENTS_OVERFLOW",
        "GRAPHFLOW_CHECKPOINT_ENABLED",
        "GRAPHFLOW_CHECKPOINT_DIR",
    ] {
        env::remove_var(v);
    }
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    clear_graphflow_env();
    let temp_dir = TempDir::new().unwrap();

    let config = ConfigLoader::load_from_dir(temp_dir.path()).unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
#[serial]
fn test_file_values_are_loaded() {
    clear_graphflow_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("graphflow.toml"),
        r#"
[execution]
max_total_steps = 250
max_time = "90s"

[events]
overflow = "block"

[checkpoint]
enabled = true
on_failure = true
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_dir(temp_dir.path()).unwrap();
    let limits = config.run_limits().unwrap();
    assert_eq!(limits.max_total_steps, Some(250));
    assert_eq!(limits.max_time, Some(Duration::from_secs(90)));
    assert_eq!(config.events.overflow, OverflowPolicy::Block);
    assert!(config.checkpoint_policy().on_failure);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_graphflow_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("graphflow.toml"),
        "[execution]\nmax_total_steps = 250\nmax_concurrent_runs = 2\n",
    )
    .unwrap();

    env::set_var("GRAPHFLOW_MAX_TOTAL_STEPS", "40");
    env::set_var("GRAPHFLOW_CHECKPOINT_DIR", "/tmp/graphflow-checkpoints");
    let config = ConfigLoader::load_from_dir(temp_dir.path());
    clear_graphflow_env();

    let config = config.unwrap();
    assert_eq!(config.execution.max_total_steps, Some(40));
    assert_eq!(config.execution.max_concurrent_runs, 2);
    assert!(config.checkpoint.enabled);
    assert_eq!(
        config.checkpoint.directory,
        Some(PathBuf::from("/tmp/graphflow-checkpoints"))
    );
}

#[test]
#[serial]
fn test_invalid_env_value_is_rejected() {
    clear_graphflow_env();
    env::set_var("GRAPHFLOW_EVENTS_CAPACITY", "lots");
    let result = ConfigLoader::load(None);
    clear_graphflow_env();

    assert_eq!(result.unwrap_err().code, "GRF-CONFIG-005");
}

#[test]
#[serial]
fn test_malformed_file_is_rejected() {
    clear_graphflow_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("graphflow.toml"), "[execution\nmax = ").unwrap();

    let err = ConfigLoader::load_from_dir(temp_dir.path()).unwrap_err();
    assert_eq!(err.code, "GRF-CONFIG-004");
}

#[test]
#[serial]
fn test_validation_runs_after_overrides() {
    clear_graphflow_env();
    env::set_var("GRAPHFLOW_MAX_CONCURRENT_RUNS", "0");
    let result = ConfigLoader::load(None);
    clear_graphflow_env();

    assert_eq!(result.unwrap_err().code, "GRF-CONFIG-001");
}

#[test]
fn test_env_documentation_lists_overrides() {
    let docs = ConfigLoader::env_var_documentation();
    assert!(docs.iter().any(|line| line.starts_with("GRAPHFLOW_MAX_TOTAL_STEPS")));
    assert!(docs.iter().any(|line| line.starts_with("GRAPHFLOW_CHECKPOINT_DIR")));
}
