#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::checkpoint::RetentionPolicy;
use crate::core::workflow_graph::events::{EventStreamConfig, OverflowPolicy};
use crate::core::workflow_graph::executor::{CheckpointPolicy, RunLimits};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from graphflow.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    /// Run limits and concurrency
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Event stream buffering
    #[serde(default)]
    pub events: EventsConfig,

    /// Checkpoint policy and retention
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Global step cap across a run
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: Option<u64>,

    /// Wall-clock deadline for a run, e.g. "5m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<String>,

    /// Runs executing at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// How long an idempotency key returns the original result
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window: String,
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Events kept for late readers
    #[serde(default = "default_event_retention")]
    pub retention: usize,

    /// Key fragments whose values are redacted from events
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Save before the node following every successful step
    #[serde(default)]
    pub on_node_complete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_n_steps: Option<u64>,

    /// Explicit save points
    #[serde(default)]
    pub at_nodes: Vec<String>,

    /// Save at the failing node when a run fails
    #[serde(default)]
    pub on_failure: bool,

    /// Root directory for the file backend; in-memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Checkpoint retention thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetentionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,

    /// e.g. "7d"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<u64>,
}

// Default functions
fn default_max_total_steps() -> Option<u64> {
    Some(10_000)
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_idempotency_window() -> String {
    "10m".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_event_retention() -> usize {
    10_000
}

fn default_redact_keys() -> Vec<String> {
    vec!["token".into(), "password".into(), "secret".into()]
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            max_total_steps: default_max_total_steps(),
            max_time: None,
            max_concurrent_runs: default_max_concurrent_runs(),
            idempotency_window: default_idempotency_window(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            capacity: default_event_capacity(),
            overflow: OverflowPolicy::default(),
            retention: default_event_retention(),
            redact_keys: default_redact_keys(),
        }
    }
}

/// Parse a humantime duration such as "250ms" or "10m".
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, AppError> {
    humantime::parse_duration(value.trim()).map_err(|err| {
        AppError::new(
            ErrorCategory::ValidationError,
            format!("{} must be a duration like '30s' or '5m': {}", field, err),
        )
        .with_code("GRF-CONFIG-002")
    })
}

impl EngineConfig {
    pub fn run_limits(&self) -> Result<RunLimits, AppError> {
        Ok(RunLimits {
            max_total_steps: self.execution.max_total_steps,
            max_time: self
                .execution
                .max_time
                .as_deref()
                .map(|value| parse_duration("execution.max_time", value))
                .transpose()?,
        })
    }

    pub fn idempotency_window(&self) -> Result<Duration, AppError> {
        parse_duration(
            "execution.idempotency_window",
            &self.execution.idempotency_window,
        )
    }

    pub fn event_stream_config(&self) -> EventStreamConfig {
        EventStreamConfig {
            capacity: self.events.capacity,
            overflow: self.events.overflow,
            retention: self.events.retention,
            redact_keys: self.events.redact_keys.clone(),
        }
    }

    /// Scheduler save points; empty when checkpoints are disabled.
    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        if !self.checkpoint.enabled {
            return CheckpointPolicy::default();
        }
        CheckpointPolicy {
            on_node_complete: self.checkpoint.on_node_complete,
            every_n_steps: self.checkpoint.every_n_steps,
            at_nodes: self.checkpoint.at_nodes.iter().cloned().collect(),
            on_failure: self.checkpoint.on_failure,
        }
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy, AppError> {
        let retention = &self.checkpoint.retention;
        Ok(RetentionPolicy {
            max_count: retention.max_count,
            max_age: retention
                .max_age
                .as_deref()
                .map(|value| parse_duration("checkpoint.retention.max_age", value))
                .transpose()?,
            max_total_bytes: retention.max_total_bytes,
        })
    }
}


pub mod loader;
pub mod validation;

pub use loader::{ConfigLoader, CONFIG_FILE_NAME};
pub use validation::ConfigValidator;
