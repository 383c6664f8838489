#![allow(clippy::result_large_err)]

use super::{ConfigValidator, EngineConfig};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name looked up in a project directory.
pub const CONFIG_FILE_NAME: &str = "graphflow.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from a project directory (dir/graphflow.toml)
    /// Environment variables override config file values
    pub fn load_from_dir(dir: &Path) -> Result<EngineConfig, AppError> {
        Self::load(Some(&dir.join(CONFIG_FILE_NAME)))
    }

    /// Defaults, then the file when given and present, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<EngineConfig, AppError> {
        let config_file = match path {
            Some(path) => Self::load_from_file(path)?,
            None => None,
        };

        let mut config = config_file.unwrap_or_default();

        // Apply environment variable overrides
        Self::apply_env_overrides(&mut config)?;

        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Load config from specific file path
    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<EngineConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
            .with_code("GRF-CONFIG-003")
        })?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("GRF-CONFIG-004")
        })?;

        Ok(Some(config))
    }

    /// Apply environment variable overrides to the configuration
    /// Environment variables take precedence over config file values
    fn apply_env_overrides(config: &mut EngineConfig) -> Result<(), AppError> {
        // Execution overrides
        if let Some(max_total_steps) = parse_env::<u64>("GRAPHFLOW_MAX_TOTAL_STEPS")? {
            config.execution.max_total_steps = Some(max_total_steps);
        }

        if let Ok(max_time) = env::var("GRAPHFLOW_MAX_TIME") {
            config.execution.max_time = Some(max_time);
        }

        if let Some(max_concurrent_runs) = parse_env::<usize>("GRAPHFLOW_MAX_CONCURRENT_RUNS")? {
            config.execution.max_concurrent_runs = max_concurrent_runs;
        }

        if let Ok(window) = env::var("GRAPHFLOW_IDEMPOTENCY_WINDOW") {
            config.execution.idempotency_window = window;
        }

        // Event overrides
        if let Some(capacity) = parse_env::<usize>("GRAPHFLOW_EVENTS_CAPACITY")? {
            config.events.capacity = capacity;
        }

        if let Ok(overflow) = env::var("GRAPHFLOW_EVENTS_OVERFLOW") {
            config.events.overflow = overflow.parse().map_err(|err: String| {
                AppError::new(ErrorCategory::ValidationError, err).with_code("GRF-CONFIG-005")
            })?;
        }

        // Checkpoint overrides
        if let Some(enabled) = parse_env::<bool>("GRAPHFLOW_CHECKPOINT_ENABLED")? {
            config.checkpoint.enabled = enabled;
        }

        if let Ok(directory) = env::var("GRAPHFLOW_CHECKPOINT_DIR") {
            config.checkpoint.directory = Some(PathBuf::from(directory));
            config.checkpoint.enabled = true;
        }

        Ok(())
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "GRAPHFLOW_MAX_TOTAL_STEPS - Override the global step cap (default: 10000)",
            "GRAPHFLOW_MAX_TIME - Override the run deadline, e.g. 5m",
            "GRAPHFLOW_MAX_CONCURRENT_RUNS - Override concurrent run limit (default: 16)",
            "GRAPHFLOW_IDEMPOTENCY_WINDOW - Override idempotency window (default: 10m)",
            "GRAPHFLOW_EVENTS_CAPACITY - Override per-subscriber event buffer (default: 1024)",
            "GRAPHFLOW_EVENTS_OVERFLOW - Override overflow policy (drop_oldest/block)",
            "GRAPHFLOW_CHECKPOINT_ENABLED - Enable or disable checkpoints (true/false)",
            "GRAPHFLOW_CHECKPOINT_DIR - Store checkpoints under this directory (enables checkpoints)",
            "GRAPHFLOW_LOG_DIR - Override the log directory",
        ]
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("{} has an invalid value '{}'", name, raw),
            )
            .with_code("GRF-CONFIG-005")
        }),
        Err(_) => Ok(None),
    }
}
