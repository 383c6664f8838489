#![allow(clippy::result_large_err)]

use super::EngineConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration rules
    pub fn validate(config: &EngineConfig) -> Result<(), AppError> {
        if config.execution.max_concurrent_runs == 0 {
            return Err(invalid("execution.max_concurrent_runs must be at least 1"));
        }

        if config.execution.max_total_steps == Some(0) {
            return Err(invalid("execution.max_total_steps must be at least 1"));
        }

        if config.events.capacity == 0 {
            return Err(invalid("events.capacity must be at least 1"));
        }

        if config.checkpoint.every_n_steps == Some(0) {
            return Err(invalid("checkpoint.every_n_steps must be at least 1"));
        }

        // Durations are kept as text in the file; surface parse errors at load time.
        config.run_limits()?;
        config.idempotency_window()?;
        config.retention_policy()?;

        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("GRF-CONFIG-001")
}
