use crate::core::types::{ErrorCategory, ErrorClass, ErrorSeverity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug)]
pub struct AppError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub node_id: Option<String>,
    pub context: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    pub source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new<T: Into<String>>(category: ErrorCategory, message: T) -> Self {
        let severity = match category {
            ErrorCategory::BreakpointEvaluationError => ErrorSeverity::Warning,
            ErrorCategory::Cancelled => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        };
        let class = match category {
            ErrorCategory::TimeoutError => ErrorClass::Timeout,
            _ => ErrorClass::Fatal,
        };
        AppError {
            category,
            severity,
            class,
            code: format!("ERR-{}", uuid::Uuid::new_v4()),
            message: message.into(),
            node_id: None,
            context: HashMap::new(),
            occurred_at: Utc::now(),
            source: None,
        }
    }

    pub fn with_source<T: Into<String>>(
        category: ErrorCategory,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = AppError::new(category, message);
        error.source = Some(anyhow::anyhow!(source));
        error
    }

    /// Error raised when cooperative cancellation was observed.
    pub fn cancelled() -> Self {
        AppError::new(ErrorCategory::Cancelled, "execution cancelled").with_code("GRF-CANCEL-001")
    }

    pub fn with_context<T: Into<String>>(mut self, context: T) -> Self {
        self.context.insert("context".to_string(), context.into());
        self
    }

    pub fn with_code<T: Into<String>>(mut self, code: T) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = class;
        self
    }

    /// Attach the node id unless one was already recorded closer to the failure.
    pub fn with_node<T: Into<String>>(mut self, node_id: T) -> Self {
        if self.node_id.is_none() {
            self.node_id = Some(node_id.into());
        }
        self
    }

    pub fn add_context(&mut self, key: &str, value: &str) {
        self.context.insert(key.to_string(), value.to_string());
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }

    /// Whether an error handler may act on this failure at all.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.category,
            ErrorCategory::LoopLimitExceeded
                | ErrorCategory::StepLimitExceeded
                | ErrorCategory::Cancelled
        ) && self.class != ErrorClass::Fatal
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary::from(self)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.category, self.message)?;
        if let Some(node_id) = &self.node_id {
            write!(f, " (node: {})", node_id)?;
        }
        if !self.context.is_empty() {
            write!(f, " (Context: {:?})", self.context)?;
        }
        if let Some(ref source) = self.source {
            write!(f, "\nCaused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        let mut error = AppError::new(ErrorCategory::InternalError, e.to_string())
            .with_code("ANYHOW_ERROR");
        error.source = Some(e);
        error
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        let mut error = AppError::new(ErrorCategory::IoError, e.to_string()).with_code("IO_ERROR");
        error.source = Some(anyhow::anyhow!(e));
        error
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        let mut error = AppError::new(ErrorCategory::SerializationError, e.to_string())
            .with_code("GRF-SER-001");
        error.source = Some(anyhow::anyhow!(e));
        error
    }
}

/// Cloneable projection of an [`AppError`] carried by events, outcomes and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: String,
    pub category: ErrorCategory,
    pub class: ErrorClass,
    pub message: String,
    pub node_id: Option<String>,
}

impl From<&AppError> for ErrorSummary {
    fn from(error: &AppError) -> Self {
        ErrorSummary {
            code: error.code.clone(),
            category: error.category,
            class: error.class,
            message: error.message.clone(),
            node_id: error.node_id.clone(),
        }
    }
}

impl ErrorSummary {
    /// Rebuild an error from its summary, e.g. when a nested run fails.
    pub fn to_error(&self) -> AppError {
        let mut error = AppError::new(self.category, self.message.clone())
            .with_code(self.code.clone())
            .with_class(self.class);
        error.node_id = self.node_id.clone();
        error
    }

    /// Replace the message when it mentions any of the redaction patterns.
    pub fn redacted(mut self, redact_keys: &[String]) -> Self {
        let lowered = self.message.to_lowercase();
        if redact_keys
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
        {
            self.message = "[REDACTED]".to_string();
        }
        self
    }
}

impl std::fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.category, self.message)
    }
}
