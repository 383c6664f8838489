use serde::{Deserialize, Serialize};

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    ValidationError,
    NodeExecutionError,
    LoopLimitExceeded,
    StepLimitExceeded,
    EdgeResolutionAmbiguous,
    MergeConflict,
    Cancelled,
    BreakpointEvaluationError,
    TypeMismatch,
    IndexOutOfRange,
    TimeoutError,
    NotFound,
    SerializationError,
    IoError,
    InternalError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error severity enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Error,
    Warning,
    Info,
}

/// Recoverability classification attached to node failures.
///
/// Error-handler nodes decide between retry, fallback and abort based on
/// this value. `Fatal` failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    External,
    Timeout,
    #[default]
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::External => "external",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "transient" => Ok(ErrorClass::Transient),
            "external" => Ok(ErrorClass::External),
            "timeout" => Ok(ErrorClass::Timeout),
            "fatal" => Ok(ErrorClass::Fatal),
            other => Err(format!(
                "unknown error class '{}'; expected transient, external, timeout or fatal",
                other
            )),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
