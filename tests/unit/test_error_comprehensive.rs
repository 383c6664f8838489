use graphflow::core::error::{AppError, ErrorSummary};
use graphflow::core::types::{ErrorCategory, ErrorClass, ErrorSeverity};

#[test]
fn test_error_creation_all_categories() {
    let categories = vec![
        ErrorCategory::ValidationError,
        ErrorCategory::NodeExecutionError,
        ErrorCategory::LoopLimitExceeded,
        ErrorCategory::StepLimitExceeded,
        ErrorCategory::EdgeResolutionAmbiguous,
        ErrorCategory::MergeConflict,
        ErrorCategory::Cancelled,
        ErrorCategory::BreakpointEvaluationError,
        ErrorCategory::TypeMismatch,
        ErrorCategory::IndexOutOfRange,
        ErrorCategory::TimeoutError,
        ErrorCategory::NotFound,
        ErrorCategory::SerializationError,
        ErrorCategory::IoError,
        ErrorCategory::InternalError,
    ];

    for category in categories {
        let error = AppError::new(category, "test message");
        assert_eq!(error.category, category);
        assert_eq!(error.message, "test message");
        assert!(error.context.is_empty());
        assert!(error.node_id.is_none());
        assert!(error.occurred_at <= chrono::Utc::now());
        assert!(error.code.starts_with("ERR-"));
    }
}

#[test]
fn test_error_severity_mapping() {
    let test_cases = vec![
        (ErrorCategory::ValidationError, ErrorSeverity::Error),
        (ErrorCategory::NodeExecutionError, ErrorSeverity::Error),
        (ErrorCategory::LoopLimitExceeded, ErrorSeverity::Error),
        (ErrorCategory::Cancelled, ErrorSeverity::Info),
        (ErrorCategory::BreakpointEvaluationError, ErrorSeverity::Warning),
    ];

    for (category, expected_severity) in test_cases {
        let error = AppError::new(category, "test");
        assert_eq!(error.severity(), expected_severity);
    }
}

#[test]
fn test_timeouts_default_to_timeout_class() {
    assert_eq!(
        AppError::new(ErrorCategory::TimeoutError, "slow").class,
        ErrorClass::Timeout
    );
    assert_eq!(
        AppError::new(ErrorCategory::NodeExecutionError, "boom").class,
        ErrorClass::Fatal
    );
}

#[test]
fn test_recoverability_by_category_and_class() {
    let transient = AppError::new(ErrorCategory::NodeExecutionError, "flaky")
        .with_class(ErrorClass::Transient);
    assert!(transient.is_recoverable());

    let loop_limit = AppError::new(ErrorCategory::LoopLimitExceeded, "too many")
        .with_class(ErrorClass::Transient);
    assert!(!loop_limit.is_recoverable());

    assert!(!AppError::cancelled().is_recoverable());
    assert!(AppError::cancelled().is_cancelled());
}

#[test]
fn test_display_includes_code_and_node() {
    let error = AppError::new(ErrorCategory::NodeExecutionError, "callable failed")
        .with_code("GRF-CALL-011")
        .with_node("fetch");
    let text = error.to_string();
    assert!(text.contains("GRF-CALL-011"));
    assert!(text.contains("NodeExecutionError"));
    assert!(text.contains("node: fetch"));
}

#[test]
fn test_with_node_keeps_first_id() {
    let error = AppError::new(ErrorCategory::NodeExecutionError, "inner")
        .with_node("leaf")
        .with_node("subgraph");
    assert_eq!(error.node_id.as_deref(), Some("leaf"));
}

#[test]
fn test_summary_rebuilds_error() {
    let error = AppError::new(ErrorCategory::NodeExecutionError, "upstream 503")
        .with_code("GRF-CALL-011")
        .with_class(ErrorClass::External)
        .with_node("fetch");
    let summary: ErrorSummary = error.summary();
    let rebuilt = summary.to_error();
    assert_eq!(rebuilt.code, "GRF-CALL-011");
    assert_eq!(rebuilt.class, ErrorClass::External);
    assert_eq!(rebuilt.node_id.as_deref(), Some("fetch"));
    assert_eq!(rebuilt.summary(), summary);
}

#[test]
fn test_summary_redaction() {
    let summary = AppError::new(ErrorCategory::NodeExecutionError, "bad token abc123").summary();
    let redacted = summary.redacted(&["token".to_string()]);
    assert_eq!(redacted.message, "[REDACTED]");

    let plain = AppError::new(ErrorCategory::NodeExecutionError, "connection reset").summary();
    assert_eq!(
        plain.clone().redacted(&["token".to_string()]).message,
        plain.message
    );
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
    let error: AppError = io.into();
    assert_eq!(error.category, ErrorCategory::IoError);
    assert!(error.message.contains("missing.yaml"));
}

#[test]
fn test_error_class_parsing() {
    assert_eq!("Transient".parse::<ErrorClass>().unwrap(), ErrorClass::Transient);
    assert_eq!(" external ".parse::<ErrorClass>().unwrap(), ErrorClass::External);
    assert!("sometimes".parse::<ErrorClass>().is_err());
}
