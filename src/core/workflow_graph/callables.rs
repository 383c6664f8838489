//! Built-in callables available to every graph.

use crate::core::error::AppError;
use crate::core::types::{ErrorCategory, ErrorClass};
use crate::core::workflow_graph::callable::{
    CallContext, CallValues, Callable, CallableRegistryBuilder,
};
use crate::core::workflow_graph::value::StateValue;
use async_trait::async_trait;
use std::time::Duration;

/// Register the built-in callables into the supplied builder.
pub fn register_builtins(builder: &mut CallableRegistryBuilder) {
    builder
        .register(NoopCallable)
        .register(SetCallable)
        .register(EchoCallable)
        .register(FailCallable)
        .register(SleepCallable);
}

/// Does nothing and returns no outputs.
pub struct NoopCallable;

#[async_trait]
impl Callable for NoopCallable {
    fn name(&self) -> &str {
        "noop"
    }

    async fn invoke(&self, _inputs: CallValues, _ctx: CallContext) -> Result<CallValues, AppError> {
        Ok(CallValues::new())
    }
}

/// Returns its params (and inputs) as outputs, so output bindings can write them.
pub struct SetCallable;

#[async_trait]
impl Callable for SetCallable {
    fn name(&self) -> &str {
        "set"
    }

    async fn invoke(&self, inputs: CallValues, _ctx: CallContext) -> Result<CallValues, AppError> {
        Ok(inputs)
    }
}

/// Wraps its inputs under `echo`.
pub struct EchoCallable;

#[async_trait]
impl Callable for EchoCallable {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, inputs: CallValues, _ctx: CallContext) -> Result<CallValues, AppError> {
        let mut outputs = CallValues::new();
        outputs.insert("echo".to_string(), StateValue::Map(inputs));
        Ok(outputs)
    }
}

/// Always fails; `message` and `class` params shape the error.
pub struct FailCallable;

#[async_trait]
impl Callable for FailCallable {
    fn name(&self) -> &str {
        "fail"
    }

    fn validate_params(&self, params: &CallValues) -> Result<(), AppError> {
        if let Some(class) = params.get("class") {
            let text = class.extract::<String>()?;
            text.parse::<ErrorClass>().map_err(|err| {
                AppError::new(ErrorCategory::ValidationError, err).with_code("GRF-CALL-010")
            })?;
        }
        Ok(())
    }

    async fn invoke(&self, inputs: CallValues, ctx: CallContext) -> Result<CallValues, AppError> {
        let message = inputs
            .get("message")
            .and_then(|value| value.as_str())
            .unwrap_or("fail callable invoked")
            .to_string();
        let class = inputs
            .get("class")
            .and_then(|value| value.as_str())
            .and_then(|text| text.parse::<ErrorClass>().ok())
            .unwrap_or_default();
        Err(AppError::new(ErrorCategory::NodeExecutionError, message)
            .with_code("GRF-CALL-011")
            .with_class(class)
            .with_node(ctx.node_id))
    }
}

/// Waits `ms` milliseconds, returning early with `Cancelled` when cancelled.
pub struct SleepCallable;

#[async_trait]
impl Callable for SleepCallable {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn invoke(&self, inputs: CallValues, ctx: CallContext) -> Result<CallValues, AppError> {
        let ms = match inputs.get("ms") {
            Some(value) => value.extract::<i64>()?.max(0) as u64,
            None => 0,
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AppError::cancelled().with_node(ctx.node_id.clone())),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                let mut outputs = CallValues::new();
                outputs.insert("slept_ms".to_string(), StateValue::Int(ms as i64));
                Ok(outputs)
            }
        }
    }
}
