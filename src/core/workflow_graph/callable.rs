#![allow(clippy::result_large_err)] // Callable trait and registry return AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::workflow_graph::value::StateValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Named values passed to and returned from a callable.
pub type CallValues = BTreeMap<String, StateValue>;

/// Invocation context handed to each callable run.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub execution_id: String,
    pub node_id: String,
    /// 0 for the first invocation, incremented per retry.
    pub attempt: u32,
    /// Long-running callables should watch this and return `AppError::cancelled()`.
    pub cancel: CancellationToken,
}

/// External capability invoked by function nodes.
#[async_trait]
pub trait Callable: Send + Sync + 'static {
    /// Name used by function nodes to reference this callable.
    fn name(&self) -> &str;

    /// Validate static params when a graph is loaded.
    fn validate_params(&self, _params: &CallValues) -> Result<(), AppError> {
        Ok(())
    }

    async fn invoke(&self, inputs: CallValues, ctx: CallContext) -> Result<CallValues, AppError>;
}

type SyncCallFn = dyn Fn(&CallValues, &CallContext) -> Result<CallValues, AppError> + Send + Sync;

/// Adapts a synchronous closure into a [`Callable`].
pub struct FnCallable {
    name: String,
    func: Arc<SyncCallFn>,
}

impl FnCallable {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&CallValues, &CallContext) -> Result<CallValues, AppError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Callable for FnCallable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, inputs: CallValues, ctx: CallContext) -> Result<CallValues, AppError> {
        (self.func)(&inputs, &ctx)
    }
}

/// Builder used to register callables before execution.
pub struct CallableRegistryBuilder {
    callables: HashMap<String, Arc<dyn Callable>>,
}

impl Default for CallableRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallableRegistryBuilder {
    pub fn new() -> Self {
        Self {
            callables: HashMap::new(),
        }
    }

    /// Register `callable`, replacing any earlier one with the same name.
    pub fn register<T: Callable>(&mut self, callable: T) -> &mut Self {
        let name = callable.name().to_string();
        if self
            .callables
            .insert(name.clone(), Arc::new(callable))
            .is_some()
        {
            tracing::warn!(callable = %name, "callable registered twice; keeping the latest");
        }
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&CallValues, &CallContext) -> Result<CallValues, AppError> + Send + Sync + 'static,
    {
        self.register(FnCallable::new(name, func))
    }

    pub fn build(self) -> CallableRegistry {
        CallableRegistry {
            inner: Arc::new(self.callables),
        }
    }
}

/// Immutable registry available during execution.
#[derive(Clone)]
pub struct CallableRegistry {
    inner: Arc<HashMap<String, Arc<dyn Callable>>>,
}

impl Default for CallableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.inner.keys().collect();
        names.sort();
        f.debug_struct("CallableRegistry").field("callables", &names).finish()
    }
}

impl CallableRegistry {
    pub fn new() -> Self {
        CallableRegistryBuilder::new().build()
    }

    /// Builder pre-loaded with the built-in callables.
    pub fn builder() -> CallableRegistryBuilder {
        let mut builder = CallableRegistryBuilder::new();
        crate::core::workflow_graph::callables::register_builtins(&mut builder);
        builder
    }

    /// Registry holding only the built-in callables.
    pub fn with_builtins() -> Self {
        Self::builder().build()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}
