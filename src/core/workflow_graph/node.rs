#![allow(clippy::result_large_err)] // Node helpers return AppError so loop and handler failures carry codes.

use crate::core::error::{AppError, ErrorSummary};
use crate::core::types::{ErrorCategory, ErrorClass};
use crate::core::workflow_graph::expression::Predicate;
use crate::core::workflow_graph::graph::Graph;
use crate::core::workflow_graph::state::ExecutionState;
use crate::core::workflow_graph::value::StateValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Unit of work in a graph. Configuration is read-only once the graph is built.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Function(FunctionNode),
    Conditional(ConditionalNode),
    Loop(LoopNode),
    ErrorHandler(ErrorHandlerNode),
    Subgraph(SubgraphNode),
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            NodeKind::Function(_) => "function",
            NodeKind::Conditional(_) => "conditional",
            NodeKind::Loop(LoopNode {
                mode: LoopMode::While { .. },
                ..
            }) => "while",
            NodeKind::Loop(_) => "for_each",
            NodeKind::ErrorHandler(_) => "error_handler",
            NodeKind::Subgraph(_) => "subgraph",
        }
    }
}

/// Binds a callable parameter to a state variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub param: String,
    pub variable: String,
    pub required: bool,
}

impl InputBinding {
    pub fn new(param: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            variable: variable.into(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Copies one named callable output into a state variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBinding {
    pub output: String,
    pub variable: String,
}

impl OutputBinding {
    pub fn new(output: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            variable: variable.into(),
        }
    }

    /// Output written to a variable of the same name.
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name)
    }
}

/// Invokes an external callable with inputs drawn from state.
#[derive(Debug, Clone, Default)]
pub struct FunctionNode {
    pub callable: String,
    pub params: BTreeMap<String, StateValue>,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
    pub timeout: Option<Duration>,
}

impl FunctionNode {
    pub fn new(callable: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn input(mut self, param: impl Into<String>, variable: impl Into<String>) -> Self {
        self.inputs.push(InputBinding::new(param, variable));
        self
    }

    pub fn output(mut self, output: impl Into<String>, variable: impl Into<String>) -> Self {
        self.outputs.push(OutputBinding::new(output, variable));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Side-effect free branch point; its boolean result feeds edge resolution.
#[derive(Debug, Clone)]
pub struct ConditionalNode {
    pub predicate: Predicate,
}

impl ConditionalNode {
    pub fn new(predicate: Predicate) -> Self {
        Self { predicate }
    }
}

#[derive(Debug, Clone)]
pub enum LoopMode {
    /// Re-evaluated on every entry; the body owns the loop variable.
    While { condition: Predicate },
    /// Walks a list variable, exposing item and index under the configured names.
    ForEach {
        collection: String,
        item_var: String,
        index_var: String,
    },
}

#[derive(Debug, Clone)]
pub struct LoopNode {
    pub mode: LoopMode,
    pub max_iterations: u32,
}

/// Per-run bookkeeping for one loop node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub iterations: u32,
    pub cursor: usize,
}

/// What a loop node tells the scheduler on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopSignal {
    Continue,
    Exhausted,
}

impl LoopNode {
    pub fn while_loop(condition: Predicate, max_iterations: u32) -> Self {
        Self {
            mode: LoopMode::While { condition },
            max_iterations,
        }
    }

    pub fn for_each(
        collection: impl Into<String>,
        item_var: impl Into<String>,
        index_var: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            mode: LoopMode::ForEach {
                collection: collection.into(),
                item_var: item_var.into(),
                index_var: index_var.into(),
            },
            max_iterations,
        }
    }

    /// Decide whether to run the body again, updating the frame.
    ///
    /// Starting a body iteration when `max_iterations` bodies already ran is
    /// `LoopLimitExceeded`. The frame resets when the loop exits so an
    /// enclosing loop can re-enter it.
    pub fn enter(
        &self,
        node_id: &str,
        state: &mut ExecutionState,
        frame: &mut LoopFrame,
    ) -> Result<LoopSignal, AppError> {
        match &self.mode {
            LoopMode::While { condition } => {
                if !condition.evaluate(state)? {
                    *frame = LoopFrame::default();
                    return Ok(LoopSignal::Exhausted);
                }
                self.check_limit(node_id, frame)?;
                frame.iterations += 1;
                Ok(LoopSignal::Continue)
            }
            LoopMode::ForEach {
                collection,
                item_var,
                index_var,
            } => {
                let items = match state.get(collection) {
                    Some(StateValue::List(items)) => items,
                    Some(other) => {
                        return Err(AppError::new(
                            ErrorCategory::TypeMismatch,
                            format!(
                                "loop collection '{}' is {} instead of list",
                                collection,
                                other.kind()
                            ),
                        )
                        .with_code("GRF-LOOP-002"));
                    }
                    None => {
                        return Err(AppError::new(
                            ErrorCategory::NotFound,
                            format!("loop collection '{}' is not set", collection),
                        )
                        .with_code("GRF-LOOP-003"));
                    }
                };
                if frame.cursor >= items.len() {
                    *frame = LoopFrame::default();
                    return Ok(LoopSignal::Exhausted);
                }
                self.check_limit(node_id, frame)?;
                let item = items[frame.cursor].clone();
                state.set(item_var.clone(), item);
                state.set(index_var.clone(), StateValue::Int(frame.cursor as i64));
                frame.cursor += 1;
                frame.iterations += 1;
                Ok(LoopSignal::Continue)
            }
        }
    }

    fn check_limit(&self, node_id: &str, frame: &LoopFrame) -> Result<(), AppError> {
        if frame.iterations >= self.max_iterations {
            return Err(AppError::new(
                ErrorCategory::LoopLimitExceeded,
                format!(
                    "loop {} exceeded max_iterations ({})",
                    node_id, self.max_iterations
                ),
            )
            .with_code("GRF-LOOP-001")
            .with_node(node_id));
        }
        Ok(())
    }
}

/// Result of one node invocation, consumed by edge resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NodeResult {
    /// Raw output of a function or subgraph node.
    Output(StateValue),
    Branch(bool),
    Loop(LoopSignal),
    Recovery(RecoveryAction),
}

impl NodeResult {
    /// Value reported as the run output when this node is the last one.
    pub fn output_value(&self) -> StateValue {
        match self {
            NodeResult::Output(value) => value.clone(),
            NodeResult::Branch(flag) => StateValue::Bool(*flag),
            NodeResult::Loop(signal) => StateValue::from(match signal {
                LoopSignal::Continue => "continue",
                LoopSignal::Exhausted => "exhausted",
            }),
            NodeResult::Recovery(action) => StateValue::from(action.label()),
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `ceiling`.
///
/// `jitter` adds a random extra wait of up to that much when the scheduler sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub ceiling: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            ceiling: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1` (attempt counts from 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

/// Recovery decision taken by an error handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry { attempt: u32, delay_ms: u64 },
    Fallback { target: String },
    Abort,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::Fallback { .. } => "fallback",
            RecoveryAction::Abort => "abort",
        }
    }
}

/// Decides how to recover from failures routed to it through an error edge.
#[derive(Debug, Clone)]
pub struct ErrorHandlerNode {
    pub retry_on: Vec<ErrorClass>,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub fallback: Option<String>,
    /// Variable receiving the error details when falling back.
    pub error_variable: Option<String>,
}

impl Default for ErrorHandlerNode {
    fn default() -> Self {
        Self {
            retry_on: vec![ErrorClass::Transient, ErrorClass::External, ErrorClass::Timeout],
            max_retries: 3,
            backoff: Backoff::default(),
            fallback: None,
            error_variable: None,
        }
    }
}

impl ErrorHandlerNode {
    pub fn retry(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            ..Default::default()
        }
    }

    pub fn fallback_to(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }

    pub fn retry_on(mut self, classes: Vec<ErrorClass>) -> Self {
        self.retry_on = classes;
        self
    }

    pub fn error_variable(mut self, name: impl Into<String>) -> Self {
        self.error_variable = Some(name.into());
        self
    }

    /// `attempt` is the number of retries already spent on the failing node.
    pub fn decide(&self, error: &ErrorSummary, attempt: u32) -> RecoveryAction {
        let retryable = error.class != ErrorClass::Fatal && self.retry_on.contains(&error.class);
        if retryable && attempt < self.max_retries {
            return RecoveryAction::Retry {
                attempt: attempt + 1,
                delay_ms: self.backoff.delay(attempt).as_millis() as u64,
            };
        }
        match &self.fallback {
            Some(target) => RecoveryAction::Fallback {
                target: target.clone(),
            },
            None => RecoveryAction::Abort,
        }
    }
}

/// How a subgraph sees and writes back the parent state. There is no default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationMode {
    /// Child works on a copy of the whole parent state; everything is written back.
    Shared,
    /// Child sees parent variables under `prefix` with the prefix stripped;
    /// its variables are written back under the prefix.
    Scoped { prefix: String },
    /// Child sees only mapped inputs; only mapped outputs are written back.
    Isolated,
}

#[derive(Debug, Clone)]
pub struct SubgraphNode {
    pub graph: Arc<Graph>,
    pub isolation: IsolationMode,
    /// (parent variable, child variable)
    pub inputs: Vec<(String, String)>,
    /// (child variable, parent variable)
    pub outputs: Vec<(String, String)>,
}

impl SubgraphNode {
    pub fn new(graph: Arc<Graph>, isolation: IsolationMode) -> Self {
        Self {
            graph,
            isolation,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, parent: impl Into<String>, child: impl Into<String>) -> Self {
        self.inputs.push((parent.into(), child.into()));
        self
    }

    pub fn output(mut self, child: impl Into<String>, parent: impl Into<String>) -> Self {
        self.outputs.push((child.into(), parent.into()));
        self
    }

    /// Build the child's initial state from the parent.
    pub fn child_state(&self, parent: &ExecutionState, child_execution_id: &str) -> ExecutionState {
        let mut child = match &self.isolation {
            IsolationMode::Shared => parent.fork(child_execution_id),
            IsolationMode::Scoped { prefix } => {
                let scoped = parent
                    .variables()
                    .iter()
                    .filter_map(|(name, value)| {
                        name.strip_prefix(prefix.as_str())
                            .map(|stripped| (stripped.to_string(), value.clone()))
                    })
                    .collect::<Vec<_>>();
                ExecutionState::with_variables(child_execution_id, scoped)
            }
            IsolationMode::Isolated => ExecutionState::new(child_execution_id),
        };
        for (parent_name, child_name) in &self.inputs {
            if let Some(value) = parent.get(parent_name) {
                child.set(child_name.clone(), value.clone());
            }
        }
        child.take_changes();
        child
    }

    /// Changes to apply to the parent once the child completed. `parent` is the
    /// state the child was forked from.
    pub fn write_back(&self, parent: &ExecutionState, child: &ExecutionState) -> Vec<StateWrite> {
        let mut writes: Vec<StateWrite> = match &self.isolation {
            IsolationMode::Shared => {
                let removed = parent
                    .variables()
                    .keys()
                    .filter(|name| !child.contains(name))
                    .map(|name| StateWrite::Remove(name.clone()));
                let set = child
                    .variables()
                    .iter()
                    .map(|(name, value)| StateWrite::Set(name.clone(), value.clone()));
                removed.chain(set).collect()
            }
            IsolationMode::Scoped { prefix } => {
                let removed = parent
                    .variables()
                    .keys()
                    .filter(|name| {
                        name.strip_prefix(prefix.as_str())
                            .is_some_and(|stripped| !child.contains(stripped))
                    })
                    .map(|name| StateWrite::Remove(name.clone()));
                let set = child.variables().iter().map(|(name, value)| {
                    StateWrite::Set(format!("{}{}", prefix, name), value.clone())
                });
                removed.chain(set).collect()
            }
            IsolationMode::Isolated => Vec::new(),
        };
        for (child_name, parent_name) in &self.outputs {
            if let Some(value) = child.get(child_name) {
                writes.push(StateWrite::Set(parent_name.clone(), value.clone()));
            }
        }
        writes
    }
}

/// One deferred change to the invoking run's state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateWrite {
    Set(String, StateValue),
    Remove(String),
}
