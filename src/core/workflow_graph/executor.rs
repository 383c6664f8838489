#![allow(clippy::result_large_err)] // Executor returns AppError to preserve full diagnostic context; boxing would discard run-time state.

use crate::core::error::{AppError, ErrorSummary};
use crate::core::types::{ErrorCategory, ErrorClass};
use crate::core::workflow_graph::callable::{CallContext, CallValues, CallableRegistry};
use crate::core::workflow_graph::checkpoint::{CheckpointHandle, CheckpointStore};
use crate::core::workflow_graph::events::{EventKind, EventPayload, EventStream};
use crate::core::workflow_graph::graph::Graph;
use crate::core::workflow_graph::node::{
    FunctionNode, LoopFrame, Node, NodeKind, NodeResult, RecoveryAction, StateWrite, SubgraphNode,
};
use crate::core::workflow_graph::secrets::{resolve_masked, SecretMask, SecretResolver, StaticSecrets};
use crate::core::workflow_graph::state::{ExecutionState, StateSnapshot};
use crate::core::workflow_graph::value::StateValue;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Collaborators injected once at scheduler construction.
#[derive(Clone)]
pub struct Services {
    pub callables: CallableRegistry,
    pub secrets: Arc<dyn SecretResolver>,
    pub events: EventStream,
    pub checkpoints: Option<CheckpointStore>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            callables: CallableRegistry::with_builtins(),
            secrets: Arc::new(StaticSecrets::new()),
            events: EventStream::default(),
            checkpoints: None,
        }
    }
}

impl Services {
    pub fn with_callables(mut self, callables: CallableRegistry) -> Self {
        self.callables = callables;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = events;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }
}

/// Whole-run bounds; both failures are fatal and never routed to handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    pub max_total_steps: Option<u64>,
    pub max_time: Option<Duration>,
}

/// When the scheduler saves checkpoints. Requires a checkpoint store in [`Services`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Before the node following every successful step.
    pub on_node_complete: bool,
    pub every_n_steps: Option<u64>,
    /// Before invoking any of these nodes.
    pub at_nodes: BTreeSet<String>,
    /// At the failing node when the run fails.
    pub on_failure: bool,
}

impl CheckpointPolicy {
    pub fn at_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            at_nodes: nodes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn is_active(&self) -> bool {
        self.on_node_complete
            || self.every_n_steps.is_some()
            || !self.at_nodes.is_empty()
            || self.on_failure
    }
}

/// Where a run is invoked in the graph, handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoint {
    pub execution_id: String,
    pub node_id: String,
    /// Subgraph nesting depth; 0 for the top-level run.
    pub depth: usize,
    pub step_index: u64,
    pub attempt: u32,
}

/// Hook invoked around node execution, used by the debugger.
#[async_trait]
pub trait ExecutionObserver: Send + Sync + 'static {
    /// Called immediately before a node is invoked. May suspend the run; an
    /// error aborts it.
    async fn before_node(&self, point: &NodePoint, state: &ExecutionState) -> Result<(), AppError>;

    async fn after_step(&self, _step: &ExecutionStep) {}
}

#[derive(Clone, Default)]
pub struct RunOptions {
    pub limits: RunLimits,
    pub checkpoint: CheckpointPolicy,
    /// Keep per-step pre/post snapshots in the report.
    pub record_history: bool,
    pub observer: Option<Arc<dyn ExecutionObserver>>,
    /// Resume from checkpoints taken against a structurally different graph.
    pub allow_graph_change: bool,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("limits", &self.limits)
            .field("checkpoint", &self.checkpoint)
            .field("record_history", &self.record_history)
            .field("observer", &self.observer.is_some())
            .field("allow_graph_change", &self.allow_graph_change)
            .finish()
    }
}

/// Everything needed to continue a run from a node; stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPosition {
    /// Node about to be invoked.
    pub node_id: String,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopFrame>,
    /// Retries already spent per failing node.
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_steps: u64,
}

impl RunPosition {
    pub fn at(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn attempt(&self) -> u32 {
        self.retries.get(&self.node_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Pending(String),
    Running(String),
    Resolving(String),
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed | RunPhase::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    /// Failed and an error handler chose retry or fallback.
    Recovered,
    Failed,
    Cancelled,
}

/// One node invocation as recorded in execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub index: u64,
    pub execution_id: String,
    pub node_id: String,
    pub depth: usize,
    pub attempt: u32,
    /// Run position before the step.
    pub position: RunPosition,
    pub pre: StateSnapshot,
    pub post: StateSnapshot,
    pub result: Option<NodeResult>,
    pub status: StepStatus,
    pub error: Option<ErrorSummary>,
    pub recovery: Option<RecoveryAction>,
    /// Node the run moved to, if any.
    pub next: Option<String>,
    pub duration_ms: u64,
}

/// Caller-visible result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        node_id: String,
        output: StateValue,
    },
    Failed {
        kind: ErrorCategory,
        node_id: Option<String>,
        message: String,
        error: ErrorSummary,
    },
    Cancelled {
        node_id: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionOutcome::Cancelled { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorCategory> {
        match self {
            ExecutionOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn failed(error: &AppError) -> Self {
        let summary = error.summary();
        ExecutionOutcome::Failed {
            kind: error.category,
            node_id: error.node_id.clone(),
            message: error.message.clone(),
            error: summary,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub graph: String,
    pub outcome: ExecutionOutcome,
    /// State at termination, including after a failure.
    pub final_state: StateSnapshot,
    pub history: Vec<ExecutionStep>,
    /// Nodes that completed successfully, in order.
    pub path: Vec<String>,
    pub total_steps: u64,
    pub checkpoints: Vec<CheckpointHandle>,
    pub duration_ms: u64,
}

/// Runs graphs with a fixed set of collaborators and options.
#[derive(Clone)]
pub struct Scheduler {
    graph: Arc<Graph>,
    services: Services,
    options: RunOptions,
}

impl Scheduler {
    pub fn new(graph: Arc<Graph>, services: Services) -> Self {
        Self {
            graph,
            services,
            options: RunOptions {
                record_history: true,
                ..Default::default()
            },
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Stepwise handle over a fresh run.
    pub fn start_run(&self, state: ExecutionState, cancel: CancellationToken) -> Run {
        Run::new(
            self.graph.clone(),
            self.services.clone(),
            self.options.clone(),
            state,
            RunPosition::at(self.graph.start()),
            cancel,
        )
    }

    /// Stepwise handle continuing from an explicit position.
    pub fn run_at(
        &self,
        state: ExecutionState,
        position: RunPosition,
        cancel: CancellationToken,
    ) -> Run {
        let mut run = Run::new(
            self.graph.clone(),
            self.services.clone(),
            self.options.clone(),
            state,
            position,
            cancel,
        );
        run.skip_checkpoint = true;
        run
    }

    /// Run from the start node until a terminal state.
    pub async fn run(&self, state: ExecutionState, cancel: CancellationToken) -> ExecutionReport {
        self.start_run(state, cancel).run_to_end().await
    }

    /// Continue a run from a stored checkpoint.
    pub async fn resume(
        &self,
        handle: &CheckpointHandle,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, AppError> {
        let store = self.services.checkpoints.as_ref().ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                "resume requires a checkpoint store",
            )
            .with_code("GRF-CKPT-003")
        })?;
        let checkpoint = store.load(handle).await?;
        if let Some(fingerprint) = &checkpoint.graph_fingerprint {
            if fingerprint != self.graph.fingerprint() && !self.options.allow_graph_change {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!(
                        "checkpoint {} was taken against a different graph structure",
                        handle
                    ),
                )
                .with_code("GRF-CKPT-004"));
            }
        }
        self.graph.require_node(&checkpoint.position.node_id)?;
        tracing::info!(
            execution_id = %checkpoint.execution_id,
            sequence = checkpoint.sequence,
            node_id = %checkpoint.node_id,
            "resuming from checkpoint"
        );
        let state = ExecutionState::from_snapshot(&checkpoint.state);
        Ok(self
            .run_at(state, checkpoint.position, cancel)
            .run_to_end()
            .await)
    }
}

/// One run of a graph, advanced a node at a time.
pub struct Run {
    graph: Arc<Graph>,
    services: Services,
    options: RunOptions,
    state: ExecutionState,
    position: RunPosition,
    phase: RunPhase,
    cancel: CancellationToken,
    depth: usize,
    deadline: Option<Instant>,
    started: Instant,
    history: Vec<ExecutionStep>,
    path: Vec<String>,
    checkpoints: Vec<CheckpointHandle>,
    last_output: Option<(String, StateValue)>,
    outcome: Option<ExecutionOutcome>,
    /// Set after a success so `on_node_complete` saves before the next node.
    completed_previous: bool,
    skip_checkpoint: bool,
}

impl Run {
    fn new(
        graph: Arc<Graph>,
        services: Services,
        options: RunOptions,
        state: ExecutionState,
        position: RunPosition,
        cancel: CancellationToken,
    ) -> Self {
        let started = Instant::now();
        let deadline = options.limits.max_time.map(|max_time| started + max_time);
        Self {
            phase: RunPhase::Pending(position.node_id.clone()),
            graph,
            services,
            options,
            state,
            position,
            cancel,
            depth: 0,
            deadline,
            started,
            history: Vec::new(),
            path: Vec::new(),
            checkpoints: Vec::new(),
            last_output: None,
            outcome: None,
            completed_previous: false,
            skip_checkpoint: false,
        }
    }

    fn nested(mut self, depth: usize, deadline: Option<Instant>) -> Self {
        self.depth = depth;
        if let Some(parent) = deadline {
            self.deadline = Some(self.deadline.map_or(parent, |own| own.min(parent)));
        }
        self
    }

    pub fn execution_id(&self) -> &str {
        self.state.execution_id()
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn position(&self) -> &RunPosition {
        &self.position
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.outcome.as_ref()
    }

    pub fn history(&self) -> &[ExecutionStep] {
        &self.history
    }

    /// Drive the run to a terminal state.
    pub fn run_to_end(mut self) -> BoxFuture<'static, ExecutionReport> {
        let span = tracing::info_span!(
            "execution",
            execution_id = %self.state.execution_id(),
            graph = %self.graph.name(),
            depth = self.depth
        );
        Box::pin(
            async move {
                tracing::info!("execution started");
                while self.step().await.is_some() {}
                self.into_report()
            }
            .instrument(span),
        )
    }

    pub fn into_report(self) -> ExecutionReport {
        let outcome = self.outcome.unwrap_or(ExecutionOutcome::Cancelled {
            node_id: Some(self.position.node_id.clone()),
        });
        ExecutionReport {
            execution_id: self.state.execution_id().to_string(),
            graph: self.graph.name().to_string(),
            outcome,
            final_state: self.state.snapshot(),
            history: self.history,
            path: self.path,
            total_steps: self.position.total_steps,
            checkpoints: self.checkpoints,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Execute the pending node. Returns `None` once the run is terminal.
    pub async fn step(&mut self) -> Option<ExecutionStep> {
        let node_id = match &self.phase {
            RunPhase::Pending(node_id) => node_id.clone(),
            _ => return None,
        };

        if self.cancel.is_cancelled() {
            self.finish_cancelled(&node_id).await;
            return None;
        }
        if self.deadline_passed() {
            self.finish_failed(deadline_exceeded(&node_id)).await;
            return None;
        }
        if let Some(max_steps) = self.options.limits.max_total_steps {
            if self.position.total_steps >= max_steps {
                let error = AppError::new(
                    ErrorCategory::StepLimitExceeded,
                    format!("run exceeded max_total_steps ({})", max_steps),
                )
                .with_code("GRF-ITER-001")
                .with_node(&node_id);
                self.finish_failed(error).await;
                return None;
            }
        }
        if let Err(error) = self.maybe_checkpoint(&node_id).await {
            self.finish_failed(error.with_node(&node_id)).await;
            return None;
        }

        let attempt = self.position.attempt();
        if let Some(observer) = self.options.observer.clone() {
            let point = NodePoint {
                execution_id: self.execution_id().to_string(),
                node_id: node_id.clone(),
                depth: self.depth,
                step_index: self.position.total_steps,
                attempt,
            };
            if let Err(error) = observer.before_node(&point, &self.state).await {
                if error.is_cancelled() || self.cancel.is_cancelled() {
                    self.finish_cancelled(&node_id).await;
                } else {
                    self.finish_failed(error.with_node(&node_id)).await;
                }
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finish_cancelled(&node_id).await;
                return None;
            }
        }

        let graph = self.graph.clone();
        let node = match graph.require_node(&node_id) {
            Ok(node) => node,
            Err(error) => {
                self.finish_failed(error.with_node(&node_id)).await;
                return None;
            }
        };

        let position_before = self.position.clone();
        let pre = self.state.snapshot();
        self.state.take_changes();
        self.emit(
            Some(&node_id),
            EventKind::NodeStarted,
            EventPayload {
                attempt,
                state_version: Some(self.state.version()),
                ..Default::default()
            },
        )
        .await;
        tracing::debug!(node_id = %node_id, kind = node.kind_label(), attempt, "node started");

        self.phase = RunPhase::Running(node_id.clone());
        let started = Instant::now();
        let invocation = self.invoke(node, attempt).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.position.total_steps += 1;

        let mut result = None;
        let mut status = StepStatus::Completed;
        let mut step_error = None;
        let mut recovery = None;
        let mut next = None;

        match invocation {
            Ok(output_result) => {
                self.position.retries.remove(&node_id);
                let changed = self.state.take_changes();
                let output = match &output_result {
                    NodeResult::Output(value) => Some(value.clone()),
                    _ => None,
                };
                self.emit(
                    Some(&node_id),
                    EventKind::NodeCompleted,
                    EventPayload {
                        duration_ms: Some(duration_ms),
                        state_version: Some(self.state.version()),
                        changed,
                        output,
                        attempt,
                        ..Default::default()
                    },
                )
                .await;
                tracing::debug!(node_id = %node_id, duration_ms, "node completed");
                self.path.push(node_id.clone());
                self.last_output = Some((node_id.clone(), output_result.output_value()));

                self.phase = RunPhase::Resolving(node_id.clone());
                let resolved = graph.resolve_next(&node_id, &output_result, &self.state);
                result = Some(output_result);
                match resolved {
                    Ok(Some(edge)) => {
                        tracing::debug!(from = %node_id, to = %edge.to, "edge taken");
                        next = Some(edge.to.clone());
                        self.position.node_id = edge.to.clone();
                        self.phase = RunPhase::Pending(edge.to.clone());
                        self.completed_previous = true;
                    }
                    Ok(None) => self.finish_completed(&node_id).await,
                    Err(error) => {
                        status = StepStatus::Failed;
                        step_error = Some(error.summary());
                        self.finish_failed(error).await;
                    }
                }
            }
            Err(error) => {
                let error = error.with_node(&node_id);
                self.state.take_changes();
                step_error = Some(error.summary());
                self.emit(
                    Some(&node_id),
                    EventKind::NodeFailed,
                    EventPayload {
                        duration_ms: Some(duration_ms),
                        state_version: Some(self.state.version()),
                        error: Some(error.summary()),
                        attempt,
                        ..Default::default()
                    },
                )
                .await;
                self.completed_previous = false;

                if error.is_cancelled() || self.cancel.is_cancelled() {
                    status = StepStatus::Cancelled;
                    self.finish_cancelled(&node_id).await;
                } else if self.deadline_passed() {
                    status = StepStatus::Failed;
                    self.finish_failed(error).await;
                } else {
                    match self.recover(&graph, &node_id, &error, attempt).await {
                        Some(action) => {
                            status = match action {
                                RecoveryAction::Abort => StepStatus::Failed,
                                _ => StepStatus::Recovered,
                            };
                            recovery = Some(action.clone());
                            match action {
                                RecoveryAction::Retry { attempt, delay_ms } => {
                                    self.position.retries.insert(node_id.clone(), attempt);
                                    next = Some(node_id.clone());
                                    if !self.backoff_sleep(&graph, &node_id, delay_ms).await {
                                        self.finish_cancelled(&node_id).await;
                                    }
                                }
                                RecoveryAction::Fallback { target } => {
                                    self.position.retries.remove(&node_id);
                                    self.write_error_variable(&graph, &node_id, &error);
                                    self.state.take_changes();
                                    next = Some(target.clone());
                                    self.position.node_id = target.clone();
                                    self.phase = RunPhase::Pending(target);
                                }
                                RecoveryAction::Abort => self.finish_failed(error).await,
                            }
                        }
                        None => {
                            status = StepStatus::Failed;
                            self.finish_failed(error).await;
                        }
                    }
                }
            }
        }

        let step = ExecutionStep {
            index: position_before.total_steps,
            execution_id: self.execution_id().to_string(),
            node_id,
            depth: self.depth,
            attempt,
            position: position_before,
            pre,
            post: self.state.snapshot(),
            result,
            status,
            error: step_error,
            recovery,
            next,
            duration_ms,
        };
        if let Some(observer) = &self.options.observer {
            observer.after_step(&step).await;
        }
        if self.options.record_history {
            self.history.push(step.clone());
        }
        Some(step)
    }

    /// Invoke a node. Function and subgraph writes are applied only after the
    /// invocation finished without cancellation.
    async fn invoke(&mut self, node: &Node, attempt: u32) -> Result<NodeResult, AppError> {
        match &node.kind {
            NodeKind::Conditional(conditional) => conditional
                .predicate
                .evaluate(&self.state)
                .map(NodeResult::Branch),
            NodeKind::Loop(loop_node) => {
                let frame = self.position.loops.entry(node.id.clone()).or_default();
                loop_node
                    .enter(&node.id, &mut self.state, frame)
                    .map(NodeResult::Loop)
            }
            // Entered without an incoming error, a handler has nothing to do.
            NodeKind::ErrorHandler(_) => Ok(NodeResult::Output(StateValue::Null)),
            NodeKind::Function(function) => {
                let cancel = self.cancel.clone();
                let deadline = self.deadline;
                let (result, writes) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::cancelled()),
                    _ = until_deadline(deadline) => return Err(deadline_exceeded(&node.id)),
                    outcome = self.invoke_function(&node.id, function, attempt) => outcome?,
                };
                self.apply_writes(writes);
                Ok(result)
            }
            NodeKind::Subgraph(subgraph) => {
                let cancel = self.cancel.clone();
                let deadline = self.deadline;
                let (result, writes) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::cancelled()),
                    _ = until_deadline(deadline) => return Err(deadline_exceeded(&node.id)),
                    outcome = self.invoke_subgraph(&node.id, subgraph) => outcome?,
                };
                self.apply_writes(writes);
                Ok(result)
            }
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn apply_writes(&mut self, writes: Vec<StateWrite>) {
        for write in writes {
            match write {
                StateWrite::Set(name, value) => {
                    if self.state.get(&name) != Some(&value) {
                        self.state.set(name, value);
                    }
                }
                StateWrite::Remove(name) => {
                    self.state.remove(&name);
                }
            }
        }
    }

    async fn invoke_function(
        &self,
        node_id: &str,
        function: &FunctionNode,
        attempt: u32,
    ) -> Result<(NodeResult, Vec<StateWrite>), AppError> {
        let callable = self.services.callables.get(&function.callable).ok_or_else(|| {
            AppError::new(
                ErrorCategory::NotFound,
                format!("callable '{}' is not registered", function.callable),
            )
            .with_code("GRF-CALL-001")
        })?;

        let mut inputs: CallValues = function.params.clone();
        for binding in &function.inputs {
            match self.state.get(&binding.variable) {
                Some(value) => {
                    inputs.insert(binding.param.clone(), value.clone());
                }
                None if binding.required => {
                    return Err(AppError::new(
                        ErrorCategory::ValidationError,
                        format!(
                            "input '{}' expects variable '{}' which is not set",
                            binding.param, binding.variable
                        ),
                    )
                    .with_code("GRF-CALL-002"));
                }
                None => {}
            }
        }
        let mut mask = SecretMask::new();
        for value in inputs.values_mut() {
            *value = resolve_masked(value, self.services.secrets.as_ref(), &mut mask).await?;
        }

        let ctx = CallContext {
            execution_id: self.execution_id().to_string(),
            node_id: node_id.to_string(),
            attempt,
            cancel: self.cancel.child_token(),
        };
        let invocation = callable.invoke(inputs, ctx);
        let outputs = match function.timeout {
            Some(limit) => match timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(AppError::new(
                        ErrorCategory::TimeoutError,
                        format!("callable '{}' timed out after {:?}", function.callable, limit),
                    )
                    .with_code("GRF-CALL-003"));
                }
            },
            None => invocation.await,
        }
        .map_err(|error| mask.scrub_error(error))?;
        // Resolved secrets never reach state, history or events.
        let outputs: CallValues = outputs
            .into_iter()
            .map(|(name, value)| (name, mask.scrub(&value)))
            .collect();

        let mut writes = Vec::with_capacity(function.outputs.len());
        for binding in &function.outputs {
            let value = outputs.get(&binding.output).ok_or_else(|| {
                AppError::new(
                    ErrorCategory::NodeExecutionError,
                    format!(
                        "callable '{}' did not return declared output '{}'",
                        function.callable, binding.output
                    ),
                )
                .with_code("GRF-CALL-004")
            })?;
            writes.push(StateWrite::Set(binding.variable.clone(), value.clone()));
        }
        Ok((NodeResult::Output(StateValue::Map(outputs)), writes))
    }

    async fn invoke_subgraph(
        &self,
        node_id: &str,
        subgraph: &SubgraphNode,
    ) -> Result<(NodeResult, Vec<StateWrite>), AppError> {
        let child_id = format!("{}::{}", self.execution_id(), node_id);
        let child_state = subgraph.child_state(&self.state, &child_id);
        let child_options = RunOptions {
            limits: self.options.limits,
            checkpoint: CheckpointPolicy::default(),
            record_history: false,
            observer: self.options.observer.clone(),
            allow_graph_change: false,
        };
        let child = Run::new(
            subgraph.graph.clone(),
            self.services.clone(),
            child_options,
            child_state,
            RunPosition::at(subgraph.graph.start()),
            self.cancel.child_token(),
        )
        .nested(self.depth + 1, self.deadline);
        let report = child.run_to_end().await;
        match report.outcome {
            ExecutionOutcome::Completed { output, .. } => {
                let final_state = ExecutionState::from_snapshot(&report.final_state);
                Ok((NodeResult::Output(output), subgraph.write_back(&self.state, &final_state)))
            }
            ExecutionOutcome::Failed { error, .. } => Err(error
                .to_error()
                .with_context(format!("subgraph '{}'", subgraph.graph.name()))),
            ExecutionOutcome::Cancelled { .. } => Err(AppError::cancelled()),
        }
    }

    /// Route a failure through the node's error handler, emitting the handler's events.
    async fn recover(
        &mut self,
        graph: &Graph,
        node_id: &str,
        error: &AppError,
        attempt: u32,
    ) -> Option<RecoveryAction> {
        if matches!(
            error.category,
            ErrorCategory::LoopLimitExceeded
                | ErrorCategory::StepLimitExceeded
                | ErrorCategory::EdgeResolutionAmbiguous
                | ErrorCategory::Cancelled
        ) {
            return None;
        }
        let edge = graph.error_edge(node_id)?;
        let handler = match graph.node(&edge.to).map(|node| &node.kind) {
            Some(NodeKind::ErrorHandler(handler)) => handler,
            _ => return None,
        };
        let summary = error.summary();
        self.emit(
            Some(&edge.to),
            EventKind::NodeStarted,
            EventPayload {
                error: Some(summary.clone()),
                attempt,
                ..Default::default()
            },
        )
        .await;
        let action = handler.decide(&summary, attempt);
        tracing::warn!(
            node_id,
            handler = %edge.to,
            action = action.label(),
            error = %summary,
            "error routed to handler"
        );
        self.emit(
            Some(&edge.to),
            EventKind::NodeCompleted,
            EventPayload {
                recovery: Some(action.clone()),
                attempt,
                state_version: Some(self.state.version()),
                ..Default::default()
            },
        )
        .await;
        Some(action)
    }

    /// Sleep before a retry; returns false when cancelled meanwhile.
    async fn backoff_sleep(&mut self, graph: &Graph, node_id: &str, delay_ms: u64) -> bool {
        let jitter_ms = graph
            .error_edge(node_id)
            .and_then(|edge| graph.node(&edge.to))
            .and_then(|node| match &node.kind {
                NodeKind::ErrorHandler(handler) => Some(handler.backoff.jitter.as_millis() as u64),
                _ => None,
            })
            .unwrap_or(0);
        let sleep_ms = delay_ms.saturating_add(if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        });
        self.phase = RunPhase::Pending(node_id.to_string());
        if sleep_ms == 0 {
            return !self.cancel.is_cancelled();
        }
        // An expired deadline ends the sleep early; the next step reports it.
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = until_deadline(self.deadline) => true,
            _ = sleep(Duration::from_millis(sleep_ms)) => true,
        }
    }

    fn write_error_variable(&mut self, graph: &Graph, node_id: &str, error: &AppError) {
        let variable = graph
            .error_edge(node_id)
            .and_then(|edge| graph.node(&edge.to))
            .and_then(|node| match &node.kind {
                NodeKind::ErrorHandler(handler) => handler.error_variable.clone(),
                _ => None,
            });
        if let Some(variable) = variable {
            let mut details = BTreeMap::new();
            details.insert("code".to_string(), StateValue::from(error.code.clone()));
            details.insert("category".to_string(), StateValue::from(error.category.to_string()));
            details.insert("class".to_string(), StateValue::from(error.class.as_str()));
            details.insert("message".to_string(), StateValue::from(error.message.clone()));
            details.insert("node_id".to_string(), StateValue::from(node_id));
            self.state.set(variable, StateValue::Map(details));
        }
    }

    async fn maybe_checkpoint(&mut self, node_id: &str) -> Result<(), AppError> {
        if std::mem::take(&mut self.skip_checkpoint) {
            return Ok(());
        }
        let policy = &self.options.checkpoint;
        if self.services.checkpoints.is_none() || !policy.is_active() {
            return Ok(());
        }
        let steps = self.position.total_steps;
        let due = policy.at_nodes.contains(node_id)
            || (policy.on_node_complete && self.completed_previous)
            || policy
                .every_n_steps
                .is_some_and(|n| n > 0 && steps > 0 && steps % n == 0);
        if due {
            self.save_checkpoint().await?;
        }
        Ok(())
    }

    async fn save_checkpoint(&mut self) -> Result<(), AppError> {
        let Some(store) = self.services.checkpoints.clone() else {
            return Ok(());
        };
        let handle = store
            .save(
                self.state.execution_id(),
                &self.state.snapshot(),
                &self.position,
                Some(self.graph.fingerprint()),
            )
            .await?;
        self.checkpoints.push(handle);
        Ok(())
    }

    async fn emit(&self, node_id: Option<&str>, kind: EventKind, mut payload: EventPayload) {
        payload.depth = self.depth;
        self.services
            .events
            .emit(self.state.execution_id(), node_id, kind, payload)
            .await;
    }

    async fn finish_completed(&mut self, node_id: &str) {
        let output = self
            .last_output
            .as_ref()
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        self.emit(
            Some(node_id),
            EventKind::ExecutionCompleted,
            EventPayload {
                output: Some(output.clone()),
                state_version: Some(self.state.version()),
                ..Default::default()
            },
        )
        .await;
        tracing::info!(node_id, steps = self.position.total_steps, "execution completed");
        self.phase = RunPhase::Completed;
        self.outcome = Some(ExecutionOutcome::Completed {
            node_id: node_id.to_string(),
            output,
        });
    }

    async fn finish_failed(&mut self, error: AppError) {
        if self.options.checkpoint.on_failure && self.services.checkpoints.is_some() {
            if let Err(checkpoint_error) = self.save_checkpoint().await {
                tracing::warn!(error = %checkpoint_error, "failed to checkpoint failed run");
            }
        }
        self.emit(
            error.node_id.as_deref(),
            EventKind::ExecutionFailed,
            EventPayload {
                error: Some(error.summary()),
                state_version: Some(self.state.version()),
                ..Default::default()
            },
        )
        .await;
        tracing::error!(code = %error.code, category = %error.category, "execution failed: {}", error.message);
        self.phase = RunPhase::Failed;
        self.outcome = Some(ExecutionOutcome::failed(&error));
    }

    async fn finish_cancelled(&mut self, node_id: &str) {
        let error = AppError::cancelled().with_node(node_id);
        self.emit(
            Some(node_id),
            EventKind::ExecutionFailed,
            EventPayload {
                error: Some(error.summary()),
                state_version: Some(self.state.version()),
                ..Default::default()
            },
        )
        .await;
        tracing::info!(node_id, "execution cancelled");
        self.phase = RunPhase::Cancelled;
        self.outcome = Some(ExecutionOutcome::Cancelled {
            node_id: Some(node_id.to_string()),
        });
    }
}

/// Resolves once the run deadline passes; never resolves without one.
async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn deadline_exceeded(node_id: &str) -> AppError {
    AppError::new(ErrorCategory::TimeoutError, "run exceeded max_time")
        .with_code("GRF-TIME-001")
        .with_class(ErrorClass::Fatal)
        .with_node(node_id)
}
