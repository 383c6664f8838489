#![allow(clippy::result_large_err)] // Debug controller returns AppError so callers see the same diagnostics as the scheduler.

//! Interactive stepping over a [`Scheduler`] run.
//!
//! The controller installs itself as the run's [`ExecutionObserver`]. Every
//! node the scheduler is about to invoke passes through [`DebugGate::before_node`],
//! which evaluates breakpoints and the step mode and, when the run should
//! pause, suspends the scheduler task until `resume` or `stop` is called.
//! Pausing therefore always happens between nodes, never mid-invocation.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::events::EventSubscription;
use crate::core::workflow_graph::executor::{
    ExecutionObserver, ExecutionReport, ExecutionStep, NodePoint, RunOptions, Scheduler,
};
use crate::core::workflow_graph::expression::Predicate;
use crate::core::workflow_graph::state::{ExecutionState, StateSnapshot};
use crate::core::workflow_graph::value::StateValue;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Run until a breakpoint or an explicit pause.
    Continue,
    /// Pause before the next node at any depth.
    StepInto,
    /// Pause before the next node at the paused depth or shallower.
    StepOver,
    /// Pause once the current subgraph returns to its parent.
    StepOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    Breakpoint { id: String },
    Step,
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DebugState {
    Idle,
    Running,
    Paused {
        node_id: String,
        depth: usize,
        reason: PauseReason,
    },
    Stopped,
}

impl DebugState {
    pub fn is_paused(&self) -> bool {
        matches!(self, DebugState::Paused { .. })
    }
}

#[derive(Debug, Clone)]
pub enum BreakpointKind {
    /// Pause whenever the target node is reached.
    Unconditional,
    /// Pause only when the predicate holds against the current state.
    Conditional(Predicate),
    /// Pause when the variable differs from its value at the previous step.
    DataChange { variable: String },
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: String,
    /// `None` matches every node.
    pub node_id: Option<String>,
    pub kind: BreakpointKind,
    pub max_hit_count: Option<u32>,
    pub hit_count: u32,
}

impl Breakpoint {
    pub fn at(node_id: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            node_id: Some(node_id.into()),
            kind: BreakpointKind::Unconditional,
            max_hit_count: None,
            hit_count: 0,
        }
    }

    pub fn conditional(node_id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            kind: BreakpointKind::Conditional(predicate),
            ..Self::at(node_id)
        }
    }

    /// Watch a variable across every node.
    pub fn data_change(variable: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            node_id: None,
            kind: BreakpointKind::DataChange {
                variable: variable.into(),
            },
            max_hit_count: None,
            hit_count: 0,
        }
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Remove the breakpoint after it paused the run `max` times.
    pub fn max_hits(mut self, max: u32) -> Self {
        self.max_hit_count = Some(max);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn applies_to(&self, node_id: &str) -> bool {
        self.node_id.as_deref().map_or(true, |id| id == node_id)
    }

    fn watched_variable(&self) -> Option<&str> {
        match &self.kind {
            BreakpointKind::DataChange { variable } => Some(variable),
            _ => None,
        }
    }

    fn expired(&self) -> bool {
        self.max_hit_count.is_some_and(|max| self.hit_count >= max)
    }
}

/// Notifications for debugger front-ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DebugEvent {
    Paused {
        node_id: String,
        depth: usize,
        reason: PauseReason,
    },
    Resumed {
        mode: StepMode,
    },
    BreakpointExpired {
        id: String,
    },
    BreakpointError {
        id: String,
        message: String,
    },
    Stopped,
}

struct GateInner {
    mode: StepMode,
    /// Depth at the last pause; step modes compare against it.
    reference_depth: usize,
    pause_requested: bool,
    breakpoints: Vec<Breakpoint>,
    last_observed: BTreeMap<String, Option<StateValue>>,
    paused_state: Option<StateSnapshot>,
    history: Vec<ExecutionStep>,
    next_breakpoint: u64,
}

impl GateInner {
    /// Record the current value of every watched variable as the baseline
    /// data-change breakpoints compare against until the next pause.
    fn observe_watched(&mut self, state: &ExecutionState) {
        let watched: Vec<String> = self
            .breakpoints
            .iter()
            .filter_map(|breakpoint| breakpoint.watched_variable().map(str::to_string))
            .collect();
        for variable in watched {
            let current = state.get(&variable).cloned();
            self.last_observed.insert(variable, current);
        }
    }
}

/// Observer installed into the scheduler; shared with the controller.
pub struct DebugGate {
    inner: Mutex<GateInner>,
    state: watch::Sender<DebugState>,
    events: broadcast::Sender<DebugEvent>,
}

impl DebugGate {
    fn new() -> Self {
        let (state, _) = watch::channel(DebugState::Idle);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(GateInner {
                mode: StepMode::Continue,
                reference_depth: 0,
                pause_requested: false,
                breakpoints: Vec::new(),
                last_observed: BTreeMap::new(),
                paused_state: None,
                history: Vec::new(),
                next_breakpoint: 1,
            }),
            state,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> DebugState {
        self.state.borrow().clone()
    }

    fn publish(&self, event: DebugEvent) {
        let _ = self.events.send(event);
    }

    fn mark_stopped(&self) {
        let mut inner = self.lock();
        let changed = self.state.send_if_modified(|state| {
            if *state == DebugState::Stopped {
                false
            } else {
                *state = DebugState::Stopped;
                true
            }
        });
        if changed {
            inner.paused_state = None;
            drop(inner);
            self.publish(DebugEvent::Stopped);
        }
    }

    /// Decide whether to pause before `point`. Runs under the gate lock.
    fn check(&self, inner: &mut GateInner, point: &NodePoint, state: &ExecutionState) -> Option<PauseReason> {
        let mut reason = None;
        let mut errors = Vec::new();
        for breakpoint in inner.breakpoints.iter_mut() {
            if !breakpoint.applies_to(&point.node_id) {
                continue;
            }
            let hit = match &breakpoint.kind {
                BreakpointKind::Unconditional => true,
                BreakpointKind::Conditional(predicate) => match predicate.evaluate(state) {
                    Ok(hit) => hit,
                    Err(error) => {
                        let error = AppError::new(
                            ErrorCategory::BreakpointEvaluationError,
                            format!("breakpoint {} skipped: {}", breakpoint.id, error.message),
                        )
                        .with_code("GRF-DEBUG-010")
                        .with_node(&point.node_id);
                        tracing::warn!(breakpoint = %breakpoint.id, error = %error, "breakpoint evaluation failed");
                        errors.push((breakpoint.id.clone(), error.message));
                        false
                    }
                },
                BreakpointKind::DataChange { variable } => match inner.last_observed.get(variable) {
                    Some(previous) => previous.as_ref() != state.get(variable),
                    None => false,
                },
            };
            if hit {
                breakpoint.hit_count += 1;
                if reason.is_none() {
                    reason = Some(PauseReason::Breakpoint {
                        id: breakpoint.id.clone(),
                    });
                }
            }
        }
        for (id, message) in errors {
            self.publish(DebugEvent::BreakpointError { id, message });
        }

        let mut expired = Vec::new();
        inner.breakpoints.retain(|breakpoint| {
            if breakpoint.expired() {
                expired.push(breakpoint.id.clone());
                false
            } else {
                true
            }
        });
        for id in expired {
            tracing::debug!(breakpoint = %id, "breakpoint reached its hit limit");
            self.publish(DebugEvent::BreakpointExpired { id });
        }

        if reason.is_some() {
            return reason;
        }
        let stepped = match inner.mode {
            StepMode::Continue => false,
            StepMode::StepInto => true,
            StepMode::StepOver => point.depth <= inner.reference_depth,
            StepMode::StepOut => point.depth < inner.reference_depth,
        };
        if stepped {
            Some(PauseReason::Step)
        } else if inner.pause_requested {
            Some(PauseReason::Requested)
        } else {
            None
        }
    }
}

#[async_trait]
impl ExecutionObserver for DebugGate {
    async fn before_node(&self, point: &NodePoint, state: &ExecutionState) -> Result<(), AppError> {
        // Subscribe before publishing the pause so a fast resume is not missed.
        let mut receiver = self.state.subscribe();
        {
            let mut inner = self.lock();
            if self.current() == DebugState::Stopped {
                return Err(AppError::cancelled());
            }
            let Some(reason) = self.check(&mut inner, point, state) else {
                return Ok(());
            };
            inner.pause_requested = false;
            inner.reference_depth = point.depth;
            inner.observe_watched(state);
            inner.paused_state = Some(state.snapshot());
            let paused = DebugState::Paused {
                node_id: point.node_id.clone(),
                depth: point.depth,
                reason: reason.clone(),
            };
            self.state.send_replace(paused);
            tracing::info!(node_id = %point.node_id, depth = point.depth, ?reason, "debugger paused");
            self.publish(DebugEvent::Paused {
                node_id: point.node_id.clone(),
                depth: point.depth,
                reason,
            });
        }
        let resumed = receiver
            .wait_for(|state| !state.is_paused())
            .await
            .map(|state| state.clone());
        match resumed {
            Ok(DebugState::Running) => Ok(()),
            _ => Err(AppError::cancelled()),
        }
    }

    async fn after_step(&self, step: &ExecutionStep) {
        if step.depth == 0 {
            self.lock().history.push(step.clone());
        }
    }
}

/// Drives a scheduler run under debugger control.
pub struct DebugController {
    scheduler: Scheduler,
    gate: Arc<DebugGate>,
    cancel: CancellationToken,
    execution_id: Option<String>,
    task: Option<JoinHandle<ExecutionReport>>,
}

impl DebugController {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            gate: Arc::new(DebugGate::new()),
            cancel: CancellationToken::new(),
            execution_id: None,
            task: None,
        }
    }

    /// Spawn the run and enter `Running`.
    pub fn start(&mut self, state: ExecutionState, mode: StepMode) -> Result<(), AppError> {
        if self.gate.current() != DebugState::Idle {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "debug session already started",
            )
            .with_code("GRF-DEBUG-003"));
        }
        {
            let mut inner = self.gate.lock();
            inner.mode = mode;
            inner.reference_depth = 0;
            inner.observe_watched(&state);
        }
        self.gate.state.send_replace(DebugState::Running);

        let observer: Arc<dyn ExecutionObserver> = self.gate.clone();
        let options = RunOptions {
            record_history: true,
            observer: Some(observer),
            ..self.scheduler.options().clone()
        };
        let scheduler = self.scheduler.clone().with_options(options);
        let gate = self.gate.clone();
        let cancel = self.cancel.clone();
        self.execution_id = Some(state.execution_id().to_string());
        tracing::info!(execution_id = %state.execution_id(), ?mode, "debug session started");
        self.task = Some(tokio::spawn(async move {
            let report = scheduler.run(state, cancel).await;
            gate.mark_stopped();
            report
        }));
        Ok(())
    }

    /// Request a pause before the next node.
    pub fn pause(&self) -> Result<(), AppError> {
        match self.gate.current() {
            DebugState::Running => {
                self.gate.lock().pause_requested = true;
                Ok(())
            }
            DebugState::Paused { .. } => Ok(()),
            other => Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("cannot pause a session that is {:?}", other),
            )
            .with_code("GRF-DEBUG-002")),
        }
    }

    pub fn resume(&self, mode: StepMode) -> Result<(), AppError> {
        let mut inner = self.gate.lock();
        if !self.gate.current().is_paused() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "resume requires a paused session",
            )
            .with_code("GRF-DEBUG-001"));
        }
        inner.mode = mode;
        inner.paused_state = None;
        self.gate.state.send_replace(DebugState::Running);
        drop(inner);
        tracing::debug!(?mode, "debugger resumed");
        self.gate.publish(DebugEvent::Resumed { mode });
        Ok(())
    }

    /// Stop from any state; a paused run is released and cancelled.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.gate.mark_stopped();
    }

    /// Register a breakpoint and return its id.
    pub fn add_breakpoint(&self, mut breakpoint: Breakpoint) -> String {
        let mut inner = self.gate.lock();
        if breakpoint.id.is_empty() {
            breakpoint.id = format!("bp-{}", inner.next_breakpoint);
            inner.next_breakpoint += 1;
        }
        let id = breakpoint.id.clone();
        if let Some(variable) = breakpoint.watched_variable() {
            // Added while paused: the paused state is the baseline.
            if let Some(value) = inner
                .paused_state
                .as_ref()
                .map(|snapshot| snapshot.get(variable).cloned())
            {
                inner.last_observed.insert(variable.to_string(), value);
            }
        }
        inner.breakpoints.retain(|existing| existing.id != id);
        inner.breakpoints.push(breakpoint);
        id
    }

    pub fn remove_breakpoint(&self, id: &str) -> bool {
        let mut inner = self.gate.lock();
        let before = inner.breakpoints.len();
        inner.breakpoints.retain(|breakpoint| breakpoint.id != id);
        inner.breakpoints.len() != before
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.gate.lock().breakpoints.clone()
    }

    pub fn state(&self) -> DebugState {
        self.gate.current()
    }

    /// Wait for the next pause or the end of the session.
    pub async fn wait_until_paused(&self) -> DebugState {
        let mut receiver = self.gate.state.subscribe();
        let reached = receiver
            .wait_for(|state| state.is_paused() || *state == DebugState::Stopped)
            .await
            .map(|state| state.clone());
        reached.unwrap_or(DebugState::Stopped)
    }

    /// Steps recorded so far for the top-level run.
    pub fn history(&self) -> Vec<ExecutionStep> {
        self.gate.lock().history.clone()
    }

    /// State at the paused node, before it runs.
    pub fn inspect_variables(&self) -> Option<StateSnapshot> {
        self.gate.lock().paused_state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.gate.events.subscribe()
    }

    /// Execution events of the debugged run.
    pub fn events(&self) -> Option<EventSubscription> {
        self.execution_id
            .as_ref()
            .map(|id| self.scheduler.services().events.subscribe_execution(id.clone()))
    }

    /// Wait for the run to end and return its report.
    pub async fn finish(&mut self) -> Result<ExecutionReport, AppError> {
        let task = self.task.take().ok_or_else(|| {
            AppError::new(ErrorCategory::ValidationError, "debug session was not started")
                .with_code("GRF-DEBUG-004")
        })?;
        task.await.map_err(|err| {
            AppError::new(
                ErrorCategory::InternalError,
                format!("debugged run panicked: {}", err),
            )
            .with_code("GRF-DEBUG-005")
        })
    }
}

impl Drop for DebugController {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop();
        }
    }
}
