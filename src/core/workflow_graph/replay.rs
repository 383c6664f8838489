#![allow(clippy::result_large_err)] // Replay shares the engine's AppError so merge conflicts keep their context.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::events::{EventStream, EventStreamConfig};
use crate::core::workflow_graph::executor::{
    ExecutionReport, ExecutionStep, Run, RunOptions, Scheduler, Services,
};
use crate::core::workflow_graph::node::NodeResult;
use crate::core::workflow_graph::state::{ExecutionState, StateDiff, StateOverride};
use crate::core::workflow_graph::value::StateValue;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrigin {
    /// Recorded during the original run.
    Original,
    /// Re-invoked after a what-if modification.
    Reexecuted,
}

/// Side-by-side view of one step on both trajectories.
#[derive(Debug, Clone, Serialize)]
pub struct StepComparison {
    pub index: usize,
    pub original: Option<ExecutionStep>,
    pub modified: Option<ExecutionStep>,
    /// Difference between the post-states, when both exist.
    pub diff: Option<StateDiff>,
}

/// Cursor over a recorded execution history with what-if branching.
///
/// The cursor ranges over `0..=len`: position `i` is the state just before
/// step `i` ran, and `len` is the state after the last step. Moving the cursor
/// never re-invokes nodes unless the state was modified with
/// [`apply_changes`](Self::apply_changes), after which stepping past the end of
/// the known trajectory runs the real nodes.
pub struct ReplayEngine {
    execution_id: String,
    original: Vec<ExecutionStep>,
    scheduler: Option<Scheduler>,
    cursor: usize,
    staged: Vec<StateOverride>,
    diverged_at: Option<usize>,
    modified: Vec<ExecutionStep>,
    /// Modified state at the cursor where changes were last applied.
    pinned: Option<(usize, ExecutionState)>,
    branch: Option<Run>,
    cancel: CancellationToken,
}

impl ReplayEngine {
    /// Read-only replay of a recorded history.
    pub fn new(history: Vec<ExecutionStep>) -> Self {
        let execution_id = history
            .first()
            .map(|step| step.execution_id.clone())
            .unwrap_or_else(|| "replay".to_string());
        Self {
            execution_id,
            original: history,
            scheduler: None,
            cursor: 0,
            staged: Vec::new(),
            diverged_at: None,
            modified: Vec::new(),
            pinned: None,
            branch: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replay that can re-invoke nodes through `scheduler` after a modification.
    ///
    /// Re-executed nodes emit into a private event stream and never checkpoint.
    pub fn with_scheduler(history: Vec<ExecutionStep>, scheduler: &Scheduler) -> Self {
        let services = Services {
            events: EventStream::new(EventStreamConfig {
                retention: 0,
                ..Default::default()
            }),
            checkpoints: None,
            ..scheduler.services().clone()
        };
        let options = RunOptions {
            limits: scheduler.options().limits,
            record_history: false,
            ..Default::default()
        };
        let mut engine = Self::new(history);
        engine.scheduler = Some(Scheduler::new(scheduler.graph().clone(), services).with_options(options));
        engine
    }

    pub fn from_report(report: &ExecutionReport, scheduler: &Scheduler) -> Self {
        Self::with_scheduler(report.history.clone(), scheduler)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Steps on the current trajectory.
    pub fn len(&self) -> usize {
        match self.diverged_at {
            Some(at) => at + self.modified.len(),
            None => self.original.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged_at.is_some()
    }

    pub fn diverged_at(&self) -> Option<usize> {
        self.diverged_at
    }

    /// The originally recorded history; never altered by modifications.
    pub fn history(&self) -> &[ExecutionStep] {
        &self.original
    }

    /// Steps on the current trajectory.
    pub fn trajectory(&self) -> Vec<&ExecutionStep> {
        (0..self.len()).filter_map(|index| self.step(index)).collect()
    }

    fn step(&self, index: usize) -> Option<&ExecutionStep> {
        match self.diverged_at {
            Some(at) if index >= at => self.modified.get(index - at),
            _ => self.original.get(index),
        }
    }

    pub fn step_origin(&self, index: usize) -> Option<StepOrigin> {
        self.step(index)?;
        Some(match self.diverged_at {
            Some(at) if index >= at => StepOrigin::Reexecuted,
            _ => StepOrigin::Original,
        })
    }

    /// State with the cursor at `index`.
    pub fn state_at(&self, index: usize) -> Result<ExecutionState, AppError> {
        if index > self.len() {
            return Err(out_of_range(index, self.len()));
        }
        if let Some(step) = self.step(index) {
            return Ok(ExecutionState::from_snapshot(&step.pre));
        }
        if let Some((at, state)) = &self.pinned {
            if *at == index {
                return Ok(state.clone());
            }
        }
        Ok(match index.checked_sub(1).and_then(|last| self.step(last)) {
            Some(step) => ExecutionState::from_snapshot(&step.post),
            None => ExecutionState::new(self.execution_id.clone()),
        })
    }

    pub fn current_state(&self) -> Result<ExecutionState, AppError> {
        self.state_at(self.cursor)
    }

    /// Advance over the step at the cursor and return it.
    ///
    /// Known steps are returned from the trajectory; past its end on a
    /// diverged branch the next node is actually invoked.
    pub async fn step_forward(&mut self) -> Result<ExecutionStep, AppError> {
        if let Some(step) = self.step(self.cursor).cloned() {
            self.cursor += 1;
            return Ok(step);
        }
        let len = self.len();
        let Some(branch) = self.branch.as_mut() else {
            return Err(out_of_range(self.cursor + 1, len));
        };
        match branch.step().await {
            Some(step) => {
                tracing::debug!(index = self.cursor, node_id = %step.node_id, "re-executed step");
                self.modified.push(step.clone());
                self.cursor += 1;
                Ok(step)
            }
            None => Err(out_of_range(self.cursor + 1, len)),
        }
    }

    /// Move back one step and return the state before that step ran.
    pub fn step_backward(&mut self) -> Result<ExecutionState, AppError> {
        if self.cursor == 0 {
            return Err(AppError::new(
                ErrorCategory::IndexOutOfRange,
                "already at the first step",
            )
            .with_code("GRF-REPLAY-001"));
        }
        self.cursor -= 1;
        self.state_at(self.cursor)
    }

    pub fn jump_to_step(&mut self, index: usize) -> Result<ExecutionState, AppError> {
        let state = self.state_at(index)?;
        self.cursor = index;
        Ok(state)
    }

    /// Stage an override for the state at the cursor.
    pub fn modify_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<StateValue>,
    ) -> Result<(), AppError> {
        let name = name.into();
        let version = self.current_state()?.key_version(&name);
        self.staged.retain(|staged| staged.name != name);
        self.staged.push(StateOverride::new(name, value).expecting(version));
        Ok(())
    }

    pub fn staged(&self) -> &[StateOverride] {
        &self.staged
    }

    pub fn discard_changes(&mut self) {
        self.staged.clear();
    }

    /// Commit staged overrides at the cursor and branch from there.
    ///
    /// Steps after the cursor on the current trajectory are discarded; the
    /// original history is kept for comparison.
    pub fn apply_changes(&mut self) -> Result<ExecutionState, AppError> {
        let scheduler = self.scheduler.as_ref().ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                "what-if replay needs a scheduler to re-invoke nodes",
            )
            .with_code("GRF-REPLAY-002")
        })?;
        // At the end of a live branch, continue from where that branch stands.
        let pending_branch = self
            .branch
            .as_ref()
            .filter(|branch| self.cursor == self.len() && !branch.is_finished())
            .map(|branch| branch.position().clone());
        let position = self
            .step(self.cursor)
            .map(|step| step.position.clone())
            .or(pending_branch)
            .ok_or_else(|| {
                AppError::new(
                    ErrorCategory::IndexOutOfRange,
                    format!("no step to re-execute at position {}", self.cursor),
                )
                .with_code("GRF-REPLAY-003")
            })?;
        let mut state = self.current_state()?;
        state.merge(&self.staged)?;
        state.take_changes();

        match self.diverged_at {
            Some(at) if self.cursor >= at => self.modified.truncate(self.cursor - at),
            _ => {
                self.modified.clear();
                self.diverged_at = Some(self.cursor);
            }
        }
        tracing::info!(
            cursor = self.cursor,
            overrides = self.staged.len(),
            node_id = %position.node_id,
            "replay diverged"
        );
        self.staged.clear();
        self.pinned = Some((self.cursor, state.clone()));
        self.branch = Some(scheduler.run_at(state.clone(), position, self.cancel.child_token()));
        Ok(state)
    }

    pub fn original_result(&self, index: usize) -> Option<&NodeResult> {
        self.original.get(index)?.result.as_ref()
    }

    /// Result of the re-executed step at `index`, if the branch reached it.
    pub fn modified_result(&self, index: usize) -> Option<&NodeResult> {
        let at = self.diverged_at?;
        self.modified.get(index.checked_sub(at)?)?.result.as_ref()
    }

    pub fn compare(&self, index: usize) -> StepComparison {
        let original = self.original.get(index).cloned();
        let modified = self
            .diverged_at
            .and_then(|at| index.checked_sub(at))
            .and_then(|offset| self.modified.get(offset))
            .cloned();
        let diff = match (&original, &modified) {
            (Some(original), Some(modified)) => Some(original.post.diff(&modified.post)),
            _ => None,
        };
        StepComparison {
            index,
            original,
            modified,
            diff,
        }
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn out_of_range(index: usize, len: usize) -> AppError {
    AppError::new(
        ErrorCategory::IndexOutOfRange,
        format!("step {} is outside the replay range 0..={}", index, len),
    )
    .with_code("GRF-REPLAY-001")
}
