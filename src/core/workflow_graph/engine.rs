#![allow(clippy::result_large_err)] // Engine surfaces AppError to transports unchanged.

use crate::core::config::EngineConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::checkpoint::{CheckpointHandle, CheckpointStore};
use crate::core::workflow_graph::events::EventStream;
use crate::core::workflow_graph::executor::{ExecutionReport, RunOptions, Scheduler, Services};
use crate::core::workflow_graph::graph::Graph;
use crate::core::workflow_graph::state::ExecutionState;
use crate::core::workflow_graph::storage::FileBackend;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct IdempotencyEntry {
    created: Instant,
    report: Arc<OnceCell<Arc<ExecutionReport>>>,
}

struct EngineInner {
    services: Services,
    options: RunOptions,
    permits: Arc<Semaphore>,
    running: DashMap<String, CancellationToken>,
    idempotency: DashMap<String, IdempotencyEntry>,
    idempotency_window: Duration,
}

/// Front door for transports: concurrent runs, cancellation and
/// idempotent execution over shared, read-only graphs.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// A run started with [`Engine::enqueue`].
pub struct ExecutionHandle {
    execution_id: String,
    cancel: CancellationToken,
    task: JoinHandle<ExecutionReport>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<ExecutionReport, AppError> {
        self.task.await.map_err(|err| {
            AppError::new(
                ErrorCategory::InternalError,
                format!("execution {} panicked: {}", self.execution_id, err),
            )
            .with_code("GRF-ENGINE-002")
        })
    }
}

impl Engine {
    pub fn new(
        services: Services,
        options: RunOptions,
        max_concurrent_runs: usize,
        idempotency_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                services,
                options,
                permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
                running: DashMap::new(),
                idempotency: DashMap::new(),
                idempotency_window,
            }),
        }
    }

    /// Build an engine from configuration. Checkpoints use a file backend when
    /// a directory is configured, memory otherwise.
    pub fn from_config(config: &EngineConfig, services: Services) -> Result<Self, AppError> {
        let mut services = services.with_events(EventStream::new(config.event_stream_config()));
        if config.checkpoint.enabled && services.checkpoints.is_none() {
            let store = match &config.checkpoint.directory {
                Some(directory) => CheckpointStore::new(Arc::new(FileBackend::new(directory))),
                None => CheckpointStore::in_memory(),
            };
            services = services.with_checkpoints(store);
        }
        let options = RunOptions {
            limits: config.run_limits()?,
            checkpoint: config.checkpoint_policy(),
            record_history: true,
            ..Default::default()
        };
        Ok(Self::new(
            services,
            options,
            config.execution.max_concurrent_runs,
            config.idempotency_window()?,
        ))
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.services.events
    }

    pub fn scheduler(&self, graph: Arc<Graph>) -> Scheduler {
        Scheduler::new(graph, self.inner.services.clone()).with_options(self.inner.options.clone())
    }

    /// Execution ids currently queued or running.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run to completion, waiting for a concurrency permit first.
    pub async fn start(&self, graph: Arc<Graph>, state: ExecutionState) -> ExecutionReport {
        let cancel = self.register(state.execution_id());
        self.run_registered(graph, state, cancel).await
    }

    /// Spawn a run and return immediately.
    pub fn enqueue(&self, graph: Arc<Graph>, state: ExecutionState) -> ExecutionHandle {
        let execution_id = state.execution_id().to_string();
        let cancel = self.register(&execution_id);
        let engine = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { engine.run_registered(graph, state, task_cancel).await });
        tracing::debug!(execution_id = %execution_id, "execution enqueued");
        ExecutionHandle {
            execution_id,
            cancel,
            task,
        }
    }

    /// Signal cancellation; returns false for unknown or finished runs.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.inner.running.get(execution_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(execution_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run once per idempotency key within the configured window.
    ///
    /// A duplicate request returns the first run's report; a duplicate that
    /// arrives while the first run is still going waits for it.
    pub async fn execute_idempotent(
        &self,
        key: &str,
        graph: Arc<Graph>,
        state: ExecutionState,
    ) -> Result<Arc<ExecutionReport>, AppError> {
        if key.trim().is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "idempotency key must not be empty",
            )
            .with_code("GRF-ENGINE-001"));
        }
        let window = self.inner.idempotency_window;
        self.inner
            .idempotency
            .retain(|_, entry| entry.created.elapsed() < window);
        let cell = self
            .inner
            .idempotency
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyEntry {
                created: Instant::now(),
                report: Arc::new(OnceCell::new()),
            })
            .report
            .clone();
        if cell.initialized() {
            tracing::debug!(key, "idempotent request served from cache");
        }
        let report = cell
            .get_or_init(|| async { Arc::new(self.start(graph, state).await) })
            .await;
        Ok(report.clone())
    }

    /// Continue a run from a stored checkpoint under the engine's limits.
    pub async fn resume(
        &self,
        graph: Arc<Graph>,
        handle: &CheckpointHandle,
    ) -> Result<ExecutionReport, AppError> {
        let cancel = self.register(&handle.execution_id);
        let _permit = self.acquire().await;
        let result = self.scheduler(graph).resume(handle, cancel).await;
        self.inner.running.remove(&handle.execution_id);
        result
    }

    fn register(&self, execution_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .running
            .insert(execution_id.to_string(), token.clone())
        {
            tracing::warn!(execution_id, "execution id reused while a run is active");
            previous.cancel();
        }
        token
    }

    async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.inner.permits.clone().acquire_owned().await.ok()
    }

    async fn run_registered(
        &self,
        graph: Arc<Graph>,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let execution_id = state.execution_id().to_string();
        let permit = tokio::select! {
            permit = self.acquire() => permit,
            _ = cancel.cancelled() => None,
        };
        if permit.is_none() {
            tracing::debug!(execution_id = %execution_id, "cancelled while waiting for a permit");
        }
        let report = self.scheduler(graph).run(state, cancel).await;
        drop(permit);
        self.inner.running.remove(&execution_id);
        report
    }
}
