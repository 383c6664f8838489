#![allow(clippy::result_large_err)] // Persistence errors surface as AppError like the rest of the engine.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::events::{EventKind, EventStream, ExecutionEvent};
use crate::core::workflow_graph::storage::StorageBackend;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

const METRICS_NAMESPACE: &str = "metrics";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: u64,
}

impl NodeStats {
    pub fn average_ms(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            0.0
        } else {
            self.total_ms as f64 / finished as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            0.0
        } else {
            self.successes as f64 / finished as f64
        }
    }

    fn record_duration(&mut self, duration_ms: u64) {
        self.total_ms += duration_ms;
        self.max_ms = self.max_ms.max(duration_ms);
        self.min_ms = Some(self.min_ms.map_or(duration_ms, |min| min.min(duration_ms)));
    }
}

/// Outcomes of runs that followed the same sequence of nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_ms: u64,
}

impl PathStats {
    pub fn average_ms(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.runs as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub nodes: BTreeMap<String, NodeStats>,
    /// Keyed by the visited node ids joined with `->`.
    pub paths: BTreeMap<String, PathStats>,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
}

struct RunTrace {
    started_at: DateTime<Utc>,
    path: Vec<String>,
}

/// Aggregates per-node and per-path statistics from execution events.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    nodes: Arc<DashMap<String, NodeStats>>,
    paths: Arc<DashMap<String, PathStats>>,
    runs: Arc<DashMap<String, RunTrace>>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &ExecutionEvent) {
        // Subgraph runs count toward node stats but are part of their parent's run.
        if event.payload.depth > 0 {
            self.record_node(event);
            return;
        }
        let mut trace = self
            .runs
            .entry(event.execution_id.clone())
            .or_insert_with(|| RunTrace {
                started_at: event.timestamp,
                path: Vec::new(),
            });
        match event.kind {
            EventKind::NodeCompleted => {
                if event.payload.recovery.is_none() {
                    if let Some(node_id) = &event.node_id {
                        trace.path.push(node_id.clone());
                    }
                }
                self.record_node(event);
            }
            EventKind::NodeStarted | EventKind::NodeFailed => self.record_node(event),
            EventKind::ExecutionCompleted | EventKind::ExecutionFailed => {
                let cancelled = event
                    .payload
                    .error
                    .as_ref()
                    .is_some_and(|error| error.category == ErrorCategory::Cancelled);

                let key = trace.path.join("->");
                let elapsed = (event.timestamp - trace.started_at).num_milliseconds().max(0) as u64;
                drop(trace);
                self.runs.remove(&event.execution_id);

                let mut path = self.paths.entry(key).or_default();
                path.runs += 1;
                path.total_ms += elapsed;
                let total = match (event.kind, cancelled) {
                    (EventKind::ExecutionCompleted, _) => {
                        path.completed += 1;
                        &self.completed
                    }
                    (_, true) => {
                        path.cancelled += 1;
                        &self.cancelled
                    }
                    _ => {
                        path.failed += 1;
                        &self.failed
                    }
                };
                total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Consume every event of `stream` in a background task.
    pub fn attach(&self, stream: &EventStream) -> JoinHandle<()> {
        let collector = self.clone();
        let mut subscription = stream.subscribe();
        tokio::spawn(async move {
            let mut missed = 0;
            while let Some(event) = subscription.recv().await {
                if subscription.missed() > missed {
                    missed = subscription.missed();
                    collector.forget_in_flight();
                }
                collector.record(&event);
            }
        })
    }

    fn record_node(&self, event: &ExecutionEvent) {
        let Some(node_id) = &event.node_id else {
            return;
        };
        match event.kind {
            EventKind::NodeStarted => {
                // Handler events carry the routed error; count only real invocations.
                if event.payload.error.is_none() {
                    self.nodes.entry(node_id.clone()).or_default().invocations += 1;
                }
            }
            EventKind::NodeCompleted => {
                if event.payload.recovery.is_some() {
                    return;
                }
                let mut stats = self.nodes.entry(node_id.clone()).or_default();
                stats.successes += 1;
                stats.record_duration(event.payload.duration_ms.unwrap_or(0));
            }
            EventKind::NodeFailed => {
                let mut stats = self.nodes.entry(node_id.clone()).or_default();
                stats.failures += 1;
                stats.record_duration(event.payload.duration_ms.unwrap_or(0));
            }
            EventKind::ExecutionCompleted | EventKind::ExecutionFailed => {}
        }
    }

    /// Drop every open run trace. After a lag their terminal events may be
    /// gone, so they would never be removed otherwise.
    fn forget_in_flight(&self) {
        let open = self.runs.len();
        self.runs.clear();
        tracing::warn!(open, "metrics subscriber lagged; discarding in-flight run paths");
    }

    pub fn node(&self, node_id: &str) -> Option<NodeStats> {
        self.nodes.get(node_id).map(|stats| stats.clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            paths: self
                .paths
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            executions_completed: self.completed.load(Ordering::Relaxed),
            executions_failed: self.failed.load(Ordering::Relaxed),
            executions_cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.nodes.clear();
        self.paths.clear();
        self.runs.clear();
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
    }

    pub async fn persist(&self, backend: &dyn StorageBackend, key: &str) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        backend.save(METRICS_NAMESPACE, key, bytes).await?;
        tracing::debug!(key, "metrics persisted");
        Ok(())
    }

    /// Replace the collected statistics with a persisted snapshot. Returns
    /// false when nothing was stored under `key`.
    pub async fn restore(&self, backend: &dyn StorageBackend, key: &str) -> Result<bool, AppError> {
        let Some(bytes) = backend.load(METRICS_NAMESPACE, key).await? else {
            return Ok(false);
        };
        let snapshot: MetricsSnapshot = serde_json::from_slice(&bytes)?;
        self.reset();
        for (node_id, stats) in snapshot.nodes {
            self.nodes.insert(node_id, stats);
        }
        for (path, stats) in snapshot.paths {
            self.paths.insert(path, stats);
        }
        self.completed.store(snapshot.executions_completed, Ordering::Relaxed);
        self.failed.store(snapshot.executions_failed, Ordering::Relaxed);
        self.cancelled.store(snapshot.executions_cancelled, Ordering::Relaxed);
        Ok(true)
    }
}
