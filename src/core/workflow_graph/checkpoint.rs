#![allow(clippy::result_large_err)] // Checkpoint module returns AppError to preserve structured diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::executor::RunPosition;
use crate::core::workflow_graph::state::{ExecutionState, StateSnapshot};
use crate::core::workflow_graph::storage::StorageBackend;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const FORMAT_VERSION: u32 = 1;
const NAMESPACE_PREFIX: &str = "checkpoints/";

/// Stable reference to one stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub execution_id: String,
    pub sequence: u64,
}

impl std::fmt::Display for CheckpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.execution_id, self.sequence)
    }
}

/// Persisted snapshot of state plus run position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub execution_id: String,
    pub sequence: u64,
    /// Node the run was about to invoke.
    pub node_id: String,
    pub state: StateSnapshot,
    pub position: RunPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub critical: bool,
}

impl Checkpoint {
    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            execution_id: self.execution_id.clone(),
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub handle: CheckpointHandle,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub critical: bool,
}

/// Thresholds applied by [`CheckpointStore::prune`]. Unset fields do not limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: Option<usize>,
    pub max_age: Option<Duration>,
    pub max_total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<CheckpointHandle>,
    pub kept: usize,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    node_id: String,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    critical: bool,
}

#[derive(Debug, Default)]
struct ExecutionIndex {
    hydrated: bool,
    entries: BTreeMap<u64, IndexEntry>,
}

/// Checkpoint persistence over a [`StorageBackend`].
///
/// Saves for one execution id are serialized through a per-execution lock;
/// different executions never contend.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
    indexes: Arc<DashMap<String, Arc<Mutex<ExecutionIndex>>>>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("executions", &self.indexes.len())
            .finish()
    }
}

fn namespace(execution_id: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, execution_id)
}

fn key(sequence: u64) -> String {
    format!("{:020}", sequence)
}

fn not_found(handle: &CheckpointHandle) -> AppError {
    AppError::new(
        ErrorCategory::NotFound,
        format!("checkpoint {} not found", handle),
    )
    .with_code("GRF-CKPT-002")
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            indexes: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(crate::core::workflow_graph::storage::MemoryBackend::new()))
    }

    fn index_for(&self, execution_id: &str) -> Arc<Mutex<ExecutionIndex>> {
        self.indexes
            .entry(execution_id.to_string())
            .or_default()
            .clone()
    }

    /// Load the index from the backend the first time an execution is touched.
    async fn hydrate(&self, execution_id: &str, index: &mut ExecutionIndex) -> Result<(), AppError> {
        if index.hydrated {
            return Ok(());
        }
        let ns = namespace(execution_id);
        for stored_key in self.backend.list(&ns).await? {
            let Some(bytes) = self.backend.load(&ns, &stored_key).await? else {
                continue;
            };
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => {
                    index.entries.insert(
                        checkpoint.sequence,
                        IndexEntry {
                            node_id: checkpoint.node_id,
                            created_at: checkpoint.created_at,
                            size_bytes: bytes.len() as u64,
                            critical: checkpoint.critical,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        execution_id,
                        key = %stored_key,
                        error = %err,
                        "skipping unreadable checkpoint"
                    );
                }
            }
        }
        index.hydrated = true;
        Ok(())
    }

    /// Persist a checkpoint positioned at `position.node_id`.
    pub async fn save(
        &self,
        execution_id: &str,
        snapshot: &StateSnapshot,
        position: &RunPosition,
        graph_fingerprint: Option<&str>,
    ) -> Result<CheckpointHandle, AppError> {
        let index = self.index_for(execution_id);
        let mut index = index.lock().await;
        self.hydrate(execution_id, &mut index).await?;
        let sequence = index.entries.keys().next_back().copied().unwrap_or(0) + 1;
        let checkpoint = Checkpoint {
            format_version: FORMAT_VERSION,
            execution_id: execution_id.to_string(),
            sequence,
            node_id: position.node_id.clone(),
            state: snapshot.clone(),
            position: position.clone(),
            graph_fingerprint: graph_fingerprint.map(str::to_string),
            created_at: Utc::now(),
            critical: false,
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize checkpoint: {}", err),
            )
            .with_code("GRF-CKPT-001")
        })?;
        let size_bytes = bytes.len() as u64;
        self.backend
            .save(&namespace(execution_id), &key(sequence), bytes)
            .await?;
        index.entries.insert(
            sequence,
            IndexEntry {
                node_id: checkpoint.node_id.clone(),
                created_at: checkpoint.created_at,
                size_bytes,
                critical: false,
            },
        );
        tracing::debug!(execution_id, sequence, node_id = %checkpoint.node_id, "checkpoint saved");
        Ok(checkpoint.handle())
    }

    /// Save the live state positioned at `node_id`.
    pub async fn save_at(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        node_id: &str,
    ) -> Result<CheckpointHandle, AppError> {
        self.save(execution_id, &state.snapshot(), &RunPosition::at(node_id), None)
            .await
    }

    pub async fn load(&self, handle: &CheckpointHandle) -> Result<Checkpoint, AppError> {
        let bytes = self
            .backend
            .load(&namespace(&handle.execution_id), &key(handle.sequence))
            .await?
            .ok_or_else(|| not_found(handle))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("checkpoint {} is corrupted: {}", handle, err),
            )
            .with_code("GRF-CKPT-005")
        })?;
        if checkpoint.format_version > FORMAT_VERSION {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "checkpoint {} uses format {} newer than supported {}",
                    handle, checkpoint.format_version, FORMAT_VERSION
                ),
            )
            .with_code("GRF-CKPT-006"));
        }
        Ok(checkpoint)
    }

    /// Rebuild the live state and run position of a checkpoint.
    pub async fn restore(
        &self,
        handle: &CheckpointHandle,
    ) -> Result<(ExecutionState, RunPosition), AppError> {
        let checkpoint = self.load(handle).await?;
        Ok((ExecutionState::from_snapshot(&checkpoint.state), checkpoint.position))
    }

    pub async fn latest(&self, execution_id: &str) -> Result<Option<CheckpointHandle>, AppError> {
        let index = self.index_for(execution_id);
        let mut index = index.lock().await;
        self.hydrate(execution_id, &mut index).await?;
        Ok(index
            .entries
            .keys()
            .next_back()
            .map(|sequence| CheckpointHandle {
                execution_id: execution_id.to_string(),
                sequence: *sequence,
            }))
    }

    /// Checkpoints of one execution in sequence order.
    pub async fn list(&self, execution_id: &str) -> Result<Vec<CheckpointInfo>, AppError> {
        let index = self.index_for(execution_id);
        let mut index = index.lock().await;
        self.hydrate(execution_id, &mut index).await?;
        Ok(index
            .entries
            .iter()
            .map(|(sequence, entry)| CheckpointInfo {
                handle: CheckpointHandle {
                    execution_id: execution_id.to_string(),
                    sequence: *sequence,
                },
                node_id: entry.node_id.clone(),
                created_at: entry.created_at,
                size_bytes: entry.size_bytes,
                critical: entry.critical,
            })
            .collect())
    }

    /// Execution ids with stored checkpoints.
    pub async fn executions(&self) -> Result<Vec<String>, AppError> {
        Ok(self
            .backend
            .namespaces()
            .await?
            .into_iter()
            .filter_map(|ns| ns.strip_prefix(NAMESPACE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Protect a checkpoint from pruning.
    pub async fn mark_critical(&self, handle: &CheckpointHandle) -> Result<(), AppError> {
        let index = self.index_for(&handle.execution_id);
        let mut index = index.lock().await;
        self.hydrate(&handle.execution_id, &mut index).await?;
        let mut checkpoint = self.load(handle).await?;
        checkpoint.critical = true;
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        let size_bytes = bytes.len() as u64;
        self.backend
            .save(&namespace(&handle.execution_id), &key(handle.sequence), bytes)
            .await?;
        if let Some(entry) = index.entries.get_mut(&handle.sequence) {
            entry.critical = true;
            entry.size_bytes = size_bytes;
        }
        Ok(())
    }

    pub async fn delete(&self, handle: &CheckpointHandle) -> Result<bool, AppError> {
        let index = self.index_for(&handle.execution_id);
        let mut index = index.lock().await;
        self.hydrate(&handle.execution_id, &mut index).await?;
        let removed = self
            .backend
            .delete(&namespace(&handle.execution_id), &key(handle.sequence))
            .await?;
        index.entries.remove(&handle.sequence);
        Ok(removed)
    }

    /// Apply `policy` to one execution.
    ///
    /// Walks from newest to oldest; the newest checkpoint and critical ones are
    /// always kept (and count toward the limits), others are kept while every
    /// threshold still holds.
    pub async fn prune(
        &self,
        execution_id: &str,
        policy: &RetentionPolicy,
    ) -> Result<PruneReport, AppError> {
        let index = self.index_for(execution_id);
        let mut index = index.lock().await;
        self.hydrate(execution_id, &mut index).await?;
        let now = Utc::now();
        let newest = index.entries.keys().next_back().copied();
        let mut kept_count = 0usize;
        let mut kept_bytes = 0u64;
        let mut doomed: Vec<u64> = Vec::new();
        for (sequence, entry) in index.entries.iter().rev() {
            let protected = Some(*sequence) == newest || entry.critical;
            let age = (now - entry.created_at).to_std().unwrap_or_default();
            let within = policy.max_count.map_or(true, |max_count| kept_count < max_count)
                && policy.max_age.map_or(true, |max_age| age <= max_age)
                && policy
                    .max_total_bytes
                    .map_or(true, |max_bytes| kept_bytes + entry.size_bytes <= max_bytes);
            if protected || within {
                kept_count += 1;
                kept_bytes += entry.size_bytes;
            } else {
                doomed.push(*sequence);
            }
        }
        let ns = namespace(execution_id);
        let mut report = PruneReport::default();
        for sequence in doomed {
            self.backend.delete(&ns, &key(sequence)).await?;
            index.entries.remove(&sequence);
            report.removed.push(CheckpointHandle {
                execution_id: execution_id.to_string(),
                sequence,
            });
        }
        report.removed.sort();
        report.kept = index.entries.len();
        if !report.removed.is_empty() {
            tracing::info!(
                execution_id,
                removed = report.removed.len(),
                kept = report.kept,
                "pruned checkpoints"
            );
        }
        Ok(report)
    }

    /// Apply `policy` to every execution with stored checkpoints.
    pub async fn prune_all(&self, policy: &RetentionPolicy) -> Result<PruneReport, AppError> {
        let mut total = PruneReport::default();
        for execution_id in self.executions().await? {
            let report = self.prune(&execution_id, policy).await?;
            total.removed.extend(report.removed);
            total.kept += report.kept;
        }
        Ok(total)
    }
}
