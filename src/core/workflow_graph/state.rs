#![allow(clippy::result_large_err)] // State module returns AppError to preserve structured diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::value::{FromStateValue, StateValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Versioned variable store threaded through a single run.
///
/// Every `set`, `remove` and `merge` bumps the version counter. Each variable
/// also remembers the version at which it was last written, which is what
/// `merge` checks expected versions against.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    execution_id: String,
    version: u64,
    variables: BTreeMap<String, StateValue>,
    key_versions: BTreeMap<String, u64>,
    dirty: BTreeSet<String>,
}

/// Immutable deep copy of an [`ExecutionState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub execution_id: String,
    pub version: u64,
    pub variables: BTreeMap<String, StateValue>,
    #[serde(default)]
    pub key_versions: BTreeMap<String, u64>,
}

/// One staged write for [`ExecutionState::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateOverride {
    pub name: String,
    pub value: StateValue,
    /// Version the caller observed for this key; `Some(0)` means "must be absent".
    pub expected_version: Option<u64>,
}

impl StateOverride {
    pub fn new(name: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expected_version: None,
        }
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Key-level difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            version: 0,
            variables: BTreeMap::new(),
            key_versions: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Seed a state from caller-supplied variables; seeding counts as a single version.
    pub fn with_variables<I, K, V>(execution_id: impl Into<String>, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<StateValue>,
    {
        let mut state = Self::new(execution_id);
        let entries: Vec<(String, StateValue)> = variables
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if !entries.is_empty() {
            state.version = 1;
            for (name, value) in entries {
                state.key_versions.insert(name.clone(), 1);
                state.variables.insert(name, value);
            }
        }
        state
    }

    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id.clone(),
            version: snapshot.version,
            variables: snapshot.variables.clone(),
            key_versions: snapshot.key_versions.clone(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version at which `name` was last written; 0 when absent.
    pub fn key_version(&self, name: &str) -> u64 {
        self.key_versions.get(name).copied().unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.variables.get(name)
    }

    /// Typed read: `Ok(None)` for a missing key, `TypeMismatch` for a wrong kind.
    pub fn get_as<T: FromStateValue>(&self, name: &str) -> Result<Option<T>, AppError> {
        match self.variables.get(name) {
            None => Ok(None),
            Some(value) => value
                .extract::<T>()
                .map(Some)
                .map_err(|err| err.with_context(format!("variable '{}'", name))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> &BTreeMap<String, StateValue> {
        &self.variables
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<StateValue>) -> u64 {
        let name = name.into();
        self.version += 1;
        self.key_versions.insert(name.clone(), self.version);
        self.dirty.insert(name.clone());
        self.variables.insert(name, value.into());
        self.version
    }

    pub fn remove(&mut self, name: &str) -> Option<StateValue> {
        let removed = self.variables.remove(name)?;
        self.version += 1;
        self.key_versions.remove(name);
        self.dirty.insert(name.to_string());
        Some(removed)
    }

    /// Apply all overrides or none of them.
    ///
    /// The whole merge is one mutation: the version counter advances once and
    /// every merged key records that version.
    pub fn merge(&mut self, overrides: &[StateOverride]) -> Result<u64, AppError> {
        let conflicts: Vec<String> = overrides
            .iter()
            .filter_map(|item| {
                let expected = item.expected_version?;
                let actual = self.key_version(&item.name);
                (expected != actual).then(|| {
                    format!("{} (expected v{}, found v{})", item.name, expected, actual)
                })
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(AppError::new(
                ErrorCategory::MergeConflict,
                format!("merge rejected: {}", conflicts.join(", ")),
            )
            .with_code("GRF-STATE-001"));
        }
        if overrides.is_empty() {
            return Ok(self.version);
        }
        self.version += 1;
        for item in overrides {
            self.key_versions.insert(item.name.clone(), self.version);
            self.dirty.insert(item.name.clone());
            self.variables.insert(item.name.clone(), item.value.clone());
        }
        Ok(self.version)
    }

    /// Names written since the previous call, in sorted order.
    pub fn take_changes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            execution_id: self.execution_id.clone(),
            version: self.version,
            variables: self.variables.clone(),
            key_versions: self.key_versions.clone(),
        }
    }

    /// Copy of this state under a different execution id, used by nested runs.
    pub(crate) fn fork(&self, execution_id: impl Into<String>) -> Self {
        let mut forked = self.clone();
        forked.execution_id = execution_id.into();
        forked.dirty.clear();
        forked
    }
}

impl PartialEq for ExecutionState {
    fn eq(&self, other: &Self) -> bool {
        self.execution_id == other.execution_id
            && self.version == other.version
            && self.variables == other.variables
    }
}

impl StateSnapshot {
    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.variables.get(name)
    }

    pub fn diff(&self, other: &StateSnapshot) -> StateDiff {
        let mut diff = StateDiff::default();
        for (name, value) in &other.variables {
            match self.variables.get(name) {
                None => diff.added.push(name.clone()),
                Some(previous) if previous != value => diff.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in self.variables.keys() {
            if !other.variables.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }

    /// Copy of the variables with sensitive keys masked, for events and logs.
    pub fn redacted(&self, redact_keys: &[String]) -> BTreeMap<String, StateValue> {
        let mut variables = self.variables.clone();
        for (key, value) in variables.iter_mut() {
            if should_redact(key, redact_keys) {
                *value = StateValue::String("[REDACTED]".to_string());
            } else {
                redact_value(value, redact_keys);
            }
        }
        variables
    }
}

/// Redact sensitive keys in nested maps.
pub fn redact_value(value: &mut StateValue, redact_keys: &[String]) {
    match value {
        StateValue::Map(map) => {
            for (key, child) in map.iter_mut() {
                if should_redact(key, redact_keys) {
                    *child = StateValue::String("[REDACTED]".to_string());
                    continue;
                }
                redact_value(child, redact_keys);
            }
        }
        StateValue::List(items) => {
            for item in items {
                redact_value(item, redact_keys);
            }
        }
        _ => {}
    }
}

fn should_redact(key: &str, redact_keys: &[String]) -> bool {
    let key_lower = key.to_lowercase();
    redact_keys
        .iter()
        .any(|pattern| key_lower.contains(&pattern.to_lowercase()))
}

/// Compute the SHA-256 hash encoded as lowercase hex.
pub fn compute_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
