#![allow(clippy::result_large_err)] // Secret resolution surfaces AppError so missing secrets carry codes.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::value::StateValue;
use async_trait::async_trait;
use std::collections::HashMap;

const PLACEHOLDER_OPEN: &str = "${secret:";

/// Resolves credential placeholders for function inputs.
#[async_trait]
pub trait SecretResolver: Send + Sync + 'static {
    /// Returns `NotFound` when the secret does not exist.
    async fn resolve(&self, name: &str) -> Result<String, AppError>;
}

fn not_found(name: &str) -> AppError {
    AppError::new(
        ErrorCategory::NotFound,
        format!("secret '{}' could not be resolved", name),
    )
    .with_code("GRF-SECRET-001")
}

/// Fixed in-memory secrets, mostly for tests and embedding.
#[derive(Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(&self, name: &str) -> Result<String, AppError> {
        self.values.get(name).cloned().ok_or_else(|| not_found(name))
    }
}

/// Reads `<prefix><NAME>` from the process environment.
#[derive(Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new("GRAPHFLOW_SECRET_")
    }
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretResolver for EnvSecrets {
    async fn resolve(&self, name: &str) -> Result<String, AppError> {
        std::env::var(format!("{}{}", self.prefix, name)).map_err(|_| not_found(name))
    }
}

/// Names referenced by `${secret:NAME}` placeholders in `text`.
pub fn placeholder_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        match after.find('}') {
            Some(end) => {
                names.push(after[..end].trim().to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Secret values resolved for one invocation, so they can be scrubbed from
/// whatever the callable hands back.
#[derive(Debug, Default)]
pub struct SecretMask {
    resolved: Vec<(String, String)>,
}

impl SecretMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    fn record(&mut self, name: &str, value: &str) {
        if value.is_empty() || self.resolved.iter().any(|(_, known)| known == value) {
            return;
        }
        self.resolved.push((name.to_string(), value.to_string()));
        // Longest first so a secret containing another is replaced whole.
        self.resolved.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    }

    /// Swap resolved secret values back to their `${secret:NAME}` placeholders.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in &self.resolved {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), &format!("{}{}}}", PLACEHOLDER_OPEN, name));
            }
        }
        out
    }

    pub fn scrub(&self, value: &StateValue) -> StateValue {
        if self.is_empty() {
            return value.clone();
        }
        match value {
            StateValue::String(text) => StateValue::String(self.scrub_text(text)),
            StateValue::List(items) => StateValue::List(items.iter().map(|item| self.scrub(item)).collect()),
            StateValue::Map(map) => StateValue::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.scrub(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn scrub_error(&self, mut error: AppError) -> AppError {
        if !self.is_empty() {
            error.message = self.scrub_text(&error.message);
            for value in error.context.values_mut() {
                *value = self.scrub_text(value);
            }
        }
        error
    }
}

/// Replace every placeholder inside strings, recursing into lists and maps.
pub async fn resolve_placeholders(
    value: &StateValue,
    resolver: &dyn SecretResolver,
) -> Result<StateValue, AppError> {
    resolve_masked(value, resolver, &mut SecretMask::new()).await
}

/// Like [`resolve_placeholders`], recording every resolved value in `mask`.
pub async fn resolve_masked(
    value: &StateValue,
    resolver: &dyn SecretResolver,
    mask: &mut SecretMask,
) -> Result<StateValue, AppError> {
    match value {
        StateValue::String(text) => Ok(StateValue::String(resolve_text(text, resolver, mask).await?)),
        StateValue::List(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(Box::pin(resolve_masked(item, resolver, &mut *mask)).await?);
            }
            Ok(StateValue::List(resolved))
        }
        StateValue::Map(map) => {
            let mut resolved = std::collections::BTreeMap::new();
            for (key, item) in map {
                resolved.insert(
                    key.clone(),
                    Box::pin(resolve_masked(item, resolver, &mut *mask)).await?,
                );
            }
            Ok(StateValue::Map(resolved))
        }
        other => Ok(other.clone()),
    }
}

async fn resolve_text(
    text: &str,
    resolver: &dyn SecretResolver,
    mask: &mut SecretMask,
) -> Result<String, AppError> {
    if !text.contains(PLACEHOLDER_OPEN) {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find('}') else {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "unterminated secret placeholder",
            )
            .with_code("GRF-SECRET-002"));
        };
        let name = after[..end].trim();
        let value = resolver.resolve(name).await?;
        mask.record(name, &value);
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
