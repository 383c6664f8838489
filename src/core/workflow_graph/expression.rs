#![allow(clippy::result_large_err)] // Predicates surface AppError so evaluation failures keep their codes.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow_graph::state::ExecutionState;
use crate::core::workflow_graph::value::{OpaqueHandle, StateValue};
use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Expression evaluation engine using a locked-down Rhai configuration.
pub struct ExpressionEngine {
    engine: Engine,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        let mut engine = Engine::new_raw();
        engine.set_max_operations(50_000);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
        ExpressionEngine { engine }
    }
}

impl ExpressionEngine {
    /// Process-wide engine; configuration is read-only after construction.
    pub fn shared() -> &'static ExpressionEngine {
        static ENGINE: OnceLock<ExpressionEngine> = OnceLock::new();
        ENGINE.get_or_init(ExpressionEngine::default)
    }

    /// Compile the given expression string into an AST.
    pub fn compile(&self, expr: &str) -> Result<AST, AppError> {
        self.engine.compile_expression(expr).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("expression compile error in '{}': {}", expr, err),
            )
            .with_code("GRF-EXPR-001")
        })
    }

    /// Evaluate a compiled expression with every state variable in scope.
    ///
    /// Variables are visible by name when the name is a valid identifier and
    /// always through the `vars` map.
    pub fn evaluate(&self, ast: &AST, state: &ExecutionState) -> Result<StateValue, AppError> {
        let mut scope = Scope::new();
        let mut vars = Map::new();
        for (name, value) in state.variables() {
            let dynamic = to_dynamic(value);
            if is_identifier(name) {
                scope.push_dynamic(name.clone(), dynamic.clone());
            }
            vars.insert(name.as_str().into(), dynamic);
        }
        scope.push_dynamic("vars", Dynamic::from_map(vars));

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("expression execution error: {}", err),
                )
                .with_code("GRF-EXPR-002")
            })?;
        Ok(from_dynamic(result))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name != "vars" && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Source text plus its compiled form.
#[derive(Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Arc<AST>,
}

impl CompiledExpr {
    pub fn compile(source: impl Into<String>) -> Result<Self, AppError> {
        let source = source.into();
        let ast = ExpressionEngine::shared().compile(&source)?;
        Ok(Self {
            source,
            ast: Arc::new(ast),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, state: &ExecutionState) -> Result<StateValue, AppError> {
        ExpressionEngine::shared().evaluate(&self.ast, state)
    }
}

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledExpr({:?})", self.source)
    }
}

type PredicateFn = dyn Fn(&ExecutionState) -> Result<bool, AppError> + Send + Sync;

/// Boolean test over the execution state used by edges, loops and breakpoints.
#[derive(Clone)]
pub enum Predicate {
    Constant(bool),
    Expr(CompiledExpr),
    Native { label: String, test: Arc<PredicateFn> },
}

impl Predicate {
    pub fn expr(source: impl Into<String>) -> Result<Self, AppError> {
        CompiledExpr::compile(source).map(Predicate::Expr)
    }

    pub fn native<F>(label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&ExecutionState) -> Result<bool, AppError> + Send + Sync + 'static,
    {
        Predicate::Native {
            label: label.into(),
            test: Arc::new(test),
        }
    }

    /// Evaluate; a non-boolean expression result is a `TypeMismatch`.
    pub fn evaluate(&self, state: &ExecutionState) -> Result<bool, AppError> {
        match self {
            Predicate::Constant(flag) => Ok(*flag),
            Predicate::Native { test, .. } => test(state),
            Predicate::Expr(expr) => match expr.evaluate(state)? {
                StateValue::Bool(flag) => Ok(flag),
                other => Err(AppError::new(
                    ErrorCategory::TypeMismatch,
                    format!(
                        "expression '{}' returned {} instead of bool",
                        expr.source(),
                        other.kind()
                    ),
                )
                .with_code("GRF-EXPR-003")),
            },
        }
    }

    /// Stable text used for rendering and graph fingerprints.
    pub fn describe(&self) -> String {
        match self {
            Predicate::Constant(flag) => flag.to_string(),
            Predicate::Expr(expr) => expr.source().to_string(),
            Predicate::Native { label, .. } => format!("native:{}", label),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.describe())
    }
}

fn to_dynamic(value: &StateValue) -> Dynamic {
    match value {
        StateValue::Null => Dynamic::UNIT,
        StateValue::Bool(b) => Dynamic::from(*b),
        StateValue::Int(i) => Dynamic::from(*i),
        StateValue::Float(f) => Dynamic::from(*f),
        StateValue::String(s) => Dynamic::from(s.clone()),
        StateValue::List(items) => {
            let arr: Array = items.iter().map(to_dynamic).collect();
            Dynamic::from_array(arr)
        }
        StateValue::Map(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.as_str().into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
        StateValue::Opaque(handle) => Dynamic::from(handle.clone()),
    }
}

fn from_dynamic(value: Dynamic) -> StateValue {
    if value.is_unit() {
        return StateValue::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return StateValue::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return StateValue::Int(i);
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return StateValue::Float(f);
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return StateValue::String(s);
    }
    if let Some(handle) = value.clone().try_cast::<OpaqueHandle>() {
        return StateValue::Opaque(handle);
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return StateValue::List(arr.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        let converted: BTreeMap<String, StateValue> = map
            .into_iter()
            .map(|(key, value)| (key.to_string(), from_dynamic(value)))
            .collect();
        return StateValue::Map(converted);
    }
    StateValue::Null
}
