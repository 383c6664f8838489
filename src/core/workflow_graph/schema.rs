#![allow(clippy::result_large_err)] // Graph document APIs return AppError to preserve structured validation context without boxing.

use crate::core::config::parse_duration;
use crate::core::error::AppError;
use crate::core::types::{ErrorCategory, ErrorClass};
use crate::core::workflow_graph::callable::CallableRegistry;
use crate::core::workflow_graph::executor::RunOptions;
use crate::core::workflow_graph::expression::Predicate;
use crate::core::workflow_graph::graph::{Edge, EdgeKind, Graph, GraphBuilder};
use crate::core::workflow_graph::node::{
    Backoff, ConditionalNode, ErrorHandlerNode, FunctionNode, InputBinding, IsolationMode,
    LoopNode, Node, NodeKind, OutputBinding, SubgraphNode,
};
use crate::core::workflow_graph::value::StateValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SUPPORTED_VERSION: &str = "1";
/// Subgraph files may reference further files; deeper chains are rejected.
const MAX_SUBGRAPH_DEPTH: usize = 16;

fn default_version() -> String {
    SUPPORTED_VERSION.to_string()
}

fn default_max_iterations() -> u32 {
    100
}

fn default_index_var() -> String {
    "index".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_on() -> Vec<ErrorClass> {
    vec![ErrorClass::Transient, ErrorClass::External, ErrorClass::Timeout]
}

/// Root document for a workflow graph definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphDocument {
    #[serde(default = "default_version")]
    pub version: String,
    pub graph: GraphDefinition,
}

/// Nodes, edges and run settings of one graph.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to the first node.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub strict_edges: bool,
    /// Initial variables for runs started from this document.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub settings: GraphSettings,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// Per-graph overrides of the engine run limits.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GraphSettings {
    #[serde(default)]
    pub max_total_steps: Option<u64>,
    /// e.g. "30s"
    #[serde(default)]
    pub max_time: Option<String>,
    /// Nodes before which a checkpoint is saved.
    #[serde(default)]
    pub checkpoint_at: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKindDefinition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKindDefinition {
    Function {
        callable: String,
        #[serde(default)]
        params: BTreeMap<String, Value>,
        /// Callable parameter -> state variable.
        #[serde(default)]
        inputs: IndexMap<String, InputDefinition>,
        /// Callable output -> state variable.
        #[serde(default)]
        outputs: IndexMap<String, String>,
        #[serde(default)]
        timeout: Option<String>,
    },
    Conditional {
        condition: Condition,
    },
    While {
        condition: Condition,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    ForEach {
        collection: String,
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    ErrorHandler {
        #[serde(default = "default_retry_on")]
        retry_on: Vec<ErrorClass>,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default)]
        backoff: Option<BackoffDefinition>,
        #[serde(default)]
        fallback: Option<String>,
        #[serde(default)]
        error_variable: Option<String>,
    },
    Subgraph {
        isolation: IsolationDefinition,
        /// Parent variable -> child variable.
        #[serde(default)]
        inputs: IndexMap<String, String>,
        /// Child variable -> parent variable.
        #[serde(default)]
        outputs: IndexMap<String, String>,
        #[serde(default)]
        graph: Option<Box<GraphDefinition>>,
        /// Document path, relative to the including file.
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

/// Either a bare variable name or a binding with an explicit `required` flag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InputDefinition {
    Variable(String),
    Binding {
        variable: String,
        #[serde(default = "default_required")]
        required: bool,
    },
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffDefinition {
    pub base: String,
    pub ceiling: String,
    #[serde(default)]
    pub jitter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationDefinition {
    Shared,
    Isolated,
    Scoped(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub when: Option<Condition>,
}

/// Condition used to guard edges, loops and conditional nodes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Condition {
    Expr {
        #[serde(rename = "$expr")]
        expr: String,
    },
    Bool(bool),
}

impl Condition {
    pub fn expression(&self) -> Option<&str> {
        match self {
            Condition::Expr { expr } => Some(expr.as_str()),
            Condition::Bool(_) => None,
        }
    }

    fn to_predicate(&self) -> Result<Predicate, AppError> {
        match self {
            Condition::Expr { expr } => Predicate::expr(expr.clone()),
            Condition::Bool(flag) => Ok(Predicate::Constant(*flag)),
        }
    }
}

/// A built graph together with the document-level defaults.
#[derive(Debug, Clone)]
pub struct LoadedGraph {
    pub graph: Arc<Graph>,
    pub variables: Vec<(String, StateValue)>,
    pub settings: GraphSettings,
}

impl LoadedGraph {
    /// Apply the document's settings on top of engine-level run options.
    pub fn run_options(&self, mut options: RunOptions) -> Result<RunOptions, AppError> {
        if let Some(steps) = self.settings.max_total_steps {
            options.limits.max_total_steps = Some(steps);
        }
        if let Some(max_time) = &self.settings.max_time {
            options.limits.max_time = Some(parse_duration("settings.max_time", max_time)?);
        }
        options
            .checkpoint
            .at_nodes
            .extend(self.settings.checkpoint_at.iter().cloned());
        Ok(options)
    }

    /// Check that every function node (subgraphs included) names a
    /// registered callable with acceptable params.
    pub fn check_callables(&self, registry: &CallableRegistry) -> Result<(), AppError> {
        check_graph_callables(&self.graph, registry)
    }
}

fn check_graph_callables(graph: &Graph, registry: &CallableRegistry) -> Result<(), AppError> {
    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Function(function) => {
                let callable = registry.get(&function.callable).ok_or_else(|| {
                    AppError::new(
                        ErrorCategory::ValidationError,
                        format!(
                            "node '{}' references unknown callable '{}'",
                            node.id, function.callable
                        ),
                    )
                    .with_code("GRF-SCHEMA-004")
                    .with_node(&node.id)
                })?;
                callable
                    .validate_params(&function.params)
                    .map_err(|err| err.with_node(&node.id))?;
            }
            NodeKind::Subgraph(subgraph) => check_graph_callables(&subgraph.graph, registry)?,
            _ => {}
        }
    }
    Ok(())
}

impl GraphDocument {
    /// Load and validate a graph document from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read {}: {}", path.display(), err),
            )
            .with_code("GRF-SCHEMA-001")
        })?;
        Self::parse(&text).map_err(|err| err.with_context(format!("file {}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, AppError> {
        let doc: GraphDocument = serde_yaml::from_str(text).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("failed to parse graph document: {}", err),
            )
            .with_code("GRF-SCHEMA-002")
        })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Document-level checks; structural graph rules run when the graph is built.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.version != SUPPORTED_VERSION {
            return Err(schema_error(format!(
                "unsupported graph document version {}, expected {}",
                self.version, SUPPORTED_VERSION
            )));
        }
        self.graph.validate()
    }

    /// Build the graph; `base_dir` resolves subgraph `file` references.
    pub fn build(&self, base_dir: Option<&Path>) -> Result<LoadedGraph, AppError> {
        let graph = self.graph.build(base_dir, 0)?;
        let variables = self
            .graph
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), StateValue::from_json(value)))
            .collect();
        Ok(LoadedGraph {
            graph: Arc::new(graph),
            variables,
            settings: self.graph.settings.clone(),
        })
    }
}

impl GraphDefinition {
    fn validate(&self) -> Result<(), AppError> {
        if self.nodes.is_empty() {
            return Err(schema_error(format!(
                "graph '{}' must define at least one node",
                self.name
            )));
        }
        if let Some(max_time) = &self.settings.max_time {
            parse_duration("settings.max_time", max_time)?;
        }
        for node in &self.nodes {
            if let NodeKindDefinition::Subgraph { graph, file, .. } = &node.kind {
                match (graph, file) {
                    (Some(inline), None) => inline.validate()?,
                    (None, Some(_)) => {}
                    _ => {
                        return Err(schema_error(format!(
                            "subgraph node '{}' needs exactly one of 'graph' or 'file'",
                            node.id
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn build(&self, base_dir: Option<&Path>, depth: usize) -> Result<Graph, AppError> {
        if depth > MAX_SUBGRAPH_DEPTH {
            return Err(schema_error(format!(
                "graph '{}' nests subgraphs deeper than {}",
                self.name, MAX_SUBGRAPH_DEPTH
            )));
        }
        let mut builder = GraphBuilder::new(self.name.clone()).strict_edges(self.strict_edges);
        if let Some(start) = &self.start {
            builder = builder.start(start.clone());
        }
        for node in &self.nodes {
            builder = builder.node(node.build(base_dir, depth)?);
        }
        for edge in &self.edges {
            let mut built = Edge::new(edge.from.clone(), edge.to.clone()).kind(edge.kind);
            if let Some(condition) = &edge.when {
                built = built.when(condition.to_predicate().map_err(|err| {
                    err.with_context(format!("edge {} -> {}", edge.from, edge.to))
                })?);
            }
            builder = builder.edge(built);
        }
        builder.build()
    }
}

impl NodeDefinition {
    fn build(&self, base_dir: Option<&Path>, depth: usize) -> Result<Node, AppError> {
        let kind = self
            .kind
            .build(&self.id, base_dir, depth)
            .map_err(|err| err.with_node(&self.id))?;
        let node = Node::new(self.id.clone(), kind);
        Ok(match &self.name {
            Some(name) => node.named(name.clone()),
            None => node,
        })
    }
}

impl NodeKindDefinition {
    fn build(&self, id: &str, base_dir: Option<&Path>, depth: usize) -> Result<NodeKind, AppError> {
        Ok(match self {
            NodeKindDefinition::Function {
                callable,
                params,
                inputs,
                outputs,
                timeout,
            } => {
                let mut function = FunctionNode::new(callable.clone());
                function.params = params
                    .iter()
                    .map(|(name, value)| (name.clone(), StateValue::from_json(value)))
                    .collect();
                function.inputs = inputs
                    .iter()
                    .map(|(param, input)| match input {
                        InputDefinition::Variable(variable) => InputBinding::new(param, variable),
                        InputDefinition::Binding { variable, required } => InputBinding {
                            param: param.clone(),
                            variable: variable.clone(),
                            required: *required,
                        },
                    })
                    .collect();
                function.outputs = outputs
                    .iter()
                    .map(|(output, variable)| OutputBinding::new(output, variable))
                    .collect();
                function.timeout = timeout
                    .as_deref()
                    .map(|value| parse_duration("timeout", value))
                    .transpose()?;
                NodeKind::Function(function)
            }
            NodeKindDefinition::Conditional { condition } => {
                NodeKind::Conditional(ConditionalNode::new(condition.to_predicate()?))
            }
            NodeKindDefinition::While {
                condition,
                max_iterations,
            } => NodeKind::Loop(LoopNode::while_loop(
                condition.to_predicate()?,
                *max_iterations,
            )),
            NodeKindDefinition::ForEach {
                collection,
                item_var,
                index_var,
                max_iterations,
            } => NodeKind::Loop(LoopNode::for_each(
                collection.clone(),
                item_var.clone(),
                index_var.clone(),
                *max_iterations,
            )),
            NodeKindDefinition::ErrorHandler {
                retry_on,
                max_retries,
                backoff,
                fallback,
                error_variable,
            } => {
                let backoff = match backoff {
                    Some(definition) => definition.build()?,
                    None => Backoff::default(),
                };
                NodeKind::ErrorHandler(ErrorHandlerNode {
                    retry_on: retry_on.clone(),
                    max_retries: *max_retries,
                    backoff,
                    fallback: fallback.clone(),
                    error_variable: error_variable.clone(),
                })
            }
            NodeKindDefinition::Subgraph {
                isolation,
                inputs,
                outputs,
                graph,
                file,
            } => {
                let child = match (graph, file) {
                    (Some(inline), _) => inline.build(base_dir, depth + 1)?,
                    (None, Some(file)) => {
                        let path = match base_dir {
                            Some(dir) => dir.join(file),
                            None => file.clone(),
                        };
                        let doc = GraphDocument::load_from_file(&path)?;
                        doc.graph.build(path.parent(), depth + 1)?
                    }
                    (None, None) => {
                        return Err(schema_error(format!(
                            "subgraph node '{}' has no graph",
                            id
                        )))
                    }
                };
                let isolation = match isolation {
                    IsolationDefinition::Shared => IsolationMode::Shared,
                    IsolationDefinition::Isolated => IsolationMode::Isolated,
                    IsolationDefinition::Scoped(prefix) => IsolationMode::Scoped {
                        prefix: prefix.clone(),
                    },
                };
                let mut subgraph = SubgraphNode::new(Arc::new(child), isolation);
                for (parent, child) in inputs {
                    subgraph = subgraph.input(parent, child);
                }
                for (child, parent) in outputs {
                    subgraph = subgraph.output(child, parent);
                }
                NodeKind::Subgraph(subgraph)
            }
        })
    }
}

impl BackoffDefinition {
    fn build(&self) -> Result<Backoff, AppError> {
        let base = parse_duration("backoff.base", &self.base)?;
        let ceiling = parse_duration("backoff.ceiling", &self.ceiling)?;
        if ceiling < base {
            return Err(schema_error(format!(
                "backoff ceiling {} is below base {}",
                self.ceiling, self.base
            )));
        }
        let mut backoff = Backoff::new(base, ceiling);
        if let Some(jitter) = &self.jitter {
            backoff = backoff.with_jitter(parse_duration("backoff.jitter", jitter)?);
        }
        Ok(backoff)
    }
}

fn schema_error(message: String) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("GRF-SCHEMA-003")
}

/// Load, validate and build the graph in `path`.
pub fn load_graph(path: &Path) -> Result<LoadedGraph, AppError> {
    let doc = GraphDocument::load_from_file(path)?;
    doc.build(path.parent())
}

/// Parse and build a graph from YAML text; subgraph files resolve against the working directory.
pub fn parse_graph(text: &str) -> Result<LoadedGraph, AppError> {
    GraphDocument::parse(text)?.build(None)
}
