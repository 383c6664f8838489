#![allow(clippy::result_large_err)] // Graph validation returns AppError so every rule violation keeps its code.

use crate::core::error::AppError;
use crate::core::types::{ErrorCategory, ErrorClass};
use crate::core::workflow_graph::dot;
use crate::core::workflow_graph::expression::Predicate;
use crate::core::workflow_graph::node::{LoopSignal, Node, NodeKind, NodeResult};
use crate::core::workflow_graph::state::{compute_sha256_hex, ExecutionState};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Normal,
    /// Taken when a conditional node evaluated true.
    OnTrue,
    /// Taken when a conditional node evaluated false.
    OnFalse,
    /// Taken when a loop node starts another iteration.
    LoopBody,
    /// Taken when a loop node is exhausted.
    LoopExit,
    /// Routes a failure of the source node to an error handler.
    OnError,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Normal => "normal",
            EdgeKind::OnTrue => "on_true",
            EdgeKind::OnFalse => "on_false",
            EdgeKind::LoopBody => "loop_body",
            EdgeKind::LoopExit => "loop_exit",
            EdgeKind::OnError => "on_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    /// Absent means unconditional.
    pub condition: Option<Predicate>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Normal,
            condition: None,
        }
    }

    pub fn kind(mut self, kind: EdgeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn when(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn label(&self) -> String {
        match (&self.kind, &self.condition) {
            (EdgeKind::Normal, None) => String::new(),
            (EdgeKind::Normal, Some(condition)) => condition.describe(),
            (kind, None) => kind.as_str().to_string(),
            (kind, Some(condition)) => format!("{} [{}]", kind.as_str(), condition.describe()),
        }
    }

    /// Whether the edge kind matches the result of its source node.
    fn matches(&self, result: &NodeResult) -> bool {
        match (self.kind, result) {
            (EdgeKind::OnError, _) => false,
            (EdgeKind::OnTrue, NodeResult::Branch(flag)) => *flag,
            (EdgeKind::OnFalse, NodeResult::Branch(flag)) => !*flag,
            (EdgeKind::LoopBody, NodeResult::Loop(signal)) => *signal == LoopSignal::Continue,
            (EdgeKind::LoopExit, NodeResult::Loop(signal)) => *signal == LoopSignal::Exhausted,
            // A plain edge out of a loop is its exit.
            (EdgeKind::Normal, NodeResult::Loop(signal)) => *signal == LoopSignal::Exhausted,
            (EdgeKind::Normal, _) => true,
            _ => false,
        }
    }
}

/// Frozen workflow graph, shared read-only across runs.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    start: String,
    nodes: IndexMap<String, Node>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
    strict_edges: bool,
    fingerprint: String,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Lookup that turns a missing node into an error.
    pub fn require_node(&self, id: &str) -> Result<&Node, AppError> {
        self.nodes.get(id).ok_or_else(|| {
            AppError::new(
                ErrorCategory::NotFound,
                format!("node '{}' not found in graph '{}'", id, self.name),
            )
            .with_code("GRF-GRAPH-010")
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of `id` in declaration order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |index| &self.edges[*index])
    }

    pub fn error_edge(&self, id: &str) -> Option<&Edge> {
        self.outgoing(id).find(|edge| edge.kind == EdgeKind::OnError)
    }

    pub fn strict_edges(&self) -> bool {
        self.strict_edges
    }

    /// SHA-256 over the graph structure; checkpoints carry it to detect graph changes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Pick the next node after `from` produced `result`.
    ///
    /// Edges are evaluated in declaration order and the first qualifying one
    /// wins. With `strict_edges`, two conditional edges being true at once is
    /// `EdgeResolutionAmbiguous`. `None` means the node is a sink.
    pub fn resolve_next(
        &self,
        from: &str,
        result: &NodeResult,
        state: &ExecutionState,
    ) -> Result<Option<&Edge>, AppError> {
        let mut chosen: Option<&Edge> = None;
        let mut conditional_hits: Vec<&str> = Vec::new();
        for edge in self.outgoing(from) {
            if !edge.matches(result) {
                continue;
            }
            let qualifies = match &edge.condition {
                None => true,
                Some(condition) => {
                    let hit = condition.evaluate(state).map_err(|err| {
                        err.with_node(from)
                            .with_context(format!("edge {} -> {}", edge.from, edge.to))
                    })?;
                    if hit {
                        conditional_hits.push(edge.to.as_str());
                    }
                    hit
                }
            };
            if qualifies && chosen.is_none() {
                chosen = Some(edge);
                if !self.strict_edges {
                    break;
                }
            }
        }
        if self.strict_edges && conditional_hits.len() > 1 {
            return Err(AppError::new(
                ErrorCategory::EdgeResolutionAmbiguous,
                format!(
                    "node {} has {} true conditional edges: {}",
                    from,
                    conditional_hits.len(),
                    conditional_hits.join(", ")
                ),
            )
            .with_code("GRF-EDGE-001")
            .with_node(from));
        }
        Ok(chosen)
    }

    fn compute_fingerprint(&self) -> String {
        let mut canonical = String::new();
        let _ = writeln!(canonical, "graph {} start {}", self.name, self.start);
        for node in self.nodes.values() {
            let _ = write!(canonical, "node {} {}", node.id, node.kind_label());
            match &node.kind {
                NodeKind::Function(function) => {
                    let _ = write!(canonical, " {}", function.callable);
                    for binding in &function.outputs {
                        let _ = write!(canonical, " {}={}", binding.output, binding.variable);
                    }
                }
                NodeKind::Conditional(conditional) => {
                    let _ = write!(canonical, " {}", conditional.predicate.describe());
                }
                NodeKind::Loop(loop_node) => {
                    let _ = write!(canonical, " max={}", loop_node.max_iterations);
                }
                NodeKind::ErrorHandler(handler) => {
                    let _ = write!(
                        canonical,
                        " retries={} fallback={:?}",
                        handler.max_retries, handler.fallback
                    );
                }
                NodeKind::Subgraph(subgraph) => {
                    let _ = write!(canonical, " {}", subgraph.graph.fingerprint());
                }
            }
            canonical.push('\n');
        }
        for edge in &self.edges {
            let _ = writeln!(
                canonical,
                "edge {} {} {} {}",
                edge.from,
                edge.to,
                edge.kind.as_str(),
                edge.condition
                    .as_ref()
                    .map(|condition| condition.describe())
                    .unwrap_or_default()
            );
        }
        compute_sha256_hex(canonical.as_bytes())
    }
}

/// Incremental graph construction; `build` validates and freezes.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    name: String,
    start: Option<String>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    strict_edges: bool,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Defaults to the first node added.
    pub fn start(mut self, id: impl Into<String>) -> Self {
        self.start = Some(id.into());
        self
    }

    pub fn strict_edges(mut self, strict: bool) -> Self {
        self.strict_edges = strict;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn connect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(Edge::new(from, to))
    }

    pub fn connect_when(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Predicate,
    ) -> Self {
        self.edge(Edge::new(from, to).when(condition))
    }

    pub fn connect_kind(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: EdgeKind,
    ) -> Self {
        self.edge(Edge::new(from, to).kind(kind))
    }

    pub fn on_error(self, from: impl Into<String>, handler: impl Into<String>) -> Self {
        self.connect_kind(from, handler, EdgeKind::OnError)
    }

    pub fn build(self) -> Result<Graph, AppError> {
        let mut problems: Vec<String> = Vec::new();
        let mut nodes: IndexMap<String, Node> = IndexMap::new();
        for node in self.nodes {
            if node.id.trim().is_empty() {
                problems.push("node id must not be empty".to_string());
                continue;
            }
            if nodes.contains_key(&node.id) {
                problems.push(format!("duplicate node id '{}'", node.id));
                continue;
            }
            nodes.insert(node.id.clone(), node);
        }

        let start = match self.start.or_else(|| nodes.keys().next().cloned()) {
            Some(start) => start,
            None => {
                return Err(validation_error(
                    &self.name,
                    vec!["graph has no nodes".to_string()],
                ))
            }
        };
        if !nodes.contains_key(&start) {
            problems.push(format!("start node '{}' does not exist", start));
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, edge) in self.edges.iter().enumerate() {
            let (Some(source), Some(target)) = (nodes.get(&edge.from), nodes.get(&edge.to)) else {
                for endpoint in [&edge.from, &edge.to] {
                    if !nodes.contains_key(endpoint) {
                        problems.push(format!(
                            "edge {} -> {} references unknown node '{}'",
                            edge.from, edge.to, endpoint
                        ));
                    }
                }
                continue;
            };
            match edge.kind {
                EdgeKind::OnTrue | EdgeKind::OnFalse
                    if !matches!(source.kind, NodeKind::Conditional(_)) =>
                {
                    problems.push(format!(
                        "{} edge from non-conditional node '{}'",
                        edge.kind.as_str(),
                        edge.from
                    ));
                }
                EdgeKind::LoopBody | EdgeKind::LoopExit
                    if !matches!(source.kind, NodeKind::Loop(_)) =>
                {
                    problems.push(format!(
                        "{} edge from non-loop node '{}'",
                        edge.kind.as_str(),
                        edge.from
                    ));
                }
                EdgeKind::OnError => {
                    if !matches!(target.kind, NodeKind::ErrorHandler(_)) {
                        problems.push(format!(
                            "error edge from '{}' must target an error handler, '{}' is {}",
                            edge.from,
                            edge.to,
                            target.kind_label()
                        ));
                    }
                    if edge.condition.is_some() {
                        problems.push(format!("error edge from '{}' cannot be conditional", edge.from));
                    }
                }
                _ => {}
            }
            outgoing.entry(edge.from.clone()).or_default().push(index);
        }

        for (id, indexes) in &outgoing {
            let error_edges = indexes
                .iter()
                .filter(|index| self.edges[**index].kind == EdgeKind::OnError)
                .count();
            if error_edges > 1 {
                problems.push(format!("node '{}' has {} error edges", id, error_edges));
            }
        }

        // A handler's plain outgoing edge doubles as its fallback route.
        let mut fallbacks: Vec<(String, String)> = Vec::new();
        for node in nodes.values() {
            match &node.kind {
                NodeKind::Loop(loop_node) => {
                    if loop_node.max_iterations == 0 {
                        problems.push(format!("loop '{}' must allow at least one iteration", node.id));
                    }
                    let has_body = outgoing.get(&node.id).is_some_and(|indexes| {
                        indexes
                            .iter()
                            .any(|index| self.edges[*index].kind == EdgeKind::LoopBody)
                    });
                    if !has_body {
                        problems.push(format!("loop '{}' has no loop_body edge", node.id));
                    }
                }
                NodeKind::ErrorHandler(handler) => {
                    if handler.retry_on.contains(&ErrorClass::Fatal) {
                        tracing::warn!(
                            node_id = %node.id,
                            "error handler lists fatal in retry_on; fatal errors are never retried"
                        );
                    }
                    match &handler.fallback {
                        Some(target) if !nodes.contains_key(target) => problems.push(format!(
                            "error handler '{}' falls back to unknown node '{}'",
                            node.id, target
                        )),
                        Some(_) => {}
                        None => {
                            let plain = outgoing.get(&node.id).and_then(|indexes| {
                                indexes
                                    .iter()
                                    .map(|index| &self.edges[*index])
                                    .find(|edge| edge.kind == EdgeKind::Normal)
                            });
                            if let Some(edge) = plain {
                                fallbacks.push((node.id.clone(), edge.to.clone()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        for (handler_id, target) in fallbacks {
            if let Some(NodeKind::ErrorHandler(handler)) =
                nodes.get_mut(&handler_id).map(|node| &mut node.kind)
            {
                handler.fallback = Some(target);
            }
        }

        if !problems.is_empty() {
            return Err(validation_error(&self.name, problems));
        }

        let mut graph = Graph {
            name: self.name,
            start,
            nodes,
            edges: self.edges,
            outgoing,
            strict_edges: self.strict_edges,
            fingerprint: String::new(),
        };
        graph.fingerprint = graph.compute_fingerprint();

        let unreachable = dot::unreachable_nodes(&graph);
        if !unreachable.is_empty() {
            tracing::warn!(
                graph = %graph.name,
                nodes = ?unreachable,
                "graph contains nodes unreachable from the start node"
            );
        }
        Ok(graph)
    }
}

fn validation_error(name: &str, problems: Vec<String>) -> AppError {
    AppError::new(
        ErrorCategory::ValidationError,
        format!("graph '{}' is invalid: {}", name, problems.join("; ")),
    )
    .with_code("GRF-GRAPH-001")
}
