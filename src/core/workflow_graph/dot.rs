use crate::core::workflow_graph::graph::{EdgeKind, Graph};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Node weight carrying display information.
struct NodeLabel {
    id: String,
    kind: &'static str,
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\n{}", self.id, self.kind)
    }
}

/// Edge weight carrying a formatted edge label.
struct EdgeLabel {
    label: String,
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

fn build_graph(graph: &Graph) -> (DiGraph<NodeLabel, EdgeLabel>, HashMap<String, NodeIndex>) {
    let mut projected = DiGraph::new();
    let mut node_map: HashMap<String, NodeIndex> = HashMap::new();

    for node in graph.nodes() {
        let idx = projected.add_node(NodeLabel {
            id: node.id.clone(),
            kind: node.kind_label(),
        });
        node_map.insert(node.id.clone(), idx);
    }

    for edge in graph.edges() {
        if let (Some(&from), Some(&to)) = (node_map.get(&edge.from), node_map.get(&edge.to)) {
            projected.add_edge(
                from,
                to,
                EdgeLabel {
                    label: escape_label(&truncate(&edge.label(), 80)),
                },
            );
        }
    }

    (projected, node_map)
}

/// Render the graph as a Graphviz DOT string using petgraph.
pub fn graph_to_dot(graph: &Graph) -> String {
    let (projected, _) = build_graph(graph);
    format!("{}", Dot::new(&projected))
}

/// Render the graph as a Mermaid flowchart.
pub fn graph_to_mermaid(graph: &Graph) -> String {
    let mut out = String::from("flowchart TD\n");
    for node in graph.nodes() {
        let id = mermaid_id(&node.id);
        let text = format!("{}<br/>{}", node.name, node.kind_label());
        let shape = match node.kind_label() {
            "conditional" => format!("{}{{\"{}\"}}", id, text),
            "while" | "for_each" => format!("{}((\"{}\"))", id, text),
            "error_handler" => format!("{}[/\"{}\"/]", id, text),
            "subgraph" => format!("{}[[\"{}\"]]", id, text),
            _ => format!("{}[\"{}\"]", id, text),
        };
        out.push_str("    ");
        out.push_str(&shape);
        out.push('\n');
    }
    for edge in graph.edges() {
        let arrow = if edge.kind == EdgeKind::OnError { "-.->" } else { "-->" };
        let label = edge.label();
        out.push_str("    ");
        out.push_str(&mermaid_id(&edge.from));
        out.push(' ');
        out.push_str(arrow);
        if !label.is_empty() {
            out.push_str(&format!("|\"{}\"|", truncate(&label, 60).replace('"', "'")));
        }
        out.push(' ');
        out.push_str(&mermaid_id(&edge.to));
        out.push('\n');
    }
    out
}

/// Returns the ids of nodes not reachable from the start node.
///
/// Error edges and handler fallbacks count as reachable paths.
pub fn unreachable_nodes(graph: &Graph) -> Vec<String> {
    let (mut projected, node_map) = build_graph(graph);
    for node in graph.nodes() {
        if let crate::core::workflow_graph::node::NodeKind::ErrorHandler(handler) = &node.kind {
            if let Some(target) = &handler.fallback {
                if let (Some(&from), Some(&to)) = (node_map.get(&node.id), node_map.get(target)) {
                    projected.add_edge(
                        from,
                        to,
                        EdgeLabel {
                            label: "fallback".to_string(),
                        },
                    );
                }
            }
        }
    }
    let start = match node_map.get(graph.start()) {
        Some(&n) => n,
        None => return Vec::new(),
    };

    let mut reachable = HashSet::new();
    let mut bfs = Bfs::new(&projected, start);
    while let Some(nx) = bfs.next(&projected) {
        reachable.insert(nx);
    }

    let mut unreachable: Vec<String> = node_map
        .iter()
        .filter(|(_, &nx)| !reachable.contains(&nx))
        .map(|(id, _)| id.clone())
        .collect();
    unreachable.sort();
    unreachable
}

fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        let cut: String = value.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\"', "\\\"")
}
