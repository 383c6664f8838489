use graphflow::core::types::ErrorCategory;
use graphflow::core::workflow_graph::{
    dot::{graph_to_dot, graph_to_mermaid, unreachable_nodes},
    executor::{RunOptions, Scheduler, Services},
    node::{IsolationMode, NodeKind},
    schema::{load_graph, parse_graph, GraphDocument},
    state::ExecutionState,
    value::StateValue,
    CallableRegistry,
};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REVIEW_GRAPH: &str = r#"
version: "1"
graph:
  name: review
  description: route a scored document
  variables:
    score: 90
  settings:
    max_total_steps: 50
    max_time: 30s
    checkpoint_at: [approve]
  nodes:
    - id: score
      type: function
      callable: set
      inputs:
        score: score
      outputs:
        score: score
    - id: gate
      type: conditional
      condition: { $expr: "score > 80" }
    - id: approve
      type: function
      callable: set
      params:
        decision: approved
      outputs:
        decision: decision
    - id: reject
      type: function
      callable: set
      params:
        decision: rejected
      outputs:
        decision: decision
  edges:
    - { from: score, to: gate }
    - { from: gate, to: approve, kind: on_true }
    - { from: gate, to: reject, kind: on_false }
"#;

#[test]
fn test_parse_minimal_document() {
    let loaded = parse_graph(REVIEW_GRAPH).unwrap();
    assert_eq!(loaded.graph.name(), "review");
    assert_eq!(loaded.graph.start(), "score");
    assert_eq!(loaded.graph.node_count(), 4);
    assert_eq!(loaded.graph.edges().len(), 3);
    assert_eq!(
        loaded.variables,
        vec![("score".to_string(), StateValue::Int(90))]
    );
    assert!(loaded.check_callables(&CallableRegistry::with_builtins()).is_ok());
}

#[test]
fn test_settings_become_run_options() {
    let loaded = parse_graph(REVIEW_GRAPH).unwrap();
    let options = loaded.run_options(RunOptions::default()).unwrap();
    assert_eq!(options.limits.max_total_steps, Some(50));
    assert_eq!(options.limits.max_time, Some(Duration::from_secs(30)));
    assert!(options.checkpoint.at_nodes.contains("approve"));
}

#[tokio::test]
async fn test_parsed_graph_runs() {
    let loaded = parse_graph(REVIEW_GRAPH).unwrap();
    let scheduler = Scheduler::new(loaded.graph.clone(), Services::default());
    let state = ExecutionState::with_variables("exec-parse", loaded.variables.clone());
    let report = scheduler.run(state, CancellationToken::new()).await;

    assert!(report.outcome.is_completed());
    assert_eq!(report.path, vec!["score", "gate", "approve"]);
    assert_eq!(
        report.final_state.get("decision"),
        Some(&StateValue::from("approved"))
    );
}

#[test]
fn test_unknown_node_type_is_a_parse_error() {
    let yaml = r#"
graph:
  name: g
  nodes:
    - id: a
      type: teleport
"#;
    let err = GraphDocument::parse(yaml).unwrap_err();
    assert_eq!(err.code, "GRF-SCHEMA-002");
}

#[test]
fn test_empty_graph_is_rejected() {
    let err = GraphDocument::parse("graph: { name: empty, nodes: [] }").unwrap_err();
    assert_eq!(err.code, "GRF-SCHEMA-003");
    assert!(err.message.contains("at least one node"));
}

#[test]
fn test_edge_to_unknown_node_is_rejected() {
    let yaml = r#"
graph:
  name: dangling
  nodes:
    - { id: a, type: function, callable: noop }
  edges:
    - { from: a, to: ghost }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert_eq!(err.category, ErrorCategory::ValidationError);
    assert_eq!(err.code, "GRF-GRAPH-001");
    assert!(err.message.contains("ghost"));
}

#[test]
fn test_duplicate_node_ids_are_rejected() {
    let yaml = r#"
graph:
  name: dupes
  nodes:
    - { id: a, type: function, callable: noop }
    - { id: a, type: function, callable: noop }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert!(err.message.contains("duplicate node id 'a'"));
}

#[test]
fn test_branch_edges_need_a_conditional_source() {
    let yaml = r#"
graph:
  name: bad-branch
  nodes:
    - { id: a, type: function, callable: noop }
    - { id: b, type: function, callable: noop }
  edges:
    - { from: a, to: b, kind: on_true }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert!(err.message.contains("non-conditional"));
}

#[test]
fn test_error_edge_must_target_handler() {
    let yaml = r#"
graph:
  name: bad-error-edge
  nodes:
    - { id: a, type: function, callable: noop }
    - { id: b, type: function, callable: noop }
  edges:
    - { from: a, to: b, kind: on_error }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert!(err.message.contains("must target an error handler"));
}

#[test]
fn test_loop_without_body_is_rejected() {
    let yaml = r#"
graph:
  name: no-body
  nodes:
    - id: loop
      type: while
      condition: true
    - { id: after, type: function, callable: noop }
  edges:
    - { from: loop, to: after, kind: loop_exit }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert!(err.message.contains("no loop_body edge"));
}

#[test]
fn test_invalid_expression_is_reported_with_edge() {
    let yaml = r#"
graph:
  name: bad-expr
  nodes:
    - { id: a, type: function, callable: noop }
    - { id: b, type: function, callable: noop }
  edges:
    - { from: a, to: b, when: { $expr: "score >" } }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert_eq!(err.code, "GRF-EXPR-001");
}

#[test]
fn test_backoff_ceiling_below_base_is_rejected() {
    let yaml = r#"
graph:
  name: backoff
  nodes:
    - { id: a, type: function, callable: noop }
    - id: retry
      type: error_handler
      backoff: { base: 2s, ceiling: 1s }
  edges:
    - { from: a, to: retry, kind: on_error }
"#;
    let err = parse_graph(yaml).unwrap_err();
    assert_eq!(err.code, "GRF-SCHEMA-003");
}

#[test]
fn test_invalid_fail_class_is_rejected_by_callable_check() {
    let yaml = r#"
graph:
  name: fail-class
  nodes:
    - id: a
      type: function
      callable: fail
      params:
        class: sometimes
"#;
    let loaded = parse_graph(yaml).unwrap();
    let err = loaded
        .check_callables(&CallableRegistry::with_builtins())
        .unwrap_err();
    assert_eq!(err.code, "GRF-CALL-010");
    assert_eq!(err.node_id.as_deref(), Some("a"));
}

#[test]
fn test_subgraph_file_resolves_relative_to_parent() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("parts")).unwrap();
    fs::write(
        temp_dir.path().join("parts/child.yaml"),
        r#"
graph:
  name: child
  nodes:
    - { id: inner, type: function, callable: noop }
"#,
    )
    .unwrap();
    let parent = temp_dir.path().join("parent.yaml");
    fs::write(
        &parent,
        r#"
graph:
  name: parent
  nodes:
    - id: nested
      type: subgraph
      isolation: isolated
      file: parts/child.yaml
      inputs:
        source: input
      outputs:
        result: target
"#,
    )
    .unwrap();

    let loaded = load_graph(&parent).unwrap();
    let Some(NodeKind::Subgraph(subgraph)) = loaded.graph.node("nested").map(|node| &node.kind)
    else {
        panic!("nested should be a subgraph node");
    };
    assert_eq!(subgraph.graph.name(), "child");
    assert_eq!(subgraph.isolation, IsolationMode::Isolated);
    assert_eq!(subgraph.inputs, vec![("source".to_string(), "input".to_string())]);
    assert_eq!(subgraph.outputs, vec![("result".to_string(), "target".to_string())]);
}

#[test]
fn test_missing_file_is_an_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = load_graph(&temp_dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.category, ErrorCategory::IoError);
    assert_eq!(err.code, "GRF-SCHEMA-001");
}

#[test]
fn test_renderings_name_every_node() {
    let loaded = parse_graph(REVIEW_GRAPH).unwrap();
    let dot = graph_to_dot(&loaded.graph);
    assert!(dot.starts_with("digraph"));
    for id in ["score", "gate", "approve", "reject"] {
        assert!(dot.contains(id), "dot output misses {}", id);
    }
    let mermaid = graph_to_mermaid(&loaded.graph);
    assert!(mermaid.starts_with("flowchart"));
    assert!(mermaid.contains("on_true"));
}

#[test]
fn test_unreachable_nodes_are_listed() {
    let yaml = r#"
graph:
  name: island
  nodes:
    - { id: a, type: function, callable: noop }
    - { id: b, type: function, callable: noop }
    - { id: island, type: function, callable: noop }
  edges:
    - { from: a, to: b }
"#;
    let loaded = parse_graph(yaml).unwrap();
    assert_eq!(unreachable_nodes(&loaded.graph), vec!["island".to_string()]);
}
