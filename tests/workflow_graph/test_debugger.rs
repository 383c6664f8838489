use graphflow::core::workflow_graph::{
    debug::{Breakpoint, DebugController, DebugEvent, DebugState, PauseReason, StepMode},
    executor::{Scheduler, Services},
    expression::Predicate,
    graph::{EdgeKind, Graph, GraphBuilder},
    node::{FunctionNode, IsolationMode, LoopNode, Node, NodeKind, SubgraphNode},
    state::ExecutionState,
    value::StateValue,
};
use std::sync::Arc;

fn set_node(id: &str, variable: &str, value: impl Into<StateValue>) -> Node {
    Node::new(
        id,
        NodeKind::Function(
            FunctionNode::new("set")
                .param(variable, value)
                .output(variable, variable),
        ),
    )
}

fn chain(ids: &[(&str, &str, i64)]) -> Arc<Graph> {
    let mut builder = GraphBuilder::new("chain");
    for (id, variable, value) in ids {
        builder = builder.node(set_node(id, variable, *value));
    }
    for pair in ids.windows(2) {
        builder = builder.connect(pair[0].0, pair[1].0);
    }
    Arc::new(builder.build().unwrap())
}

fn abc() -> Arc<Graph> {
    chain(&[("A", "a", 1), ("B", "b", 2), ("C", "c", 3)])
}

fn paused_at(state: &DebugState) -> (&str, usize, &PauseReason) {
    match state {
        DebugState::Paused {
            node_id,
            depth,
            reason,
        } => (node_id.as_str(), *depth, reason),
        other => panic!("expected a paused session, got {:?}", other),
    }
}

fn controller(graph: Arc<Graph>) -> DebugController {
    DebugController::new(Scheduler::new(graph, Services::default()))
}

#[tokio::test]
async fn test_breakpoint_pauses_before_node() {
    let mut debugger = controller(abc());
    let id = debugger.add_breakpoint(Breakpoint::at("B"));
    debugger
        .start(ExecutionState::new("exec-bp"), StepMode::Continue)
        .unwrap();

    let state = debugger.wait_until_paused().await;
    let (node_id, depth, reason) = paused_at(&state);
    assert_eq!(node_id, "B");
    assert_eq!(depth, 0);
    assert_eq!(reason, &PauseReason::Breakpoint { id });

    let variables = debugger.inspect_variables().unwrap();
    assert_eq!(variables.get("a"), Some(&StateValue::Int(1)));
    assert!(variables.get("b").is_none());

    debugger.resume(StepMode::Continue).unwrap();
    let report = debugger.finish().await.unwrap();
    assert!(report.outcome.is_completed());
    assert_eq!(report.path, vec!["A", "B", "C"]);
    assert_eq!(debugger.state(), DebugState::Stopped);
    assert_eq!(debugger.history().len(), 3);
}

#[tokio::test]
async fn test_breakpoint_expires_after_max_hits() {
    let graph = Arc::new(
        GraphBuilder::new("loop")
            .node(Node::new(
                "loop",
                NodeKind::Loop(LoopNode::for_each("items", "item", "index", 10)),
            ))
            .node(Node::new("body", NodeKind::Function(FunctionNode::new("noop"))))
            .node(Node::new("done", NodeKind::Function(FunctionNode::new("noop"))))
            .connect_kind("loop", "body", EdgeKind::LoopBody)
            .connect("body", "loop")
            .connect("loop", "done")
            .build()
            .unwrap(),
    );
    let mut debugger = controller(graph);
    let mut events = debugger.subscribe();
    let id = debugger.add_breakpoint(Breakpoint::at("body").max_hits(1));
    let items = StateValue::List(vec![1.into(), 2.into(), 3.into()]);
    debugger
        .start(
            ExecutionState::with_variables("exec-hits", [("items", items)]),
            StepMode::Continue,
        )
        .unwrap();

    let state = debugger.wait_until_paused().await;
    assert_eq!(paused_at(&state).0, "body");
    assert!(debugger.breakpoints().is_empty());
    debugger.resume(StepMode::Continue).unwrap();

    assert_eq!(debugger.wait_until_paused().await, DebugState::Stopped);
    let report = debugger.finish().await.unwrap();
    assert!(report.outcome.is_completed());

    let mut expired = false;
    while let Ok(event) = events.try_recv() {
        if event == (DebugEvent::BreakpointExpired { id: id.clone() }) {
            expired = true;
        }
    }
    assert!(expired);
}

#[tokio::test]
async fn test_step_into_pauses_at_every_node() {
    let mut debugger = controller(abc());
    debugger
        .start(ExecutionState::new("exec-step"), StepMode::StepInto)
        .unwrap();

    for expected in ["A", "B", "C"] {
        let state = debugger.wait_until_paused().await;
        let (node_id, _, reason) = paused_at(&state);
        assert_eq!(node_id, expected);
        assert_eq!(reason, &PauseReason::Step);
        debugger.resume(StepMode::StepInto).unwrap();
    }
    let report = debugger.finish().await.unwrap();
    assert!(report.outcome.is_completed());
}

fn with_subgraph() -> Arc<Graph> {
    let child = chain(&[("c1", "c1", 1), ("c2", "c2", 2)]);
    Arc::new(
        GraphBuilder::new("parent")
            .node(set_node("A", "a", 1))
            .node(Node::new(
                "S",
                NodeKind::Subgraph(SubgraphNode::new(child, IsolationMode::Shared)),
            ))
            .node(set_node("B", "b", 1))
            .connect("A", "S")
            .connect("S", "B")
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_step_over_skips_subgraph_nodes() {
    let mut debugger = controller(with_subgraph());
    debugger
        .start(ExecutionState::new("exec-over"), StepMode::StepOver)
        .unwrap();

    let mut visited = Vec::new();
    loop {
        match debugger.wait_until_paused().await {
            DebugState::Stopped => break,
            state => {
                let (node_id, depth, _) = paused_at(&state);
                visited.push((node_id.to_string(), depth));
                debugger.resume(StepMode::StepOver).unwrap();
            }
        }
    }
    assert_eq!(
        visited,
        vec![
            ("A".to_string(), 0),
            ("S".to_string(), 0),
            ("B".to_string(), 0)
        ]
    );
    assert!(debugger.finish().await.unwrap().outcome.is_completed());
}

#[tokio::test]
async fn test_step_into_then_out_of_subgraph() {
    let mut debugger = controller(with_subgraph());
    debugger.add_breakpoint(Breakpoint::at("S"));
    debugger
        .start(ExecutionState::new("exec-out"), StepMode::Continue)
        .unwrap();

    let state = debugger.wait_until_paused().await;
    assert_eq!(paused_at(&state).0, "S");
    debugger.resume(StepMode::StepInto).unwrap();

    let state = debugger.wait_until_paused().await;
    assert_eq!(paused_at(&state).0, "c1");
    assert_eq!(paused_at(&state).1, 1);
    debugger.resume(StepMode::StepOut).unwrap();

    let state = debugger.wait_until_paused().await;
    assert_eq!(paused_at(&state).0, "B");
    assert_eq!(paused_at(&state).1, 0);
    let variables = debugger.inspect_variables().unwrap();
    assert_eq!(variables.get("c2"), Some(&StateValue::Int(2)));
    debugger.resume(StepMode::Continue).unwrap();
    assert!(debugger.finish().await.unwrap().outcome.is_completed());
}

#[tokio::test]
async fn test_data_change_breakpoint() {
    let graph = chain(&[("A", "x", 1), ("B", "y", 1), ("C", "x", 2), ("D", "y", 2)]);
    let mut debugger = controller(graph);
    debugger.add_breakpoint(Breakpoint::data_change("x"));
    debugger
        .start(ExecutionState::new("exec-watch"), StepMode::Continue)
        .unwrap();

    let mut paused = Vec::new();
    loop {
        match debugger.wait_until_paused().await {
            DebugState::Stopped => break,
            state => {
                paused.push(paused_at(&state).0.to_string());
                debugger.resume(StepMode::Continue).unwrap();
            }
        }
    }
    assert_eq!(paused, vec!["B", "D"]);
    debugger.finish().await.unwrap();
}

#[tokio::test]
async fn test_node_scoped_data_change_compares_against_last_pause() {
    let graph = chain(&[("a", "x", 1), ("b", "y", 1), ("c", "y", 2)]);
    let mut debugger = controller(graph);
    let id = debugger.add_breakpoint(Breakpoint::data_change("x").on_node("c"));
    debugger
        .start(ExecutionState::new("exec-scoped"), StepMode::Continue)
        .unwrap();

    let state = debugger.wait_until_paused().await;
    let (node_id, _, reason) = paused_at(&state);
    assert_eq!(node_id, "c");
    assert_eq!(reason, &PauseReason::Breakpoint { id });
    debugger.resume(StepMode::Continue).unwrap();
    assert!(debugger.finish().await.unwrap().outcome.is_completed());
}

#[tokio::test]
async fn test_data_change_added_while_paused_uses_paused_state() {
    let graph = chain(&[("a", "x", 1), ("b", "y", 1), ("c", "x", 5), ("d", "y", 2)]);
    let mut debugger = controller(graph);
    debugger.add_breakpoint(Breakpoint::at("b"));
    debugger
        .start(ExecutionState::new("exec-late"), StepMode::Continue)
        .unwrap();
    assert_eq!(paused_at(&debugger.wait_until_paused().await).0, "b");

    debugger.add_breakpoint(Breakpoint::data_change("x"));
    debugger.resume(StepMode::Continue).unwrap();
    assert_eq!(paused_at(&debugger.wait_until_paused().await).0, "d");
    debugger.resume(StepMode::Continue).unwrap();
    assert!(debugger.finish().await.unwrap().outcome.is_completed());
}

#[tokio::test]
async fn test_conditional_breakpoint_and_evaluation_errors() {
    let mut debugger = controller(abc());
    let mut events = debugger.subscribe();
    let broken = debugger.add_breakpoint(Breakpoint::conditional(
        "B",
        Predicate::expr("missing > 1").unwrap(),
    ));
    let hit = debugger.add_breakpoint(Breakpoint::conditional(
        "C",
        Predicate::expr("b == 2").unwrap(),
    ));
    debugger
        .start(ExecutionState::new("exec-cond"), StepMode::Continue)
        .unwrap();

    let state = debugger.wait_until_paused().await;
    let (node_id, _, reason) = paused_at(&state);
    assert_eq!(node_id, "C");
    assert_eq!(reason, &PauseReason::Breakpoint { id: hit });
    debugger.resume(StepMode::Continue).unwrap();
    assert!(debugger.finish().await.unwrap().outcome.is_completed());

    let mut errored = false;
    while let Ok(event) = events.try_recv() {
        if let DebugEvent::BreakpointError { id, .. } = event {
            errored |= id == broken;
        }
    }
    assert!(errored);
}

#[tokio::test]
async fn test_pause_request_pauses_before_next_node() {
    let mut debugger = controller(abc());
    debugger
        .start(ExecutionState::new("exec-pause"), StepMode::Continue)
        .unwrap();
    debugger.pause().unwrap();

    let state = debugger.wait_until_paused().await;
    assert_eq!(paused_at(&state).2, &PauseReason::Requested);
    debugger.resume(StepMode::Continue).unwrap();
    assert!(debugger.finish().await.unwrap().outcome.is_completed());
}

#[tokio::test]
async fn test_stop_while_paused_cancels_run() {
    let mut debugger = controller(abc());
    debugger.add_breakpoint(Breakpoint::at("B"));
    debugger
        .start(ExecutionState::new("exec-stop"), StepMode::Continue)
        .unwrap();
    debugger.wait_until_paused().await;

    debugger.stop();
    let report = debugger.finish().await.unwrap();
    assert!(report.outcome.is_cancelled());
    assert_eq!(report.path, vec!["A"]);
    assert_eq!(debugger.state(), DebugState::Stopped);
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let mut debugger = controller(abc());
    assert_eq!(debugger.state(), DebugState::Idle);
    assert_eq!(
        debugger.resume(StepMode::Continue).unwrap_err().code,
        "GRF-DEBUG-001"
    );
    assert_eq!(debugger.pause().unwrap_err().code, "GRF-DEBUG-002");
    assert_eq!(debugger.finish().await.unwrap_err().code, "GRF-DEBUG-004");

    debugger.add_breakpoint(Breakpoint::at("A"));
    debugger
        .start(ExecutionState::new("exec-twice"), StepMode::Continue)
        .unwrap();
    assert_eq!(
        debugger
            .start(ExecutionState::new("exec-twice"), StepMode::Continue)
            .unwrap_err()
            .code,
        "GRF-DEBUG-003"
    );
    debugger.wait_until_paused().await;
    debugger.stop();
    debugger.finish().await.unwrap();
}

#[test]
fn test_breakpoint_ids_are_assigned_and_removable() {
    let debugger = controller(abc());
    let first = debugger.add_breakpoint(Breakpoint::at("A"));
    let named = debugger.add_breakpoint(Breakpoint::at("B").with_id("mine"));
    assert_eq!(first, "bp-1");
    assert_eq!(named, "mine");
    assert!(debugger.remove_breakpoint("bp-1"));
    assert!(!debugger.remove_breakpoint("bp-1"));
    assert_eq!(debugger.breakpoints().len(), 1);
}
