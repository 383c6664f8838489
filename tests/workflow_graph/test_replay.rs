use graphflow::core::workflow_graph::{
    callable::{CallValues, CallableRegistry},
    executor::{ExecutionReport, Scheduler, Services},
    graph::{Graph, GraphBuilder},
    node::{FunctionNode, Node, NodeKind, NodeResult},
    replay::{ReplayEngine, StepOrigin},
    state::ExecutionState,
    value::StateValue,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn doubling_services() -> Services {
    let mut builder = CallableRegistry::builder();
    builder.register_fn("double", |inputs: &CallValues, _ctx| {
        let x = inputs.get("x").and_then(StateValue::as_int).unwrap_or(0);
        let mut outputs = CallValues::new();
        outputs.insert("y".to_string(), StateValue::Int(x * 2));
        Ok(outputs)
    });
    Services::default().with_callables(builder.build())
}

/// a sets x, b doubles x into y, c marks the run done.
fn doubling_graph() -> Arc<Graph> {
    Arc::new(
        GraphBuilder::new("doubling")
            .node(Node::new(
                "a",
                NodeKind::Function(FunctionNode::new("set").param("x", 5).output("x", "x")),
            ))
            .node(Node::new(
                "b",
                NodeKind::Function(FunctionNode::new("double").input("x", "x").output("y", "y")),
            ))
            .node(Node::new(
                "c",
                NodeKind::Function(
                    FunctionNode::new("set")
                        .param("done", true)
                        .output("done", "done"),
                ),
            ))
            .connect("a", "b")
            .connect("b", "c")
            .build()
            .unwrap(),
    )
}

async fn recorded() -> (Scheduler, ExecutionReport) {
    let scheduler = Scheduler::new(doubling_graph(), doubling_services());
    let report = scheduler
        .run(ExecutionState::new("exec-replay"), CancellationToken::new())
        .await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.history.len(), 3);
    (scheduler, report)
}

fn y_of(result: Option<&NodeResult>) -> Option<i64> {
    match result? {
        NodeResult::Output(StateValue::Map(map)) => map.get("y").and_then(StateValue::as_int),
        _ => None,
    }
}

#[tokio::test]
async fn test_what_if_reexecutes_from_modified_step() {
    let (scheduler, report) = recorded().await;
    let mut replay = ReplayEngine::from_report(&report, &scheduler);

    let before_b = replay.jump_to_step(1).unwrap();
    assert_eq!(before_b.get("x"), Some(&StateValue::Int(5)));
    assert!(before_b.get("y").is_none());

    replay.modify_variable("x", 21).unwrap();
    assert_eq!(replay.staged().len(), 1);
    let modified = replay.apply_changes().unwrap();
    assert_eq!(modified.get("x"), Some(&StateValue::Int(21)));
    assert!(replay.staged().is_empty());
    assert_eq!(replay.diverged_at(), Some(1));

    let step = replay.step_forward().await.unwrap();
    assert_eq!(step.node_id, "b");
    assert_eq!(step.post.get("y"), Some(&StateValue::Int(42)));
    assert_eq!(replay.step_origin(0), Some(StepOrigin::Original));
    assert_eq!(replay.step_origin(1), Some(StepOrigin::Reexecuted));

    assert_eq!(y_of(replay.original_result(1)), Some(10));
    assert_eq!(y_of(replay.modified_result(1)), Some(42));

    let comparison = replay.compare(1);
    let diff = comparison.diff.unwrap();
    assert!(diff.changed.contains(&"x".to_string()));
    assert!(diff.changed.contains(&"y".to_string()));

    // The rest of the branch runs the real nodes.
    let last = replay.step_forward().await.unwrap();
    assert_eq!(last.node_id, "c");
    assert_eq!(last.post.get("y"), Some(&StateValue::Int(42)));
    assert_eq!(replay.len(), 3);
    let error = replay.step_forward().await.unwrap_err();
    assert_eq!(error.code, "GRF-REPLAY-001");

    // The recorded history is untouched.
    assert_eq!(replay.history(), report.history.as_slice());
    assert_eq!(
        report.history[1].post.get("y"),
        Some(&StateValue::Int(10))
    );
}

#[tokio::test]
async fn test_navigation_is_read_only() {
    let (_, report) = recorded().await;
    let mut replay = ReplayEngine::new(report.history.clone());
    assert_eq!(replay.cursor(), 0);
    assert_eq!(replay.len(), 3);

    let mut visited = Vec::new();
    while let Ok(step) = replay.step_forward().await {
        visited.push(step.node_id.clone());
    }
    assert_eq!(visited, vec!["a", "b", "c"]);
    assert_eq!(replay.cursor(), 3);
    let end = replay.current_state().unwrap();
    assert_eq!(end.get("done"), Some(&StateValue::Bool(true)));

    let back = replay.step_backward().unwrap();
    assert_eq!(back.get("y"), Some(&StateValue::Int(10)));
    assert!(back.get("done").is_none());
    replay.step_forward().await.unwrap();
    assert_eq!(replay.current_state().unwrap(), end);

    assert_eq!(replay.jump_to_step(0).unwrap().get("x"), None);
    assert_eq!(replay.step_backward().unwrap_err().code, "GRF-REPLAY-001");
    assert_eq!(replay.jump_to_step(4).unwrap_err().code, "GRF-REPLAY-001");
    assert_eq!(replay.cursor(), 0);
    assert!(!replay.is_diverged());
}

#[tokio::test]
async fn test_apply_changes_requires_scheduler_and_step() {
    let (scheduler, report) = recorded().await;

    let mut read_only = ReplayEngine::new(report.history.clone());
    read_only.modify_variable("x", 1).unwrap();
    assert_eq!(read_only.apply_changes().unwrap_err().code, "GRF-REPLAY-002");

    let mut replay = ReplayEngine::from_report(&report, &scheduler);
    replay.jump_to_step(3).unwrap();
    replay.modify_variable("x", 1).unwrap();
    assert_eq!(replay.apply_changes().unwrap_err().code, "GRF-REPLAY-003");

    replay.discard_changes();
    assert!(replay.staged().is_empty());
    assert!(!replay.is_diverged());
}

#[tokio::test]
async fn test_reapplying_changes_truncates_branch() {
    let (scheduler, report) = recorded().await;
    let mut replay = ReplayEngine::from_report(&report, &scheduler);

    replay.jump_to_step(1).unwrap();
    replay.modify_variable("x", 1).unwrap();
    replay.apply_changes().unwrap();
    replay.step_forward().await.unwrap();
    replay.step_forward().await.unwrap();

    replay.jump_to_step(1).unwrap();
    replay.modify_variable("x", 2).unwrap();
    replay.apply_changes().unwrap();
    assert_eq!(replay.len(), 1);
    let step = replay.step_forward().await.unwrap();
    assert_eq!(step.post.get("y"), Some(&StateValue::Int(4)));
    assert_eq!(replay.diverged_at(), Some(1));
}

#[tokio::test]
async fn test_apply_changes_at_end_of_partial_branch() {
    let (scheduler, report) = recorded().await;
    let mut replay = ReplayEngine::from_report(&report, &scheduler);

    replay.jump_to_step(1).unwrap();
    replay.modify_variable("x", 21).unwrap();
    replay.apply_changes().unwrap();
    replay.step_forward().await.unwrap();
    assert_eq!(replay.cursor(), replay.len());

    replay.modify_variable("y", 7).unwrap();
    let state = replay.apply_changes().unwrap();
    assert_eq!(state.get("y"), Some(&StateValue::Int(7)));
    assert_eq!(replay.diverged_at(), Some(1));

    let last = replay.step_forward().await.unwrap();
    assert_eq!(last.node_id, "c");
    assert_eq!(last.post.get("y"), Some(&StateValue::Int(7)));
    assert_eq!(last.post.get("done"), Some(&StateValue::Bool(true)));
    assert_eq!(replay.len(), 3);
}

#[test]
fn test_compare_without_divergence() {
    let replay = ReplayEngine::new(Vec::new());
    assert!(replay.is_empty());
    let comparison = replay.compare(0);
    assert!(comparison.original.is_none());
    assert!(comparison.modified.is_none());
    assert!(comparison.diff.is_none());
}
