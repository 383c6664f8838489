use graphflow::core::error::AppError;
use graphflow::core::types::ErrorCategory;
use graphflow::core::workflow_graph::{
    callable::{CallValues, CallableRegistry},
    events::EventKind,
    executor::{ExecutionOutcome, RunLimits, RunOptions, Scheduler, Services, StepStatus},
    expression::Predicate,
    graph::{Edge, EdgeKind, Graph, GraphBuilder},
    node::{ConditionalNode, FunctionNode, LoopNode, Node, NodeKind},
    state::ExecutionState,
    value::StateValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

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

fn noop(id: &str) -> Node {
    Node::new(id, NodeKind::Function(FunctionNode::new("noop")))
}

fn counting_services() -> Services {
    let mut builder = CallableRegistry::builder();
    builder.register_fn("increment", |inputs: &CallValues, _ctx| {
        let current = inputs
            .get("counter")
            .and_then(StateValue::as_int)
            .unwrap_or(0);
        let mut outputs = CallValues::new();
        outputs.insert("counter".to_string(), StateValue::Int(current + 1));
        Ok(outputs)
    });
    builder.register_fn("append", |inputs: &CallValues, _ctx| {
        let mut seen = inputs
            .get("seen")
            .and_then(StateValue::as_list)
            .map(<[StateValue]>::to_vec)
            .unwrap_or_default();
        if let Some(item) = inputs.get("item") {
            seen.push(item.clone());
        }
        let mut outputs = CallValues::new();
        outputs.insert("seen".to_string(), StateValue::List(seen));
        Ok(outputs)
    });
    Services::default().with_callables(builder.build())
}

fn increment(id: &str) -> Node {
    let mut function = FunctionNode::new("increment").output("counter", "counter");
    function.inputs.push(
        graphflow::core::workflow_graph::node::InputBinding::new("counter", "counter").optional(),
    );
    Node::new(id, NodeKind::Function(function))
}

fn scored_graph() -> Arc<Graph> {
    Arc::new(
        GraphBuilder::new("scored")
            .node(Node::new(
                "check",
                NodeKind::Conditional(ConditionalNode::new(
                    Predicate::expr("score > 80").unwrap(),
                )),
            ))
            .node(set_node("x", "route", "x"))
            .node(set_node("y", "route", "y"))
            .connect_kind("check", "x", EdgeKind::OnTrue)
            .connect_kind("check", "y", EdgeKind::OnFalse)
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_linear_run_emits_ordered_events() {
    let graph = Arc::new(
        GraphBuilder::new("linear")
            .node(set_node("A", "a", 1))
            .node(set_node("B", "b", 2))
            .connect("A", "B")
            .build()
            .unwrap(),
    );
    let services = Services::default();
    let subscription = services.events.subscribe_execution("exec-linear");
    let scheduler = Scheduler::new(graph, services);

    let report = scheduler
        .run(ExecutionState::new("exec-linear"), CancellationToken::new())
        .await;
    let events = subscription.collect().await;

    let observed: Vec<(EventKind, Option<String>)> = events
        .iter()
        .map(|event| (event.kind, event.node_id.clone()))
        .collect();
    assert_eq!(
        observed,
        vec![
            (EventKind::NodeStarted, Some("A".to_string())),
            (EventKind::NodeCompleted, Some("A".to_string())),
            (EventKind::NodeStarted, Some("B".to_string())),
            (EventKind::NodeCompleted, Some("B".to_string())),
            (EventKind::ExecutionCompleted, Some("B".to_string())),
        ]
    );
    assert!(events.windows(2).all(|pair| pair[0].event_id < pair[1].event_id));
    assert_eq!(report.path, vec!["A", "B"]);
    assert_eq!(report.total_steps, 2);
    assert_eq!(report.final_state.get("a"), Some(&StateValue::Int(1)));
    assert_eq!(report.final_state.get("b"), Some(&StateValue::Int(2)));
}

#[tokio::test]
async fn test_conditional_routes_on_score() {
    let scheduler = Scheduler::new(scored_graph(), Services::default());

    let high = scheduler
        .run(
            ExecutionState::with_variables("exec-high", [("score", 90)]),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(high.path, vec!["check", "x"]);
    assert_eq!(high.final_state.get("route"), Some(&StateValue::from("x")));

    let boundary = scheduler
        .run(
            ExecutionState::with_variables("exec-boundary", [("score", 80)]),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(boundary.path, vec!["check", "y"]);
    assert_eq!(boundary.final_state.get("route"), Some(&StateValue::from("y")));
}

#[tokio::test]
async fn test_conditional_on_missing_variable_fails() {
    let scheduler = Scheduler::new(scored_graph(), Services::default());
    let report = scheduler
        .run(ExecutionState::new("exec-missing"), CancellationToken::new())
        .await;
    assert!(!report.outcome.is_completed());
    let ExecutionOutcome::Failed { node_id, .. } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(node_id.as_deref(), Some("check"));
}

#[tokio::test]
async fn test_while_loop_limit_is_fatal() {
    let graph = Arc::new(
        GraphBuilder::new("forever")
            .node(Node::new(
                "loop",
                NodeKind::Loop(LoopNode::while_loop(Predicate::Constant(true), 3)),
            ))
            .node(increment("body"))
            .node(noop("after"))
            .connect_kind("loop", "body", EdgeKind::LoopBody)
            .connect_kind("loop", "after", EdgeKind::LoopExit)
            .connect("body", "loop")
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new(graph, counting_services());
    let report = scheduler
        .run(ExecutionState::new("exec-loop"), CancellationToken::new())
        .await;

    assert_eq!(
        report.outcome.error_kind(),
        Some(ErrorCategory::LoopLimitExceeded)
    );
    assert_eq!(report.final_state.get("counter"), Some(&StateValue::Int(3)));
    let bodies = report
        .history
        .iter()
        .filter(|step| step.node_id == "body")
        .count();
    assert_eq!(bodies, 3);
    let last = report.history.last().unwrap();
    assert_eq!(last.node_id, "loop");
    assert_eq!(last.status, StepStatus::Failed);
    assert_eq!(last.error.as_ref().unwrap().code, "GRF-LOOP-001");
}

#[tokio::test]
async fn test_while_loop_exits_when_condition_fails() {
    let graph = Arc::new(
        GraphBuilder::new("bounded")
            .node(Node::new(
                "loop",
                NodeKind::Loop(LoopNode::while_loop(
                    Predicate::expr("counter < 4").unwrap(),
                    10,
                )),
            ))
            .node(increment("body"))
            .node(set_node("after", "done", true))
            .connect_kind("loop", "body", EdgeKind::LoopBody)
            .connect_kind("loop", "after", EdgeKind::LoopExit)
            .connect("body", "loop")
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new(graph, counting_services());
    let report = scheduler
        .run(
            ExecutionState::with_variables("exec-bounded", [("counter", 0)]),
            CancellationToken::new(),
        )
        .await;

    assert!(report.outcome.is_completed());
    assert_eq!(report.final_state.get("counter"), Some(&StateValue::Int(4)));
    assert_eq!(report.final_state.get("done"), Some(&StateValue::Bool(true)));
    assert_eq!(report.path.last().map(String::as_str), Some("after"));
}

#[tokio::test]
async fn test_for_each_walks_collection() {
    let mut append = FunctionNode::new("append").output("seen", "seen");
    append.inputs.push(graphflow::core::workflow_graph::node::InputBinding::new("item", "item"));
    append
        .inputs
        .push(graphflow::core::workflow_graph::node::InputBinding::new("seen", "seen").optional());
    let graph = Arc::new(
        GraphBuilder::new("each")
            .node(Node::new(
                "each",
                NodeKind::Loop(LoopNode::for_each("items", "item", "index", 10)),
            ))
            .node(Node::new("collect", NodeKind::Function(append)))
            .node(noop("done"))
            .connect_kind("each", "collect", EdgeKind::LoopBody)
            .connect("collect", "each")
            .connect("each", "done")
            .build()
            .unwrap(),
    );
    let items = StateValue::List(vec!["a".into(), "b".into(), "c".into()]);
    let scheduler = Scheduler::new(graph, counting_services());
    let report = scheduler
        .run(
            ExecutionState::with_variables("exec-each", [("items", items.clone())]),
            CancellationToken::new(),
        )
        .await;

    assert!(report.outcome.is_completed());
    assert_eq!(report.final_state.get("seen"), Some(&items));
    assert_eq!(report.final_state.get("index"), Some(&StateValue::Int(2)));
    assert_eq!(report.path.last().map(String::as_str), Some("done"));
}

#[tokio::test]
async fn test_for_each_over_non_list_is_type_mismatch() {
    let graph = Arc::new(
        GraphBuilder::new("each")
            .node(Node::new(
                "each",
                NodeKind::Loop(LoopNode::for_each("items", "item", "index", 10)),
            ))
            .node(noop("body"))
            .connect_kind("each", "body", EdgeKind::LoopBody)
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(
            ExecutionState::with_variables("exec-each", [("items", "nope")]),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(report.outcome.error_kind(), Some(ErrorCategory::TypeMismatch));
}

#[tokio::test]
async fn test_first_declared_edge_wins() {
    let graph = Arc::new(
        GraphBuilder::new("overlap")
            .node(noop("start"))
            .node(set_node("first", "route", "first"))
            .node(set_node("second", "route", "second"))
            .connect_when("start", "first", Predicate::expr("score > 10").unwrap())
            .connect_when("start", "second", Predicate::expr("score > 5").unwrap())
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(
            ExecutionState::with_variables("exec-overlap", [("score", 50)]),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(report.path, vec!["start", "first"]);
}

#[tokio::test]
async fn test_no_qualifying_edge_completes_at_node() {
    let graph = Arc::new(
        GraphBuilder::new("sink")
            .node(noop("start"))
            .node(noop("guarded"))
            .edge(Edge::new("start", "guarded").when(Predicate::Constant(false)))
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(ExecutionState::new("exec-sink"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Completed { node_id, .. } = &report.outcome else {
        panic!("expected completion, got {:?}", report.outcome);
    };
    assert_eq!(node_id, "start");
}

#[tokio::test]
async fn test_missing_required_input_fails_node() {
    let graph = Arc::new(
        GraphBuilder::new("inputs")
            .node(Node::new(
                "needs",
                NodeKind::Function(FunctionNode::new("set").input("value", "absent")),
            ))
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(ExecutionState::new("exec-inputs"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Failed { error, .. } = &report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(error.code, "GRF-CALL-002");
}

#[tokio::test]
async fn test_unregistered_callable_fails_node() {
    let graph = Arc::new(
        GraphBuilder::new("unknown")
            .node(Node::new(
                "a",
                NodeKind::Function(FunctionNode::new("does_not_exist")),
            ))
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(ExecutionState::new("exec-unknown"), CancellationToken::new())
        .await;
    assert_eq!(report.outcome.error_kind(), Some(ErrorCategory::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_function_timeout() {
    let graph = Arc::new(
        GraphBuilder::new("slow")
            .node(Node::new(
                "slow",
                NodeKind::Function(
                    FunctionNode::new("sleep")
                        .param("ms", 5_000)
                        .timeout(Duration::from_millis(100)),
                ),
            ))
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(ExecutionState::new("exec-slow"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Failed { kind, error, .. } = &report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(*kind, ErrorCategory::TimeoutError);
    assert_eq!(error.code, "GRF-CALL-003");
}

#[tokio::test(start_paused = true)]
async fn test_max_time_interrupts_running_node() {
    let graph = Arc::new(
        GraphBuilder::new("deadline")
            .node(Node::new(
                "slow",
                NodeKind::Function(
                    FunctionNode::new("sleep")
                        .param("ms", 400)
                        .output("slept_ms", "slept"),
                ),
            ))
            .build()
            .unwrap(),
    );
    let started = tokio::time::Instant::now();
    let report = Scheduler::new(graph, Services::default())
        .with_options(RunOptions {
            limits: RunLimits {
                max_time: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            ..Default::default()
        })
        .run(ExecutionState::new("exec-deadline"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Failed { kind, error, node_id, .. } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(*kind, ErrorCategory::TimeoutError);
    assert_eq!(error.code, "GRF-TIME-001");
    assert_eq!(node_id.as_deref(), Some("slow"));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(report.final_state.get("slept"), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_keeps_completed_writes() {
    let graph = Arc::new(
        GraphBuilder::new("cancel")
            .node(set_node("first", "x", 1))
            .node(Node::new(
                "wait",
                NodeKind::Function(FunctionNode::new("sleep").param("ms", 60_000).output("slept_ms", "slept")),
            ))
            .node(set_node("never", "y", 1))
            .connect("first", "wait")
            .connect("wait", "never")
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new(graph, Services::default());
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(ExecutionState::new("exec-cancel"), cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let report = handle.await.unwrap();

    assert!(report.outcome.is_cancelled());
    assert_eq!(report.final_state.get("x"), Some(&StateValue::Int(1)));
    assert!(report.final_state.get("slept").is_none());
    assert!(report.final_state.get("y").is_none());
}

#[tokio::test]
async fn test_step_limit_stops_cycles() {
    let graph = Arc::new(
        GraphBuilder::new("cycle")
            .node(increment("a"))
            .node(increment("b"))
            .connect("a", "b")
            .connect("b", "a")
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new(graph, counting_services()).with_options(RunOptions {
        record_history: true,
        limits: graphflow::core::workflow_graph::executor::RunLimits {
            max_total_steps: Some(7),
            max_time: None,
        },
        ..Default::default()
    });
    let report = scheduler
        .run(ExecutionState::new("exec-cycle"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Failed { kind, error, .. } = &report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(*kind, ErrorCategory::StepLimitExceeded);
    assert_eq!(error.code, "GRF-ITER-001");
    assert_eq!(report.total_steps, 7);
    assert_eq!(report.final_state.get("counter"), Some(&StateValue::Int(7)));
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let scheduler = Scheduler::new(scored_graph(), Services::default());
    let mut trajectories = Vec::new();
    for _ in 0..3 {
        let report = scheduler
            .run(
                ExecutionState::with_variables("exec-repeat", [("score", 85)]),
                CancellationToken::new(),
            )
            .await;
        let trajectory: Vec<(String, Option<String>)> = report
            .history
            .iter()
            .map(|step| (step.node_id.clone(), step.next.clone()))
            .collect();
        trajectories.push((trajectory, report.final_state));
    }
    assert!(trajectories.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_history_records_pre_and_post_state() {
    let graph = Arc::new(
        GraphBuilder::new("history")
            .node(set_node("a", "x", 1))
            .node(set_node("b", "x", 2))
            .connect("a", "b")
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default())
        .run(ExecutionState::new("exec-history"), CancellationToken::new())
        .await;

    assert_eq!(report.history.len(), 2);
    let second = &report.history[1];
    assert_eq!(second.index, 1);
    assert_eq!(second.pre.get("x"), Some(&StateValue::Int(1)));
    assert_eq!(second.post.get("x"), Some(&StateValue::Int(2)));
    assert_eq!(second.pre.diff(&second.post).changed, vec!["x".to_string()]);
    assert!(report.history[0].pre.variables.is_empty());
}

#[tokio::test]
async fn test_callable_errors_propagate_with_node() {
    let mut builder = CallableRegistry::builder();
    builder.register_fn("explode", |_inputs: &CallValues, _ctx| {
        Err(AppError::new(ErrorCategory::NodeExecutionError, "boom").with_code("TEST-001"))
    });
    let graph = Arc::new(
        GraphBuilder::new("explode")
            .node(Node::new("bang", NodeKind::Function(FunctionNode::new("explode"))))
            .build()
            .unwrap(),
    );
    let report = Scheduler::new(graph, Services::default().with_callables(builder.build()))
        .run(ExecutionState::new("exec-explode"), CancellationToken::new())
        .await;
    let ExecutionOutcome::Failed { node_id, message, error, .. } = &report.outcome else {
        panic!("expected failure");
    };
    assert_eq!(node_id.as_deref(), Some("bang"));
    assert_eq!(message, "boom");
    assert_eq!(error.code, "TEST-001");
}
