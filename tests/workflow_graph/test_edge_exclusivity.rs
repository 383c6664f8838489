use graphflow::core::types::ErrorCategory;
use graphflow::core::workflow_graph::{
    executor::{Scheduler, Services},
    expression::Predicate,
    graph::{Graph, GraphBuilder},
    node::{FunctionNode, Node, NodeKind, NodeResult},
    state::ExecutionState,
    value::StateValue,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn noop(id: &str) -> Node {
    Node::new(id, NodeKind::Function(FunctionNode::new("noop")))
}

/// `gate` has two overlapping conditional edges and a fallback.
fn banded(strict: bool) -> Graph {
    GraphBuilder::new("banded")
        .node(noop("gate"))
        .node(noop("high"))
        .node(noop("top"))
        .node(noop("fallback"))
        .connect_when("gate", "high", Predicate::expr("score >= 50").unwrap())
        .connect_when("gate", "top", Predicate::expr("score >= 90").unwrap())
        .connect("gate", "fallback")
        .strict_edges(strict)
        .start("gate")
        .build()
        .unwrap()
}

fn output() -> NodeResult {
    NodeResult::Output(StateValue::Map(BTreeMap::new()))
}

fn scored(score: i64) -> ExecutionState {
    ExecutionState::with_variables("exec-prop", [("score", score)])
}

proptest! {
    #[test]
    fn first_declared_edge_wins(score in -100i64..200) {
        let graph = banded(false);
        let edge = graph.resolve_next("gate", &output(), &scored(score)).unwrap().unwrap();
        let expected = if score >= 50 { "high" } else { "fallback" };
        prop_assert_eq!(edge.to.as_str(), expected);
    }

    #[test]
    fn strict_edges_reject_overlap(score in -100i64..200) {
        let graph = banded(true);
        match graph.resolve_next("gate", &output(), &scored(score)) {
            Ok(Some(edge)) => {
                prop_assert!(score < 90);
                let expected = if score >= 50 { "high" } else { "fallback" };
                prop_assert_eq!(edge.to.as_str(), expected);
            }
            Ok(None) => prop_assert!(false, "gate always has a fallback edge"),
            Err(error) => {
                prop_assert!(score >= 90);
                prop_assert_eq!(error.code.as_str(), "GRF-EDGE-001");
                prop_assert_eq!(error.category, ErrorCategory::EdgeResolutionAmbiguous);
            }
        }
    }
}

#[tokio::test]
async fn test_strict_run_fails_at_ambiguous_node() {
    let report = Scheduler::new(Arc::new(banded(true)), Services::default())
        .run(scored(95), CancellationToken::new())
        .await;
    assert_eq!(
        report.outcome.error_kind(),
        Some(ErrorCategory::EdgeResolutionAmbiguous)
    );
    assert_eq!(report.path, vec!["gate"]);
}

#[tokio::test]
async fn test_lenient_run_takes_first_edge() {
    let report = Scheduler::new(Arc::new(banded(false)), Services::default())
        .run(scored(95), CancellationToken::new())
        .await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.path, vec!["gate", "high"]);
}
