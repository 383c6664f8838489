//! Graph workflow execution: nodes, edges, scheduling, debugging and replay.

pub mod callable;
pub mod callables;
pub mod checkpoint;
pub mod debug;
pub mod dot;
pub mod engine;
pub mod events;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod metrics;
pub mod node;
pub mod replay;
pub mod schema;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod value;

pub use callable::{CallContext, CallValues, Callable, CallableRegistry, FnCallable};
pub use checkpoint::{Checkpoint, CheckpointHandle, CheckpointInfo, CheckpointStore, RetentionPolicy};
pub use debug::{Breakpoint, BreakpointKind, DebugController, DebugEvent, DebugState, StepMode};
pub use engine::{Engine, ExecutionHandle};
pub use events::{EventKind, EventStream, EventStreamConfig, ExecutionEvent, OverflowPolicy};
pub use executor::{
    CheckpointPolicy, ExecutionObserver, ExecutionOutcome, ExecutionReport, ExecutionStep,
    RunLimits, RunOptions, Scheduler, Services,
};
pub use expression::Predicate;
pub use graph::{Edge, EdgeKind, Graph, GraphBuilder};
pub use metrics::{MetricsCollector, MetricsSnapshot, NodeStats};
pub use node::{
    Backoff, ConditionalNode, ErrorHandlerNode, FunctionNode, IsolationMode, LoopNode, Node,
    NodeKind, SubgraphNode,
};
pub use replay::ReplayEngine;
pub use schema::{load_graph, parse_graph, GraphDocument, LoadedGraph};
pub use secrets::{EnvSecrets, SecretResolver, StaticSecrets};
pub use state::{ExecutionState, StateDiff, StateSnapshot};
pub use storage::{FileBackend, MemoryBackend, StorageBackend};
pub use value::StateValue;
