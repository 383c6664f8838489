use crate::core::error::ErrorSummary;
use crate::core::workflow_graph::node::RecoveryAction;
use crate::core::workflow_graph::state::redact_value;
use crate::core::workflow_graph::value::StateValue;
use async_stream::stream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    ExecutionCompleted,
    ExecutionFailed,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::ExecutionCompleted | EventKind::ExecutionFailed)
    }
}

/// Optional details attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
    /// Variables written by the node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StateValue>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryAction>,
    /// Subgraph nesting depth; 0 for the top-level run.
    #[serde(default)]
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Monotonically increasing across the stream.
    pub event_id: u64,
    pub execution_id: String,
    pub node_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// What happens when a subscriber falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Slow subscribers lose their oldest undelivered events.
    #[default]
    DropOldest,
    /// Publishing waits until every subscriber has room.
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!(
                "unknown overflow policy '{}'; expected drop_oldest or block",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Per-subscriber buffer size.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Events kept for late readers of [`EventStream::history`].
    pub retention: usize,
    pub redact_keys: Vec<String>,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            retention: 10_000,
            redact_keys: vec!["token".into(), "password".into(), "secret".into()],
        }
    }
}

struct BoundedSubscriber {
    execution_id: Option<String>,
    tx: mpsc::Sender<ExecutionEvent>,
}

struct Inner {
    config: EventStreamConfig,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<ExecutionEvent>,
    bounded: Mutex<Vec<BoundedSubscriber>>,
    retained: Mutex<VecDeque<ExecutionEvent>>,
    dropped: Arc<AtomicU64>,
}

/// Multi-subscriber event fan-out. Each subscriber gets its own ordered view.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<Inner>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(EventStreamConfig::default())
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("overflow", &self.inner.config.overflow)
            .field("capacity", &self.inner.config.capacity)
            .finish()
    }
}

impl EventStream {
    pub fn new(config: EventStreamConfig) -> Self {
        let (broadcast, _) = broadcast::channel(config.capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                broadcast,
                bounded: Mutex::new(Vec::new()),
                retained: Mutex::new(VecDeque::new()),
                dropped: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &EventStreamConfig {
        &self.inner.config
    }

    /// Publish one event and return it as delivered (id assigned, values redacted).
    pub async fn emit(
        &self,
        execution_id: &str,
        node_id: Option<&str>,
        kind: EventKind,
        mut payload: EventPayload,
    ) -> ExecutionEvent {
        let redact_keys = &self.inner.config.redact_keys;
        if let Some(output) = payload.output.as_mut() {
            redact_value(output, redact_keys);
        }
        payload.error = payload.error.map(|error| error.redacted(redact_keys));

        let event = {
            let mut retained = self
                .inner
                .retained
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let event = ExecutionEvent {
                event_id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
                execution_id: execution_id.to_string(),
                node_id: node_id.map(str::to_string),
                kind,
                timestamp: Utc::now(),
                payload,
            };
            if self.inner.config.retention > 0 {
                while retained.len() >= self.inner.config.retention {
                    retained.pop_front();
                }
                retained.push_back(event.clone());
            }
            event
        };

        match self.inner.config.overflow {
            OverflowPolicy::DropOldest => {
                // No receivers is fine.
                let _ = self.inner.broadcast.send(event.clone());
            }
            OverflowPolicy::Block => {
                let targets: Vec<mpsc::Sender<ExecutionEvent>> = {
                    let mut subscribers = self.bounded_subscribers();
                    subscribers.retain(|sub| !sub.tx.is_closed());
                    subscribers
                        .iter()
                        .filter(|sub| {
                            sub.execution_id
                                .as_deref()
                                .map_or(true, |id| id == event.execution_id)
                        })
                        .map(|sub| sub.tx.clone())
                        .collect()
                };
                for tx in targets {
                    // A closed receiver is pruned on the next emit.
                    let _ = tx.send(event.clone()).await;
                }
                if event.kind.is_terminal() {
                    // Execution-scoped subscriptions end here.
                    self.bounded_subscribers().retain(|sub| {
                        !sub.tx.is_closed()
                            && sub.execution_id.as_deref() != Some(event.execution_id.as_str())
                    });
                }
            }
        }
        tracing::trace!(
            execution_id = %event.execution_id,
            event_id = event.event_id,
            kind = ?event.kind,
            "event emitted"
        );
        event
    }

    /// Subscribe to every execution. Never ends on its own.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_filtered(None)
    }

    /// Subscribe to one execution; the subscription ends after its terminal event.
    pub fn subscribe_execution(&self, execution_id: impl Into<String>) -> EventSubscription {
        self.subscribe_filtered(Some(execution_id.into()))
    }

    fn subscribe_filtered(&self, execution_id: Option<String>) -> EventSubscription {
        let receiver = match self.inner.config.overflow {
            OverflowPolicy::DropOldest => Receiver::Broadcast(self.inner.broadcast.subscribe()),
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(self.inner.config.capacity.max(1));
                let mut subscribers = self.bounded_subscribers();
                subscribers.retain(|sub| !sub.tx.is_closed());
                subscribers.push(BoundedSubscriber {
                    execution_id: execution_id.clone(),
                    tx,
                });
                Receiver::Bounded(rx)
            }
        };
        EventSubscription {
            receiver,
            execution_id,
            finished: false,
            missed: 0,
            dropped: self.inner.dropped.clone(),
        }
    }

    fn bounded_subscribers(&self) -> MutexGuard<'_, Vec<BoundedSubscriber>> {
        self.inner
            .bounded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retained events for one execution, oldest first.
    pub fn history(&self, execution_id: &str) -> Vec<ExecutionEvent> {
        self.inner
            .retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| event.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Events lost by lagging subscribers since the stream was created.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

enum Receiver {
    Broadcast(broadcast::Receiver<ExecutionEvent>),
    Bounded(mpsc::Receiver<ExecutionEvent>),
}

pub struct EventSubscription {
    receiver: Receiver,
    execution_id: Option<String>,
    finished: bool,
    missed: u64,
    dropped: Arc<AtomicU64>,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription is finished.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        loop {
            let event = match &mut self.receiver {
                Receiver::Broadcast(rx) => match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.missed += skipped;
                        self.dropped.fetch_add(skipped, Ordering::Relaxed);
                        tracing::warn!(skipped, "event subscriber lagged; oldest events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                Receiver::Bounded(rx) => rx.recv().await?,
            };
            if let Some(id) = &self.execution_id {
                if &event.execution_id != id {
                    continue;
                }
                if event.kind.is_terminal() {
                    self.finished = true;
                }
            }
            return Some(event);
        }
    }

    /// Events this subscriber lost to the drop-oldest policy.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Drain the subscription until it finishes.
    pub async fn collect(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(mut self) -> impl Stream<Item = ExecutionEvent> {
        stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}
