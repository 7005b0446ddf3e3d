//! Lifecycle event stream (§4.11).
//!
//! The envelope and retained ordered log are grounded on the teacher's
//! `event/log.rs` (`Event{id, timestamp_ms, kind}`, monotonic id via an
//! `AtomicU64`, `parking_lot::RwLock`-guarded `Vec`); the "never blocks on
//! subscribers, bounded queue + drop-oldest" requirement is satisfied by
//! layering a `tokio::sync::broadcast` channel on top — a slow receiver
//! observes `RecvError::Lagged(n)` exactly when it has missed `n` events,
//! which is the drop-oldest contract spec.md asks for, rather than the
//! engine ever blocking on a full channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::broadcast;

/// A point-in-time snapshot of a task, attached to task-scoped events.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub action: String,
    pub status: &'static str,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub result_type: Option<&'static str>,
    /// Masked result payload — secrets are rendered as `****` (§8 invariant 10).
    pub result: Option<Json>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEventKind {
    FlowLoaded,
    FlowStarted,
    FlowFinished { error: Option<String> },
    TaskStarted,
    TaskCompleted,
    TaskFailed { error: String },
    TaskLog { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub flow_id: String,
    pub kind: FlowEventKind,
    pub task: Option<TaskSnapshot>,
}

/// Single-writer, multi-reader event bus for one run.
pub struct EventBus {
    flow_id: String,
    sender: broadcast::Sender<Arc<FlowEvent>>,
    log: RwLock<Vec<Arc<FlowEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(flow_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            flow_id: flow_id.into(),
            sender,
            log: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FlowEvent>> {
        self.sender.subscribe()
    }

    /// Emits an event; retains it in the ordered log and broadcasts to any
    /// live subscribers. A subscriber lagging behind sees `Lagged(n)` on
    /// its next `recv()` rather than the publisher ever blocking.
    pub fn emit(&self, kind: FlowEventKind, task: Option<TaskSnapshot>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(FlowEvent {
            id,
            timestamp: Utc::now(),
            flow_id: self.flow_id.clone(),
            kind,
            task,
        });
        self.log.write().push(event.clone());
        // No subscribers is not an error; the engine never blocks on readers.
        let _ = self.sender.send(event);
        id
    }

    pub fn events(&self) -> Vec<Arc<FlowEvent>> {
        self.log.read().clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
