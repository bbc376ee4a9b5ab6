//! Lifecycle events for task, agent, and tool runs
//!
//! The core publishes one event per lifecycle step and never consumes.
//! Transport framing (binary protobuf over pub/sub) belongs to the bus
//! adapter; here an event is a typed envelope plus its subject under the
//! schema `<component>.<event_type>.<workflow_exec_id>.<task_exec_id>`.
//!
//! [`EventLog`] is the in-process publisher: thread-safe, append-only,
//! with monotonic sequence ids, used directly in tests and wrapped by the
//! bus adapter in deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Component, TaskExecId};

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Lifecycle step names (wire-stable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Waiting,
    WaitingEnded,
    WaitingTimedOut,
    Success,
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Waiting => "waiting",
            EventType::WaitingEnded => "waiting_ended",
            EventType::WaitingTimedOut => "waiting_timed_out",
            EventType::Success => "success",
            EventType::Failed => "failed",
        }
    }
}

/// One published lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonic sequence id (assigned by the publisher)
    #[serde(default)]
    pub seq: u64,
    /// Milliseconds since the publisher started
    #[serde(default)]
    pub timestamp_ms: u64,

    pub component: Component,
    pub event_type: EventType,

    pub workflow_id: String,
    pub workflow_exec_id: String,
    pub task_id: String,
    pub task_exec_id: TaskExecId,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl TaskEvent {
    /// Pub/sub subject for this event
    pub fn subject(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.component,
            self.event_type.as_str(),
            self.workflow_exec_id,
            self.task_exec_id
        )
    }
}

// ============================================================================
// PUBLISHER
// ============================================================================

/// Outbound event sink the core publishes into
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Thread-safe, append-only in-process event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<TaskEvent>>>,
    start_time: Instant,
    next_seq: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// All events (cloned)
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.read().expect("event log poisoned").clone()
    }

    /// Events for one execution
    pub fn for_execution(&self, task_exec_id: TaskExecId) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_exec_id == task_exec_id)
            .collect()
    }

    /// Events whose subject starts with a prefix
    pub fn filter_subject(&self, prefix: &str) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.subject().starts_with(prefix))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("event log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventLog {
    fn publish(&self, mut event: TaskEvent) {
        event.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        event.timestamp_ms = self.start_time.elapsed().as_millis() as u64;
        self.events.write().expect("event log poisoned").push(event);
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
