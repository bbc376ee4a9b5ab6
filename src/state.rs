//! Task state - the mutable record of one execution
//!
//! A [`TaskState`] is minted by create-state, mutated by the execute and
//! response-handler paths, and owned exclusively by the state store. The only
//! cross-reference is `parent_state_id` on children; parents keep no child
//! collections, so the record graph is acyclic by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CollectionMode, Component, ExecutionType, Status, TaskExecId, TaskId};

// ============================================================================
// ERROR INFO
// ============================================================================

/// Structured error payload persisted on a failed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Category token, e.g. `execution_error`
    pub category: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Standard execution failure
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new("execution_error", message)
    }
}

// ============================================================================
// COLLECTION STATE
// ============================================================================

/// Result of a single collection item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub index: usize,
    pub task_exec_id: TaskExecId,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-collection bookkeeping on the parent state
///
/// Invariants: `processed <= total` and `completed + failed <= processed`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionStateInfo {
    /// Items surviving the filter, in source order
    pub items: Vec<Value>,
    /// Item count before filtering
    pub total: usize,
    /// Item count after filtering
    pub filtered: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Per-item results, ordered by item index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_results: Vec<ItemResult>,
    pub continue_on_error: bool,
    pub item_var: String,
    pub index_var: String,
    pub mode: CollectionMode,
}

// ============================================================================
// PARTIAL STATE
// ============================================================================

/// What create-state derives from a config before persistence
#[derive(Debug, Clone)]
pub struct PartialState {
    pub workflow_id: String,
    pub workflow_exec_id: String,
    pub task_id: TaskId,
    pub parent_state_id: Option<TaskExecId>,
    pub component: Component,
    pub execution_type: ExecutionType,
    pub input: Value,
    pub action_id: Option<String>,
    pub env: std::collections::HashMap<String, String>,
}

// ============================================================================
// TASK STATE
// ============================================================================

/// Mutable per-execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_exec_id: TaskExecId,
    pub workflow_id: String,
    pub workflow_exec_id: String,
    pub task_id: TaskId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_state_id: Option<TaskExecId>,

    pub component: Component,
    pub execution_type: ExecutionType,
    pub status: Status,

    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,

    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, String>,

    /// Set once the `outputs` transform has been applied (guards redelivery)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub outputs_applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_state: Option<CollectionStateInfo>,
}

impl TaskState {
    /// Materialize a state from a partial, minting identity here
    pub fn from_partial(task_exec_id: TaskExecId, partial: PartialState) -> Self {
        Self {
            task_exec_id,
            workflow_id: partial.workflow_id,
            workflow_exec_id: partial.workflow_exec_id,
            task_id: partial.task_id,
            parent_state_id: partial.parent_state_id,
            component: partial.component,
            execution_type: partial.execution_type,
            status: Status::Pending,
            input: partial.input,
            output: None,
            error: None,
            action_id: partial.action_id,
            env: partial.env,
            outputs_applied: false,
            started_at: None,
            ended_at: None,
            collection_state: None,
        }
    }

    /// Whether this state may own child states
    pub fn can_have_children(&self) -> bool {
        self.execution_type.can_have_children()
    }

    /// Start the execution clock and move to running
    pub fn mark_running(&mut self) {
        self.status = Status::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Move a wait task to waiting
    pub fn mark_waiting(&mut self) {
        self.status = Status::Waiting;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Terminal success; stamps the end time
    pub fn mark_success(&mut self, output: Option<Value>) {
        self.status = Status::Success;
        if output.is_some() {
            self.output = output;
        }
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    /// Terminal failure; stamps the end time and keeps any partial output
    pub fn mark_failed(&mut self, error: ErrorInfo) {
        self.status = Status::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    /// External cancellation
    pub fn mark_canceled(&mut self) {
        self.status = Status::Canceled;
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock duration, when both ends are stamped
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ============================================================================
// EXECUTION RESULT
// ============================================================================

/// Outcome of one execute use case, consumed by the response handler
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: Status,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
}

impl ExecutionResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: Status::Success,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            status: Status::Failed,
            output: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

// ============================================================================
// PROGRESS INFO
// ============================================================================

/// Aggregate child progress, computed on demand by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub total_children: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub canceled_count: usize,
    pub running_count: usize,
    pub pending_count: usize,
}

impl ProgressInfo {
    /// Children in a terminal state
    pub fn terminal_count(&self) -> usize {
        self.success_count + self.failed_count + self.canceled_count
    }

    pub fn all_terminal(&self) -> bool {
        self.total_children > 0 && self.terminal_count() == self.total_children
    }

    pub fn any_failed(&self) -> bool {
        self.failed_count > 0
    }

    pub fn any_succeeded(&self) -> bool {
        self.success_count > 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
