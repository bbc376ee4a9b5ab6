//! State store - the task repository
//!
//! DashMap-backed record arena keyed by `task_exec_id`, with secondary
//! indexes for `(workflow_exec_id, task_id)` and parent→children lookups.
//!
//! Write discipline:
//! - every mutation takes the row's async lock (select-for-update semantics)
//! - terminal statuses are sticky; a write that would leave one is rejected,
//!   an identical write is an idempotent no-op
//! - sibling child rows are inserted under one store-wide transaction lock,
//!   all-or-none, before any child executes

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::state::{ProgressInfo, TaskState};
use crate::store::StoreError;
use crate::types::{Status, TaskExecId};

/// In-memory task repository
///
/// Clone shares the underlying maps (Arc), mirroring a pooled DB handle.
#[derive(Clone, Default)]
pub struct StateStore {
    /// Primary records: task_exec_id → state
    states: Arc<DashMap<TaskExecId, TaskState>>,
    /// Per-row write locks
    row_locks: Arc<DashMap<TaskExecId, Arc<Mutex<()>>>>,
    /// Store-wide lock for multi-row transactions
    tx_lock: Arc<Mutex<()>>,
    /// parent_state_id → children, in insertion order
    children: Arc<DashMap<TaskExecId, Vec<TaskExecId>>>,
    /// (workflow_exec_id, task_id) → executions, in insertion order
    by_task: Arc<DashMap<(String, String), Vec<TaskExecId>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_lock(&self, id: TaskExecId) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Strong-consistent point read
    pub async fn get_state(&self, id: TaskExecId) -> Result<TaskState, StoreError> {
        self.states
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| StoreError::NotFound {
                resource: "task_state",
                id: id.to_string(),
            })
    }

    /// Insert or update one state under its row lock
    ///
    /// Rejects writes that would move a terminal row anywhere else; writing
    /// the identical state twice is an idempotent no-op (one row).
    pub async fn upsert_state(&self, state: TaskState) -> Result<(), StoreError> {
        let lock = self.row_lock(state.task_exec_id);
        let _guard = lock.lock().await;
        self.upsert_locked(state)
    }

    fn upsert_locked(&self, state: TaskState) -> Result<(), StoreError> {
        if let Some(existing) = self.states.get(&state.task_exec_id) {
            // first terminal writer wins; only writes that would LEAVE the
            // terminal status are rejected
            if existing.status.is_terminal() && state.status != existing.status {
                return Err(StoreError::TerminalState {
                    id: state.task_exec_id.to_string(),
                    status: existing.status.to_string(),
                });
            }
            if !existing.status.can_transition_to(state.status) {
                return Err(StoreError::TerminalState {
                    id: state.task_exec_id.to_string(),
                    status: existing.status.to_string(),
                });
            }
        } else {
            self.index_new(&state);
        }
        self.states.insert(state.task_exec_id, state);
        Ok(())
    }

    fn index_new(&self, state: &TaskState) {
        if let Some(parent) = state.parent_state_id {
            self.children
                .entry(parent)
                .or_default()
                .push(state.task_exec_id);
        }
        self.by_task
            .entry((
                state.workflow_exec_id.clone(),
                state.task_id.as_str().to_string(),
            ))
            .or_default()
            .push(state.task_exec_id);
    }

    /// Read-modify-write one row under its lock
    ///
    /// The closure sees the current row and may mutate it; the write is
    /// subject to the same terminal-stickiness rules as [`Self::upsert_state`].
    pub async fn update_state<F>(&self, id: TaskExecId, mutate: F) -> Result<TaskState, StoreError>
    where
        F: FnOnce(&mut TaskState),
    {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let mut state = self
            .states
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| StoreError::NotFound {
                resource: "task_state",
                id: id.to_string(),
            })?;
        mutate(&mut state);
        self.upsert_locked(state.clone())?;
        Ok(state)
    }

    /// Observe an external cancel: any non-terminal row moves to canceled
    pub async fn cancel(&self, id: TaskExecId) -> Result<TaskState, StoreError> {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let mut state = self.get_state(id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        state.mark_canceled();
        self.states.insert(id, state.clone());
        Ok(state)
    }

    /// Insert all sibling rows in one transaction (all-or-none)
    ///
    /// Readers never observe a partial sibling set. Child configs are NOT
    /// saved here; create-children persists them afterwards with
    /// compensation on failure.
    pub async fn create_child_states_in_transaction(
        &self,
        parent_id: TaskExecId,
        children: Vec<TaskState>,
    ) -> Result<(), StoreError> {
        let _tx = self.tx_lock.lock().await;

        let parent = self.get_state(parent_id).await?;
        if !parent.can_have_children() {
            return Err(StoreError::Transaction(format!(
                "state {} ({}) cannot have children",
                parent_id, parent.execution_type
            )));
        }
        for child in &children {
            if child.parent_state_id != Some(parent_id) {
                return Err(StoreError::Transaction(format!(
                    "child {} does not point at parent {}",
                    child.task_exec_id, parent_id
                )));
            }
            if self.states.contains_key(&child.task_exec_id) {
                return Err(StoreError::Transaction(format!(
                    "child {} already exists",
                    child.task_exec_id
                )));
            }
        }

        // validated; now the batch cannot fail halfway
        let count = children.len();
        for child in children {
            self.index_new(&child);
            self.states.insert(child.task_exec_id, child);
        }
        debug!(parent = %parent_id, count, "child states committed");
        Ok(())
    }

    /// Children of a parent, in insertion order
    pub async fn list_children(&self, parent_id: TaskExecId) -> Vec<TaskState> {
        let Some(ids) = self.children.get(&parent_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.states.get(id).map(|s| s.clone()))
            .collect()
    }

    /// Aggregate child progress, computed from current rows
    pub async fn get_progress_info(&self, parent_id: TaskExecId) -> ProgressInfo {
        let children = self.list_children(parent_id).await;
        let mut progress = ProgressInfo {
            total_children: children.len(),
            ..Default::default()
        };
        for child in &children {
            match child.status {
                Status::Success => progress.success_count += 1,
                Status::Failed => progress.failed_count += 1,
                Status::Canceled => progress.canceled_count += 1,
                Status::Running | Status::Waiting => progress.running_count += 1,
                Status::Pending => progress.pending_count += 1,
            }
        }
        progress
    }

    /// Executions of one task within one workflow execution
    pub async fn list_task_executions(
        &self,
        workflow_exec_id: &str,
        task_id: &str,
    ) -> Vec<TaskState> {
        let key = (workflow_exec_id.to_string(), task_id.to_string());
        let Some(ids) = self.by_task.get(&key) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.states.get(id).map(|s| s.clone()))
            .collect()
    }

    /// Number of rows (test helper)
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ErrorInfo, PartialState};
    use crate::types::{Component, ExecutionType, TaskId};
    use serde_json::json;

    fn mk_state(task_id: &str, exec_type: ExecutionType) -> TaskState {
        TaskState::from_partial(
            TaskExecId::mint(),
            PartialState {
                workflow_id: "wf".into(),
                workflow_exec_id: "wf-exec".into(),
                task_id: TaskId::new(task_id).unwrap(),
                parent_state_id: None,
                component: Component::Task,
                execution_type: exec_type,
                input: json!({}),
                action_id: None,
                env: Default::default(),
            },
        )
    }

    fn mk_child(parent: &TaskState, task_id: &str) -> TaskState {
        let mut child = mk_state(task_id, ExecutionType::Basic);
        child.parent_state_id = Some(parent.task_exec_id);
        child
    }

    #[tokio::test]
    async fn upsert_and_get() {
        let store = StateStore::new();
        let state = mk_state("greet", ExecutionType::Basic);
        let id = state.task_exec_id;

        store.upsert_state(state.clone()).await.unwrap();
        assert_eq!(store.get_state(id).await.unwrap(), state);
    }

    #[tokio::test]
    async fn upsert_same_state_twice_is_one_row() {
        let store = StateStore::new();
        let state = mk_state("greet", ExecutionType::Basic);

        store.upsert_state(state.clone()).await.unwrap();
        store.upsert_state(state).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let store = StateStore::new();
        let mut state = mk_state("greet", ExecutionType::Basic);
        let id = state.task_exec_id;
        state.mark_running();
        state.mark_success(Some(json!("done")));
        store.upsert_state(state.clone()).await.unwrap();

        // attempt to resurrect the row
        let mut zombie = state.clone();
        zombie.status = Status::Running;
        let err = store.upsert_state(zombie).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalState { .. }));

        // same terminal write again is fine
        store.upsert_state(state).await.unwrap();
        assert_eq!(store.get_state(id).await.unwrap().status, Status::Success);
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let store = StateStore::new();
        let mut state = mk_state("greet", ExecutionType::Basic);
        state.mark_running();
        store.upsert_state(state.clone()).await.unwrap();

        // running → pending is not legal
        let mut hop = state.clone();
        hop.status = Status::Pending;
        assert!(store.upsert_state(hop).await.is_err());
    }

    #[tokio::test]
    async fn child_transaction_is_all_or_none() {
        let store = StateStore::new();
        let mut parent = mk_state("fanout", ExecutionType::Parallel);
        parent.mark_running();
        let parent_id = parent.task_exec_id;
        store.upsert_state(parent.clone()).await.unwrap();

        let good = mk_child(&parent, "fanout-0");
        let mut bad = mk_state("stray", ExecutionType::Basic);
        bad.parent_state_id = None; // does not point at the parent

        let err = store
            .create_child_states_in_transaction(parent_id, vec![good, bad])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
        // nothing committed
        assert!(store.list_children(parent_id).await.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn child_transaction_rejects_leaf_parent() {
        let store = StateStore::new();
        let parent = mk_state("leaf", ExecutionType::Basic);
        let parent_id = parent.task_exec_id;
        store.upsert_state(parent.clone()).await.unwrap();

        let child = mk_child(&parent, "child");
        assert!(store
            .create_child_states_in_transaction(parent_id, vec![child])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn progress_info_counts_statuses() {
        let store = StateStore::new();
        let mut parent = mk_state("fanout", ExecutionType::Parallel);
        parent.mark_running();
        let parent_id = parent.task_exec_id;
        store.upsert_state(parent).await.unwrap();

        let parent_state = store.get_state(parent_id).await.unwrap();
        let children: Vec<TaskState> = (0..3)
            .map(|i| mk_child(&parent_state, &format!("c{i}")))
            .collect();
        let ids: Vec<TaskExecId> = children.iter().map(|c| c.task_exec_id).collect();
        store
            .create_child_states_in_transaction(parent_id, children)
            .await
            .unwrap();

        store
            .update_state(ids[0], |s| {
                s.mark_running();
                s.mark_success(Some(json!("ok")));
            })
            .await
            .unwrap();
        store
            .update_state(ids[1], |s| {
                s.mark_running();
                s.mark_failed(ErrorInfo::execution("boom"));
            })
            .await
            .unwrap();

        let progress = store.get_progress_info(parent_id).await;
        assert_eq!(progress.total_children, 3);
        assert_eq!(progress.success_count, 1);
        assert_eq!(progress.failed_count, 1);
        assert_eq!(progress.pending_count, 1);
        assert!(!progress.all_terminal());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal() {
        let store = StateStore::new();
        let mut state = mk_state("greet", ExecutionType::Basic);
        let id = state.task_exec_id;
        state.mark_running();
        state.mark_success(None);
        store.upsert_state(state).await.unwrap();

        // cancel after success keeps success
        let after = store.cancel(id).await.unwrap();
        assert_eq!(after.status, Status::Success);
    }

    #[tokio::test]
    async fn secondary_index_by_task() {
        let store = StateStore::new();
        let a = mk_state("greet", ExecutionType::Basic);
        let b = mk_state("greet", ExecutionType::Basic);
        store.upsert_state(a).await.unwrap();
        store.upsert_state(b).await.unwrap();

        let execs = store.list_task_executions("wf-exec", "greet").await;
        assert_eq!(execs.len(), 2);
        // insertion order preserved
        assert!(execs[0].task_exec_id <= execs[1].task_exec_id);
    }
}
