//! Parallel fan-out: strategies, parent status, and the driver
//!
//! The driver materializes children (create-children), fans them out bounded
//! by `max_workers`, and folds results back into the parent. Fan-out here is
//! local concurrency over child activities; under the durable runtime each
//! child is its own activity and `max_workers` becomes the runtime's
//! concurrency hint.
//!
//! Strategy semantics:
//! - `wait_all` - resolve only when every child is terminal; success iff all
//!   succeeded
//! - `fail_fast` - parent fails on the first child failure; siblings get a
//!   best-effort cancel
//! - `best_effort` - fails only when every child failed
//! - `race` - the first terminal child decides; siblings are marked canceled

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::collection;
use crate::create_children::CreateChildren;
use crate::error::{OrdoError, Result};
use crate::events::{EventLog, EventPublisher, EventType, TaskEvent};
use crate::memory::MemoryDriver;
use crate::response::ResponseHandler;
use crate::state::{ErrorInfo, ExecutionResult, ItemResult, ProgressInfo, TaskState};
use crate::store::{CollectionMeta, ConfigStore, StateStore};
use crate::task_executor::TaskExecutor;
use crate::types::{CollectionMode, Status, Strategy, TaskExecId};
use crate::workflow::{WorkflowConfig, WorkflowState};

// ============================================================================
// STRATEGY RESOLUTION
// ============================================================================

/// Resolve the parent's terminal status from child progress, if decided
pub fn resolve_parent_status(strategy: Strategy, progress: &ProgressInfo) -> Option<Status> {
    if progress.total_children == 0 {
        return Some(Status::Success);
    }
    match strategy {
        Strategy::WaitAll => {
            if progress.all_terminal() {
                if progress.failed_count == 0 && progress.canceled_count == 0 {
                    Some(Status::Success)
                } else {
                    Some(Status::Failed)
                }
            } else {
                None
            }
        }
        Strategy::FailFast => {
            if progress.any_failed() {
                Some(Status::Failed)
            } else if progress.all_terminal() {
                Some(Status::Success)
            } else {
                None
            }
        }
        Strategy::BestEffort => {
            if progress.all_terminal() {
                if progress.any_succeeded() {
                    Some(Status::Success)
                } else {
                    Some(Status::Failed)
                }
            } else {
                None
            }
        }
        Strategy::Race => {
            if progress.any_succeeded() {
                Some(Status::Success)
            } else if progress.all_terminal() {
                Some(Status::Failed)
            } else if progress.terminal_count() > 0 {
                // first terminal child decides; a failure loses the race
                Some(Status::Failed)
            } else {
                None
            }
        }
    }
}

/// Row-locked parent status update driven by one child's completion
///
/// Reads current progress under the parent's lock, applies the strategy,
/// and upserts when the strategy has decided. Never called on non-parallel
/// parents.
pub async fn update_parent_status(
    states: &StateStore,
    parent_id: TaskExecId,
    strategy: Strategy,
    child: &TaskState,
) -> Result<()> {
    let progress = states.get_progress_info(parent_id).await;
    let Some(resolved) = resolve_parent_status(strategy, &progress) else {
        return Ok(());
    };

    let child_id = child.task_id.clone();
    states
        .update_state(parent_id, move |parent| {
            if parent.status.is_terminal() {
                return;
            }
            match resolved {
                Status::Success => parent.mark_success(None),
                Status::Failed => parent.mark_failed(ErrorInfo::execution(format!(
                    "child task {child_id} failed ({} of {} children failed)",
                    progress.failed_count, progress.total_children
                ))),
                _ => {}
            }
        })
        .await?;
    debug!(parent = %parent_id, status = %resolved, "parent status resolved");
    Ok(())
}

// ============================================================================
// CHILD OUTCOMES
// ============================================================================

#[derive(Debug, Clone)]
struct ChildOutcome {
    index: usize,
    task_exec_id: TaskExecId,
    task_id: String,
    status: Status,
    output: Option<Value>,
    error: Option<String>,
}

// ============================================================================
// FAN-OUT DRIVER
// ============================================================================

/// Drives parallel and collection parents end to end
#[derive(Clone)]
pub struct FanOutDriver {
    states: StateStore,
    configs: ConfigStore,
    create_children: CreateChildren,
    executor: Arc<TaskExecutor>,
    handler: Arc<ResponseHandler>,
    memory: MemoryDriver,
    events: EventLog,
}

impl FanOutDriver {
    pub fn new(
        states: StateStore,
        configs: ConfigStore,
        executor: Arc<TaskExecutor>,
        handler: Arc<ResponseHandler>,
        memory: MemoryDriver,
        events: EventLog,
    ) -> Self {
        let create_children = CreateChildren::new(states.clone(), configs.clone());
        Self {
            states,
            configs,
            create_children,
            executor,
            handler,
            memory,
            events,
        }
    }

    async fn start_parent(&self, parent_id: TaskExecId) -> Result<TaskState> {
        let state = self
            .states
            .update_state(parent_id, TaskState::mark_running)
            .await?;
        self.events.publish(TaskEvent {
            seq: 0,
            timestamp_ms: 0,
            component: crate::types::Component::Task,
            event_type: EventType::Started,
            workflow_id: state.workflow_id.clone(),
            workflow_exec_id: state.workflow_exec_id.clone(),
            task_id: state.task_id.as_str().to_string(),
            task_exec_id: state.task_exec_id,
            details: Value::Null,
        });
        Ok(state)
    }

    /// Run a parallel parent to completion
    #[instrument(skip(self, workflow, workflow_config, cancel), fields(parent = %parent_id))]
    pub async fn run_parallel(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        parent_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let metadata = self.configs.get_metadata(parent_id).await?;
        let meta = metadata.as_parallel().map_err(OrdoError::from)?;
        let strategy = meta.strategy;

        self.start_parent(parent_id).await?;
        let children = self
            .create_children
            .create_children(workflow, parent_id)
            .await?;

        let workers = meta.max_workers.unwrap_or_else(|| children.len().max(1));
        let timeout = meta.timeout.as_deref().and_then(crate::types::parse_duration);
        let short_circuit = matches!(strategy, Strategy::FailFast | Strategy::Race);
        let outcomes = self
            .run_children_with_timeout(
                workflow,
                workflow_config,
                &children,
                workers,
                strategy,
                timeout,
                cancel,
            )
            .await;

        if short_circuit || outcomes.len() < children.len() {
            self.cancel_stragglers(&children, &outcomes).await;
        }

        // fold the final status from actual rows (update_parent_status may
        // have resolved it already)
        let progress = self.states.get_progress_info(parent_id).await;
        let status = resolve_parent_status(strategy, &progress).unwrap_or(Status::Failed);
        let output = parallel_output(strategy, &outcomes);

        let failed_children: Vec<&ChildOutcome> = outcomes
            .iter()
            .filter(|o| o.status != Status::Success)
            .collect();
        let error = match status {
            Status::Failed if outcomes.len() < children.len() => Some(ErrorInfo::execution(
                "fan-out timed out before all children finished",
            )),
            Status::Failed => Some(ErrorInfo::execution(format!(
                "{} of {} children failed",
                failed_children.len(),
                outcomes.len()
            ))),
            _ => None,
        };

        self.finalize_parent(parent_id, status, output.clone(), error.clone())
            .await?;

        Ok(ExecutionResult {
            status,
            output: Some(output),
            error,
        })
    }

    /// Run a collection parent to completion
    #[instrument(skip(self, workflow, workflow_config, cancel), fields(parent = %parent_id))]
    pub async fn run_collection(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        parent_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let metadata = self.configs.get_metadata(parent_id).await?;
        let meta = metadata.as_collection().map_err(OrdoError::from)?;
        let workers = collection_workers(meta);

        self.start_parent(parent_id).await?;
        let children = self
            .create_children
            .create_children(workflow, parent_id)
            .await?;

        let timeout = meta.timeout.as_deref().and_then(crate::types::parse_duration);
        let outcomes = self
            .run_children_with_timeout(
                workflow,
                workflow_config,
                &children,
                workers,
                Strategy::WaitAll,
                timeout,
                cancel,
            )
            .await;
        if outcomes.len() < children.len() {
            self.cancel_stragglers(&children, &outcomes).await;
        }

        let results: Vec<ItemResult> = outcomes
            .iter()
            .map(|o| ItemResult {
                index: o.index,
                task_exec_id: o.task_exec_id,
                status: o.status,
                output: o.output.clone(),
                error: o.error.clone(),
            })
            .collect();

        let parent = self.states.get_state(parent_id).await?;
        let mut collection_state = parent.collection_state.clone().unwrap_or_default();
        let outcome = collection::aggregate(&mut collection_state, results);

        let error = match outcome.status {
            Status::Failed => Some(ErrorInfo::execution(format!(
                "{} of {} items failed",
                collection_state.failed, collection_state.filtered
            ))),
            _ => None,
        };

        let output = outcome.output.clone();
        let status = outcome.status;
        self.states
            .update_state(parent_id, move |p| {
                p.collection_state = Some(collection_state);
                if !p.status.is_terminal() {
                    match status {
                        Status::Success => p.mark_success(Some(output)),
                        Status::Failed => {
                            p.output = Some(output);
                            p.mark_failed(
                                error
                                    .clone()
                                    .unwrap_or_else(|| ErrorInfo::execution("collection failed")),
                            );
                        }
                        _ => {}
                    }
                } else {
                    p.output = Some(output);
                }
            })
            .await?;

        Ok(ExecutionResult {
            status: outcome.status,
            output: Some(outcome.output),
            error: match outcome.status {
                Status::Failed => Some(ErrorInfo::execution("collection failed")),
                _ => None,
            },
        })
    }

    /// Run a composite parent: children in declaration order, stop on failure
    #[instrument(skip(self, workflow, workflow_config, cancel), fields(parent = %parent_id))]
    pub async fn run_composite(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        parent_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let metadata = self.configs.get_metadata(parent_id).await?;
        metadata.as_composite().map_err(OrdoError::from)?;

        self.start_parent(parent_id).await?;
        let children = self
            .create_children
            .create_children(workflow, parent_id)
            .await?;

        // one worker and fail-fast: strictly ordered, aborts the tail
        let outcomes = self
            .run_children(workflow, workflow_config, &children, 1, Strategy::FailFast, cancel)
            .await;
        self.cancel_stragglers(&children, &outcomes).await;

        let all_ok = outcomes.len() == children.len()
            && outcomes.iter().all(|o| o.status == Status::Success);
        let status = if all_ok { Status::Success } else { Status::Failed };
        let output = parallel_output(Strategy::WaitAll, &outcomes);
        let error = (!all_ok).then(|| {
            let failed = outcomes
                .iter()
                .find(|o| o.status != Status::Success)
                .map(|o| o.task_id.clone())
                .unwrap_or_default();
            ErrorInfo::execution(format!("composite step {failed} failed"))
        });

        self.finalize_parent(parent_id, status, output.clone(), error.clone())
            .await?;
        Ok(ExecutionResult {
            status,
            output: Some(output),
            error,
        })
    }

    /// Bound the fan-out by the parent's advisory timeout
    ///
    /// On expiry the remaining child futures are dropped; their rows are
    /// settled by the caller's straggler pass.
    #[allow(clippy::too_many_arguments)]
    async fn run_children_with_timeout(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        children: &[TaskState],
        workers: usize,
        strategy: Strategy,
        timeout: Option<std::time::Duration>,
        cancel: &CancellationToken,
    ) -> Vec<ChildOutcome> {
        let run = self.run_children(workflow, workflow_config, children, workers, strategy, cancel);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    warn!(limit_ms = limit.as_millis() as u64, "fan-out timed out");
                    Vec::new()
                }
            },
            None => run.await,
        }
    }

    /// Execute children with bounded concurrency, strategy-aware
    async fn run_children(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        children: &[TaskState],
        workers: usize,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> Vec<ChildOutcome> {
        let fanout_cancel = cancel.child_token();
        let mut outcomes: Vec<ChildOutcome> = Vec::with_capacity(children.len());

        let mut pending = children.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < workers.max(1) {
                let Some((index, child)) = pending.next() else {
                    break;
                };
                in_flight.push(self.run_one_child(
                    workflow,
                    workflow_config,
                    index,
                    child.clone(),
                    fanout_cancel.clone(),
                ));
            }
            let Some(outcome) = in_flight.next().await else {
                break;
            };

            let failed = outcome.status != Status::Success;
            let decided = match strategy {
                Strategy::FailFast => failed,
                Strategy::Race => true,
                _ => false,
            };
            outcomes.push(outcome);
            if decided {
                // best-effort cancellation of the remaining siblings
                fanout_cancel.cancel();
                while let Some(outcome) = in_flight.next().await {
                    outcomes.push(outcome);
                }
                break;
            }
        }

        outcomes
    }

    /// Dispatch one child by its config type
    ///
    /// Nested parallel/composite children recurse through the driver
    /// (boxed: the future type is otherwise infinite). The recursion is
    /// mutual with `run_parallel`/`run_composite`, so the future is boxed
    /// explicitly here (rather than via `.boxed()` on an `async fn`) to
    /// give rustc a concrete, named Send future instead of an opaque type
    /// whose Send-ness would otherwise depend on itself.
    fn execute_child<'a>(
        &'a self,
        workflow: &'a WorkflowState,
        workflow_config: &'a WorkflowConfig,
        task_exec_id: TaskExecId,
        cancel: &'a CancellationToken,
    ) -> futures::future::BoxFuture<'a, Result<ExecutionResult>> {
        Box::pin(async move {
            let config = self.configs.get(task_exec_id).await?;
            match config.task_type {
                crate::config::TaskType::Parallel => {
                    self.run_parallel(workflow, workflow_config, task_exec_id, cancel)
                        .await
                }
                crate::config::TaskType::Composite => {
                    self.run_composite(workflow, workflow_config, task_exec_id, cancel)
                        .await
                }
                crate::config::TaskType::Memory => match self
                    .memory
                    .execute(workflow, task_exec_id, cancel)
                    .await
                {
                    Ok(result) => Ok(result),
                    Err(OrdoError::Canceled) => Err(OrdoError::Canceled),
                    Err(e) => Ok(ExecutionResult::failure(ErrorInfo::new(
                        e.category().token(),
                        e.to_string(),
                    ))),
                },
                _ => self.executor.execute(workflow, task_exec_id, cancel).await,
            }
        })
    }

    async fn run_one_child(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        index: usize,
        child: TaskState,
        cancel: CancellationToken,
    ) -> ChildOutcome {
        let task_exec_id = child.task_exec_id;
        let task_id = child.task_id.as_str().to_string();

        let execution = self
            .execute_child(workflow, workflow_config, task_exec_id, &cancel)
            .await;

        match execution {
            Ok(result) => {
                // stamp the raw output so the response handler can read it
                if let Some(output) = result.output.clone() {
                    if let Err(e) = self
                        .states
                        .update_state(task_exec_id, move |s| {
                            if !s.status.is_terminal() || s.output.is_none() {
                                s.output = Some(output);
                            }
                        })
                        .await
                    {
                        warn!(child = %task_exec_id, error = %e, "output stamp failed");
                    }
                }
                let error = result.error.clone();
                // the handler persists the terminal state and updates the
                // parent; a missing on_error transition surfaces as Err but
                // the child row is already final
                let handled = self
                    .handler
                    .handle(
                        workflow,
                        workflow_config,
                        task_exec_id,
                        error,
                        None,
                        &cancel,
                    )
                    .await;

                match handled {
                    Ok(response) => ChildOutcome {
                        index,
                        task_exec_id,
                        task_id,
                        status: response.state.status,
                        output: response.state.output,
                        error: response.state.error.map(|e| e.message),
                    },
                    Err(e) => {
                        let state = self.states.get_state(task_exec_id).await.ok();
                        ChildOutcome {
                            index,
                            task_exec_id,
                            task_id,
                            status: Status::Failed,
                            output: state.as_ref().and_then(|s| s.output.clone()),
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            Err(OrdoError::Canceled) => {
                if let Err(e) = self.states.cancel(task_exec_id).await {
                    warn!(child = %task_exec_id, error = %e, "cancel write failed");
                }
                ChildOutcome {
                    index,
                    task_exec_id,
                    task_id,
                    status: Status::Canceled,
                    output: None,
                    error: Some("canceled".to_string()),
                }
            }
            Err(e) => ChildOutcome {
                index,
                task_exec_id,
                task_id,
                status: Status::Failed,
                output: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Mark children the strategy abandoned as canceled
    async fn cancel_stragglers(&self, children: &[TaskState], outcomes: &[ChildOutcome]) {
        for child in children {
            let seen = outcomes.iter().any(|o| o.task_exec_id == child.task_exec_id);
            if !seen {
                if let Err(e) = self.states.cancel(child.task_exec_id).await {
                    warn!(child = %child.task_exec_id, error = %e, "straggler cancel failed");
                }
            }
        }
    }

    async fn finalize_parent(
        &self,
        parent_id: TaskExecId,
        status: Status,
        output: Value,
        error: Option<ErrorInfo>,
    ) -> Result<()> {
        self.states
            .update_state(parent_id, move |parent| {
                if parent.status.is_terminal() {
                    parent.output = Some(output);
                    return;
                }
                match status {
                    Status::Success => parent.mark_success(Some(output)),
                    Status::Failed => {
                        parent.output = Some(output);
                        parent.mark_failed(
                            error.unwrap_or_else(|| ErrorInfo::execution("fan-out failed")),
                        );
                    }
                    Status::Canceled => parent.mark_canceled(),
                    _ => {}
                }
            })
            .await?;
        Ok(())
    }
}

fn collection_workers(meta: &CollectionMeta) -> usize {
    match meta.mode {
        CollectionMode::Sequential => meta.batch.unwrap_or(1).max(1),
        CollectionMode::Parallel => meta.max_workers.unwrap_or(usize::MAX).max(1),
    }
}

/// Parent output per strategy
fn parallel_output(strategy: Strategy, outcomes: &[ChildOutcome]) -> Value {
    match strategy {
        Strategy::Race => outcomes
            .iter()
            .find(|o| o.status == Status::Success)
            .or_else(|| outcomes.first())
            .and_then(|o| o.output.clone())
            .unwrap_or(Value::Null),
        _ => {
            let mut by_task = Map::new();
            for outcome in outcomes {
                by_task.insert(
                    outcome.task_id.clone(),
                    json!({
                        "status": outcome.status,
                        "output": outcome.output,
                        "error": outcome.error,
                    }),
                );
            }
            Value::Object(by_task)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(
        total: usize,
        success: usize,
        failed: usize,
        canceled: usize,
        running: usize,
    ) -> ProgressInfo {
        ProgressInfo {
            total_children: total,
            success_count: success,
            failed_count: failed,
            canceled_count: canceled,
            running_count: running,
            pending_count: total - success - failed - canceled - running,
        }
    }

    #[test]
    fn wait_all_waits_for_every_child() {
        assert_eq!(
            resolve_parent_status(Strategy::WaitAll, &progress(3, 2, 0, 0, 1)),
            None
        );
        assert_eq!(
            resolve_parent_status(Strategy::WaitAll, &progress(3, 3, 0, 0, 0)),
            Some(Status::Success)
        );
        assert_eq!(
            resolve_parent_status(Strategy::WaitAll, &progress(3, 2, 1, 0, 0)),
            Some(Status::Failed)
        );
    }

    #[test]
    fn fail_fast_fails_immediately() {
        assert_eq!(
            resolve_parent_status(Strategy::FailFast, &progress(3, 0, 1, 0, 2)),
            Some(Status::Failed)
        );
        assert_eq!(
            resolve_parent_status(Strategy::FailFast, &progress(3, 1, 0, 0, 2)),
            None
        );
    }

    #[test]
    fn best_effort_needs_one_success() {
        assert_eq!(
            resolve_parent_status(Strategy::BestEffort, &progress(3, 1, 2, 0, 0)),
            Some(Status::Success)
        );
        assert_eq!(
            resolve_parent_status(Strategy::BestEffort, &progress(3, 0, 3, 0, 0)),
            Some(Status::Failed)
        );
        assert_eq!(
            resolve_parent_status(Strategy::BestEffort, &progress(3, 0, 2, 0, 1)),
            None
        );
    }

    #[test]
    fn race_first_terminal_decides() {
        assert_eq!(
            resolve_parent_status(Strategy::Race, &progress(3, 1, 0, 0, 2)),
            Some(Status::Success)
        );
        assert_eq!(
            resolve_parent_status(Strategy::Race, &progress(3, 0, 1, 0, 2)),
            Some(Status::Failed)
        );
        assert_eq!(
            resolve_parent_status(Strategy::Race, &progress(3, 0, 0, 0, 3)),
            None
        );
    }

    #[test]
    fn empty_parent_succeeds() {
        for strategy in [
            Strategy::WaitAll,
            Strategy::FailFast,
            Strategy::BestEffort,
            Strategy::Race,
        ] {
            assert_eq!(
                resolve_parent_status(strategy, &progress(0, 0, 0, 0, 0)),
                Some(Status::Success)
            );
        }
    }

    #[test]
    fn collection_workers_table() {
        let mut meta = CollectionMeta {
            mode: CollectionMode::Sequential,
            batch: Some(3),
            continue_on_error: false,
            item_var: "item".into(),
            index_var: "index".into(),
            max_workers: Some(8),
            timeout: None,
            child_configs: vec![],
        };
        assert_eq!(collection_workers(&meta), 3);

        meta.batch = None;
        assert_eq!(collection_workers(&meta), 1);

        meta.mode = CollectionMode::Parallel;
        assert_eq!(collection_workers(&meta), 8);
    }
}
