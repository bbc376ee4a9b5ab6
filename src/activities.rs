//! Activity surface for the durable workflow runtime
//!
//! Wires the stores, adapters, and use cases into the idempotent operations
//! the runtime dispatches, all keyed by `task_exec_id`:
//!
//! - [`TaskActivities::create_task_state`] - config → persisted state
//! - [`TaskActivities::run_task`] - execute to a [`TaskResponse`]
//! - [`TaskActivities::deliver_signal`] / [`TaskActivities::complete_wait`] /
//!   [`TaskActivities::timeout_wait`] - the wait-task surface
//! - [`TaskActivities::cancel_task`] - observe an external cancel
//!
//! At-least-once delivery is tolerated: re-running a task whose state is
//! already terminal skips execution and recomputes the response from the
//! stored row.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::adapter::AdapterRegistry;
use crate::config::{TaskConfig, TaskType};
use crate::create_state::CreateState;
use crate::error::{OrdoError, Result};
use crate::events::EventLog;
use crate::memory::MemoryDriver;
use crate::parallel::FanOutDriver;
use crate::response::{ResponseHandler, TaskResponse};
use crate::state::{ExecutionResult, TaskState};
use crate::store::{ConfigStore, StateStore};
use crate::task_executor::TaskExecutor;
use crate::types::{Status, TaskExecId};
use crate::wait::{Signal, SignalOutcome, WaitDriver};
use crate::workflow::{WorkflowConfig, WorkflowState};

/// Facade over the task execution core
#[derive(Clone)]
pub struct TaskActivities {
    states: StateStore,
    configs: ConfigStore,
    events: EventLog,
    create_state: CreateState,
    executor: Arc<TaskExecutor>,
    handler: Arc<ResponseHandler>,
    fanout: FanOutDriver,
    wait: WaitDriver,
    memory: MemoryDriver,
}

impl TaskActivities {
    /// Build the full stack over fresh in-memory stores
    pub fn new(registry: AdapterRegistry) -> Self {
        Self::with_stores(StateStore::new(), ConfigStore::new(), registry, EventLog::new())
    }

    /// Build over existing stores (shared with other components)
    pub fn with_stores(
        states: StateStore,
        configs: ConfigStore,
        registry: AdapterRegistry,
        events: EventLog,
    ) -> Self {
        let create_state = CreateState::new(states.clone(), configs.clone());
        let executor = Arc::new(TaskExecutor::new(
            states.clone(),
            configs.clone(),
            registry.clone(),
            events.clone(),
        ));
        let handler = Arc::new(ResponseHandler::new(
            states.clone(),
            configs.clone(),
            events.clone(),
        ));
        let memory = MemoryDriver::new(states.clone(), configs.clone(), registry);
        let fanout = FanOutDriver::new(
            states.clone(),
            configs.clone(),
            executor.clone(),
            handler.clone(),
            memory.clone(),
            events.clone(),
        );
        let wait = WaitDriver::new(
            states.clone(),
            configs.clone(),
            executor.clone(),
            events.clone(),
        );

        Self {
            states,
            configs,
            events,
            create_state,
            executor,
            handler,
            fanout,
            wait,
            memory,
        }
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Create the persisted state for one task execution
    pub async fn create_task_state(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        config: &TaskConfig,
    ) -> Result<TaskState> {
        self.create_state
            .create_state(workflow, workflow_config, config)
            .await
    }

    /// Run one task execution to its response
    ///
    /// Dispatches on the task type; wait tasks park and return their waiting
    /// state (completion happens through the signal surface). On success the
    /// task's output is recorded into the live workflow state.
    #[instrument(skip(self, workflow, workflow_config, cancel), fields(exec_id = %task_exec_id))]
    pub async fn run_task(
        &self,
        workflow: &mut WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<TaskResponse> {
        let state = self.states.get_state(task_exec_id).await?;
        let config = self.configs.get(task_exec_id).await?;

        // at-least-once: a re-dispatched terminal task recomputes its
        // response without executing again
        if state.status.is_terminal() {
            debug!(status = %state.status, "already terminal; recomputing response");
            return self
                .finish(workflow, workflow_config, task_exec_id, None, cancel)
                .await;
        }

        let result: ExecutionResult = match config.task_type {
            TaskType::Basic => {
                self.executor
                    .execute(workflow, task_exec_id, cancel)
                    .await?
            }
            TaskType::Memory => {
                match self.memory.execute(workflow, task_exec_id, cancel).await {
                    Ok(result) => result,
                    Err(OrdoError::Canceled) => return Err(OrdoError::Canceled),
                    // backend and payload failures flow through the
                    // response handler like any execution failure
                    Err(e) => ExecutionResult::failure(crate::state::ErrorInfo::new(
                        e.category().token(),
                        e.to_string(),
                    )),
                }
            }
            TaskType::Wait => {
                let state = self.wait.begin_wait(task_exec_id).await?;
                return Ok(TaskResponse {
                    state,
                    on_success: None,
                    on_error: None,
                    next_task: None,
                });
            }
            TaskType::Parallel => {
                self.fanout
                    .run_parallel(workflow, workflow_config, task_exec_id, cancel)
                    .await?
            }
            TaskType::Collection => {
                self.fanout
                    .run_collection(workflow, workflow_config, task_exec_id, cancel)
                    .await?
            }
            TaskType::Composite => {
                self.fanout
                    .run_composite(workflow, workflow_config, task_exec_id, cancel)
                    .await?
            }
        };

        // stamp the raw output before response handling so the outputs
        // transform has something to read
        if let Some(output) = &result.output {
            let output = output.clone();
            self.states
                .update_state(task_exec_id, move |s| {
                    if s.output.is_none() || !s.status.is_terminal() {
                        s.output = Some(output);
                    }
                })
                .await?;
        }

        self.finish(workflow, workflow_config, task_exec_id, result.error, cancel)
            .await
    }

    async fn finish(
        &self,
        workflow: &mut WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        execution_error: Option<crate::state::ErrorInfo>,
        cancel: &CancellationToken,
    ) -> Result<TaskResponse> {
        let response = self
            .handler
            .handle(
                workflow,
                workflow_config,
                task_exec_id,
                execution_error,
                None,
                cancel,
            )
            .await?;

        if response.state.status == Status::Success {
            if let Some(output) = &response.state.output {
                workflow.record_output(&response.state.task_id, output.clone());
            }
        }
        Ok(response)
    }

    /// Deliver a signal to a waiting task
    pub async fn deliver_signal(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        signal: &Signal,
        cancel: &CancellationToken,
    ) -> Result<SignalOutcome> {
        self.wait
            .process_signal(workflow, workflow_config, task_exec_id, signal, cancel)
            .await
    }

    /// Complete a wait task whose condition was met
    pub async fn complete_wait(
        &self,
        workflow: &mut WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<TaskResponse> {
        let state = self.states.get_state(task_exec_id).await?;
        if state.status != Status::Running {
            return Err(OrdoError::validation(format!(
                "wait task {} is not running (status {})",
                state.task_id, state.status
            )));
        }
        self.finish(workflow, workflow_config, task_exec_id, None, cancel)
            .await
    }

    /// Runtime timer fired for a waiting task
    pub async fn timeout_wait(&self, task_exec_id: TaskExecId) -> Result<TaskState> {
        self.wait.timeout_wait(task_exec_id).await
    }

    /// Observe an external cancel for one execution
    pub async fn cancel_task(&self, task_exec_id: TaskExecId) -> Result<TaskState> {
        self.states.cancel(task_exec_id).await.map_err(Into::into)
    }
}

// ============================================================================
// TESTS
// ============================================================================
