//! Basic-task executor
//!
//! Runs one leaf task: re-parses the component binding against live workflow
//! state, invokes the bound adapter, and returns an [`ExecutionResult`] for
//! the response handler. Container, wait, and memory tasks have their own
//! drivers; this path covers agent, tool, and pure pass-through tasks.
//!
//! Run-time re-parsing is deterministic for a given context and never
//! mutates the persisted config snapshot.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::adapter::{AdapterRegistry, AgentRequest, ToolRequest};
use crate::config::{TaskConfig, TaskType};
use crate::context;
use crate::error::{OrdoError, Result};
use crate::events::{EventLog, EventPublisher, EventType, TaskEvent};
use crate::state::{ErrorInfo, ExecutionResult, TaskState};
use crate::store::{ConfigStore, StateStore};
use crate::template;
use crate::types::{Component, TaskExecId};
use crate::workflow::WorkflowState;

/// Executes basic (leaf) tasks through the adapter registry
#[derive(Clone)]
pub struct TaskExecutor {
    states: StateStore,
    configs: ConfigStore,
    registry: AdapterRegistry,
    events: EventLog,
}

impl TaskExecutor {
    pub fn new(
        states: StateStore,
        configs: ConfigStore,
        registry: AdapterRegistry,
        events: EventLog,
    ) -> Self {
        Self {
            states,
            configs,
            registry,
            events,
        }
    }

    /// Execute one basic task to an [`ExecutionResult`]
    ///
    /// Adapter failures become a failed result (the runtime decides retry);
    /// wiring problems (unknown adapter, wrong task type) are hard errors.
    #[instrument(skip(self, workflow, cancel), fields(exec_id = %task_exec_id))]
    pub async fn execute(
        &self,
        workflow: &WorkflowState,
        task_exec_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(OrdoError::Canceled);
        }

        let config = self.configs.get(task_exec_id).await?;
        if !matches!(config.task_type, TaskType::Basic) {
            return Err(OrdoError::validation(format!(
                "task {} is not a basic task",
                config.id
            )));
        }

        let state = self
            .states
            .update_state(task_exec_id, TaskState::mark_running)
            .await?;
        self.emit(&state, Component::Task, EventType::Started, Value::Null);

        let render_context = context::task_context(workflow, &state, &state.env);

        let result = match config.component() {
            Component::Agent => {
                self.run_agent(&config, &state, &render_context, cancel)
                    .await?
            }
            Component::Tool => {
                self.run_tool(&config, &state, &render_context, cancel)
                    .await?
            }
            // orchestrator leaf: pass the input through
            Component::Task => ExecutionResult::success(state.input.clone()),
        };

        debug!(status = %result.status, "execute finished");
        Ok(result)
    }

    async fn run_agent(
        &self,
        config: &TaskConfig,
        state: &TaskState,
        render_context: &Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let binding = config.agent.as_ref().expect("agent component");
        let adapter = self
            .registry
            .agent(&binding.id)
            .map_err(|e| OrdoError::validation(e.to_string()))?;

        // re-parse the binding config against live state
        let resolved = template::parse_map(&Value::Object(binding.config.clone()), render_context)?;
        let resolved = resolved
            .as_object()
            .cloned()
            .unwrap_or_default();
        let prompt = match &config.prompt {
            Some(p) => Some(template::render_string(p, render_context)?),
            None => None,
        };

        if cancel.is_cancelled() {
            return Err(OrdoError::Canceled);
        }

        self.emit(state, Component::Agent, EventType::Started, Value::Null);
        let request = AgentRequest {
            agent_id: binding.id.clone(),
            action: state.action_id.clone(),
            prompt,
            input: state.input.clone(),
            config: resolved,
            env: state.env.clone(),
        };

        match adapter.call(request).await {
            Ok(output) => {
                self.emit(state, Component::Agent, EventType::Success, Value::Null);
                Ok(ExecutionResult::success(output))
            }
            Err(e) => {
                let error = ErrorInfo::new("adapter_error", format!("agent {}: {e}", binding.id));
                self.emit(
                    state,
                    Component::Agent,
                    EventType::Failed,
                    serde_json::json!({"error": error.message}),
                );
                Ok(ExecutionResult::failure(error))
            }
        }
    }

    async fn run_tool(
        &self,
        config: &TaskConfig,
        state: &TaskState,
        render_context: &Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let binding = config.tool.as_ref().expect("tool component");
        let adapter = self
            .registry
            .tool(&binding.id)
            .map_err(|e| OrdoError::validation(e.to_string()))?;

        let resolved = template::parse_map(&Value::Object(binding.config.clone()), render_context)?;
        let resolved = resolved
            .as_object()
            .cloned()
            .unwrap_or_default();

        if cancel.is_cancelled() {
            return Err(OrdoError::Canceled);
        }

        self.emit(state, Component::Tool, EventType::Started, Value::Null);
        let request = ToolRequest {
            tool_id: binding.id.clone(),
            input: state.input.clone(),
            config: resolved,
            env: state.env.clone(),
        };

        match adapter.call(request).await {
            Ok(output) => {
                self.emit(state, Component::Tool, EventType::Success, Value::Null);
                Ok(ExecutionResult::success(output))
            }
            Err(e) => {
                let error = ErrorInfo::new("adapter_error", format!("tool {}: {e}", binding.id));
                self.emit(
                    state,
                    Component::Tool,
                    EventType::Failed,
                    serde_json::json!({"error": error.message}),
                );
                Ok(ExecutionResult::failure(error))
            }
        }
    }

    fn emit(&self, state: &TaskState, component: Component, event_type: EventType, details: Value) {
        self.events.publish(TaskEvent {
            seq: 0,
            timestamp_ms: 0,
            component,
            event_type,
            workflow_id: state.workflow_id.clone(),
            workflow_exec_id: state.workflow_exec_id.clone(),
            task_id: state.task_id.as_str().to_string(),
            task_exec_id: state.task_exec_id,
            details,
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
