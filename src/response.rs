//! Response handling - the tail of every task execution
//!
//! Applies the execution outcome to the state, runs the `outputs` transform,
//! updates a parallel parent's status (non-critical), normalizes transitions,
//! and determines the next task for the surrounding workflow driver.
//!
//! Failure isolation rules honored here:
//! - an `outputs` transform failure demotes the task to the failure path but
//!   keeps the original output
//! - the parent-status update never fails the child; anomalies are logged
//! - on context cancellation the current state response is returned without
//!   error propagation

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{TaskConfig, Transition};
use crate::context;
use crate::error::{OrdoError, Result};
use crate::events::{EventLog, EventPublisher, EventType, TaskEvent};
use crate::parallel::update_parent_status;
use crate::state::{ErrorInfo, TaskState};
use crate::store::{ConfigStore, StateStore};
use crate::template;
use crate::types::{Component, ExecutionType, Status, TaskExecId, TaskId};
use crate::workflow::{WorkflowConfig, WorkflowState};

/// What the workflow driver receives after a task completes
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub state: TaskState,
    pub on_success: Option<Transition>,
    pub on_error: Option<Transition>,
    pub next_task: Option<TaskId>,
}

/// Applies execution outcomes and computes transitions
#[derive(Clone)]
pub struct ResponseHandler {
    states: StateStore,
    configs: ConfigStore,
    events: EventLog,
}

impl ResponseHandler {
    pub fn new(states: StateStore, configs: ConfigStore, events: EventLog) -> Self {
        Self {
            states,
            configs,
            events,
        }
    }

    /// Handle the outcome of one execution
    ///
    /// `execution_error` comes from the execute path; `next_override` lets
    /// container drivers force the next task.
    #[instrument(skip_all, fields(exec_id = %task_exec_id))]
    pub async fn handle(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        execution_error: Option<ErrorInfo>,
        next_override: Option<TaskId>,
        cancel: &CancellationToken,
    ) -> Result<TaskResponse> {
        let mut state = self.states.get_state(task_exec_id).await?;
        let config = self.configs.get(task_exec_id).await?;

        let mut is_success = execution_error.is_none() && state.status != Status::Failed;
        let mut effective_error = execution_error;

        if is_success && !state.outputs_applied {
            // output transform before the terminal write; a failure demotes
            // to the failure path with the original output intact. The
            // applied flag keeps redeliveries from transforming twice.
            if let (Some(outputs), Some(_)) = (&config.outputs, &state.output) {
                match self.apply_output_transform(workflow, &state, outputs).await {
                    Ok(transformed) => {
                        state.output = Some(transformed);
                        state.outputs_applied = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "outputs transform failed; demoting to failure");
                        is_success = false;
                        effective_error =
                            Some(ErrorInfo::execution(format!("outputs transform: {e}")));
                    }
                }
            }
        }

        if is_success {
            state.mark_success(None);
        } else {
            let error = effective_error
                .clone()
                .or_else(|| state.error.clone())
                .unwrap_or_else(|| {
                    // parent aggregating child failures arrives without its
                    // own execution error
                    ErrorInfo::execution(format!("task {} failed", state.task_id))
                });
            state.mark_failed(error);
        }

        // persist, tolerating cancellation
        match self.states.upsert_state(state.clone()).await {
            Ok(()) => {}
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!("persist skipped: context canceled");
                } else {
                    return Err(e.into());
                }
            }
        }

        self.emit_terminal(&state, is_success);
        self.update_parent(&state).await;

        let render_context = context::task_context(workflow, &state, &state.env);
        let on_success = normalize_transition(config.on_success.as_ref(), &render_context)?;
        let on_error = normalize_transition(config.on_error.as_ref(), &render_context)?;

        let next_task = match next_override {
            Some(next) => Some(next),
            None => workflow_config.determine_next(&config, is_success),
        };

        if !is_success && on_error.as_ref().and_then(|t| t.next.as_ref()).is_none() {
            let message = state
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            return Err(OrdoError::Execution(format!(
                "task failed with no error transition defined: {message}"
            )));
        }

        Ok(TaskResponse {
            state,
            on_success,
            on_error,
            next_task,
        })
    }

    /// Render the `outputs` template against the final context
    async fn apply_output_transform(
        &self,
        workflow: &WorkflowState,
        state: &TaskState,
        outputs: &Value,
    ) -> Result<Value> {
        let mut render_context = context::task_context(workflow, state, &state.env);
        let map = render_context.as_object_mut().expect("context is a map");
        map.insert("output".to_string(), state.output.clone().unwrap_or(Value::Null));
        map.insert("input".to_string(), state.input.clone());

        // children of a collection see their item/index again
        if let Some(parent_id) = state.parent_state_id {
            if let Ok(parent) = self.states.get_state(parent_id).await {
                if parent.execution_type == ExecutionType::Collection {
                    if let Some(cs) = &parent.collection_state {
                        let item = state.input.get(&cs.item_var).cloned();
                        let index = state.input.get(&cs.index_var).cloned();
                        if let Some(item) = item {
                            map.insert(cs.item_var.clone(), item.clone());
                            map.insert("item".to_string(), item);
                        }
                        if let Some(index) = index {
                            map.insert(cs.index_var.clone(), index.clone());
                            map.insert("index".to_string(), index);
                        }
                    }
                }
            }
        }

        template::parse_map(outputs, &render_context).map_err(Into::into)
    }

    /// Non-critical parent status update; never fails the child
    async fn update_parent(&self, state: &TaskState) {
        let Some(parent_id) = state.parent_state_id else {
            return;
        };
        let parent = match self.states.get_state(parent_id).await {
            Ok(parent) => parent,
            Err(e) => {
                warn!(parent = %parent_id, error = %e, "parent fetch failed");
                return;
            }
        };
        if parent.execution_type != ExecutionType::Parallel {
            return;
        }

        let strategy = match self.configs.get_metadata(parent_id).await {
            Ok(metadata) => match metadata.as_parallel() {
                Ok(meta) => meta.strategy,
                Err(e) => {
                    warn!(parent = %parent_id, error = %e, "metadata mismatch; defaulting to wait_all");
                    Default::default()
                }
            },
            Err(e) => {
                warn!(parent = %parent_id, error = %e, "metadata missing; defaulting to wait_all");
                Default::default()
            }
        };

        if let Err(e) = update_parent_status(&self.states, parent_id, strategy, state).await {
            warn!(parent = %parent_id, error = %e, "parent status update failed");
        }
    }

    fn emit_terminal(&self, state: &TaskState, is_success: bool) {
        let details = match &state.error {
            Some(error) => json!({"error": error.message, "category": error.category}),
            None => Value::Null,
        };
        self.events.publish(TaskEvent {
            seq: 0,
            timestamp_ms: 0,
            component: Component::Task,
            event_type: if is_success {
                EventType::Success
            } else {
                EventType::Failed
            },
            workflow_id: state.workflow_id.clone(),
            workflow_exec_id: state.workflow_exec_id.clone(),
            task_id: state.task_id.as_str().to_string(),
            task_exec_id: state.task_exec_id,
            details,
        });
    }
}

/// Clone a transition and render its `with` against the live context
fn normalize_transition(
    transition: Option<&Transition>,
    render_context: &Value,
) -> Result<Option<Transition>> {
    let Some(transition) = transition else {
        return Ok(None);
    };
    let with = match &transition.with {
        Some(with) => {
            let rendered = template::parse_map(&Value::Object(with.clone()), render_context)?;
            rendered.as_object().cloned()
        }
        None => None,
    };
    Ok(Some(Transition {
        next: transition.next.clone(),
        with,
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentBinding, Transition};
    use crate::create_state::CreateState;
    use crate::types::TaskId;
    use serde_json::Map;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    struct Fixture {
        handler: ResponseHandler,
        create_state: CreateState,
        states: StateStore,
        events: EventLog,
    }

    fn fixture() -> Fixture {
        let states = StateStore::new();
        let configs = ConfigStore::new();
        let events = EventLog::new();
        Fixture {
            handler: ResponseHandler::new(states.clone(), configs.clone(), events.clone()),
            create_state: CreateState::new(states.clone(), configs),
            states,
            events,
        }
    }

    fn workflow() -> WorkflowState {
        WorkflowState::new("wf", "wf-exec-1").with_input(json!({"name": "Ada"}))
    }

    async fn seeded_state(f: &Fixture, config: &TaskConfig, output: Option<Value>) -> TaskState {
        let state = f
            .create_state
            .create_state(&workflow(), &WorkflowConfig::default(), config)
            .await
            .unwrap();
        f.states
            .update_state(state.task_exec_id, |s| {
                s.mark_running();
                s.output = output.clone();
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_applies_output_transform() {
        let f = fixture();
        let mut config = TaskConfig::basic(tid("greet"));
        config.agent = Some(AgentBinding {
            id: "a1".into(),
            config: Map::new(),
        });
        config.outputs = Some(json!({"msg": "Hello, {{ output.text }}"}));

        let state = seeded_state(&f, &config, Some(json!({"text": "Ada"}))).await;
        let response = f
            .handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.state.status, Status::Success);
        assert_eq!(response.state.output, Some(json!({"msg": "Hello, Ada"})));
    }

    #[tokio::test]
    async fn failure_synthesizes_error_and_errors_without_transition() {
        let f = fixture();
        let config = TaskConfig::basic(tid("greet"));
        let state = seeded_state(&f, &config, None).await;

        let err = f
            .handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                Some(ErrorInfo::execution("adapter exploded")),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("task failed with no error transition defined"));

        // state persisted as failed regardless
        let stored = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert!(stored.error.unwrap().message.contains("adapter exploded"));
    }

    #[tokio::test]
    async fn failure_with_on_error_returns_transition() {
        let f = fixture();
        let mut config = TaskConfig::basic(tid("risky"));
        config.on_error = Some(Transition {
            next: Some(tid("cleanup")),
            with: Some(
                json!({"failed_name": "{{ workflow.input.name }}"})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        });

        let state = seeded_state(&f, &config, None).await;
        let response = f
            .handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                Some(ErrorInfo::execution("boom")),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.state.status, Status::Failed);
        let on_error = response.on_error.unwrap();
        assert_eq!(on_error.next, Some(tid("cleanup")));
        // with rendered against the live context
        assert_eq!(on_error.with.unwrap()["failed_name"], "Ada");
        assert_eq!(response.next_task, None);
    }

    #[tokio::test]
    async fn transform_failure_demotes_but_keeps_output() {
        let f = fixture();
        let mut config = TaskConfig::basic(tid("greet"));
        config.outputs = Some(json!({"msg": "{{ output.text"})); // unterminated
        config.on_error = Some(Transition {
            next: Some(tid("cleanup")),
            with: None,
        });

        let state = seeded_state(&f, &config, Some(json!({"text": "Ada"}))).await;
        let response = f
            .handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.state.status, Status::Failed);
        // original output preserved
        assert_eq!(response.state.output, Some(json!({"text": "Ada"})));
        assert!(response
            .state
            .error
            .unwrap()
            .message
            .contains("outputs transform"));
    }

    #[tokio::test]
    async fn next_override_wins() {
        let f = fixture();
        let config = TaskConfig::basic(tid("greet"));
        let state = seeded_state(&f, &config, Some(json!("out"))).await;

        let response = f
            .handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                None,
                Some(tid("forced")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.next_task, Some(tid("forced")));
    }

    #[tokio::test]
    async fn determine_next_follows_declaration_order() {
        let f = fixture();
        let first = TaskConfig::basic(tid("first"));
        let wf_config = WorkflowConfig {
            id: "wf".into(),
            tasks: vec![first.clone(), TaskConfig::basic(tid("second"))],
            env: Default::default(),
        };

        let state = seeded_state(&f, &first, Some(json!("out"))).await;
        let response = f
            .handler
            .handle(
                &workflow(),
                &wf_config,
                state.task_exec_id,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.next_task, Some(tid("second")));
    }

    #[tokio::test]
    async fn terminal_event_emitted() {
        let f = fixture();
        let config = TaskConfig::basic(tid("greet"));
        let state = seeded_state(&f, &config, Some(json!("out"))).await;

        f.handler
            .handle(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = f.events.for_execution(state.task_exec_id);
        assert!(events
            .iter()
            .any(|e| e.subject().starts_with("task.success.")));
    }
}
