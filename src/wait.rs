//! Wait tasks and signal processing
//!
//! A wait task parks at `waiting` until the runtime delivers a matching
//! signal whose condition evaluates true. Signal deliveries that do not
//! match the configured name are normal control flow, not errors: they
//! return `condition_met: false` without touching state.
//!
//! A configured `processor` sub-task runs on each matching delivery; its
//! output is stored on the wait state (`processor_output`) and exposed to
//! the condition as `processor.output`.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::condition;
use crate::config::TaskType;
use crate::create_state::CreateState;
use crate::error::{OrdoError, Result};
use crate::events::{EventLog, EventPublisher, EventType, TaskEvent};
use crate::state::{ErrorInfo, TaskState};
use crate::store::{ConfigStore, StateStore};
use crate::task_executor::TaskExecutor;
use crate::types::{Component, Status, TaskExecId};
use crate::workflow::{WorkflowConfig, WorkflowState};

// ============================================================================
// SIGNALS
// ============================================================================

/// An external signal addressed to a waiting task
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub payload: Value,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Result of one signal delivery
#[derive(Debug, Clone, PartialEq)]
pub struct SignalOutcome {
    pub condition_met: bool,
    pub processor_output: Option<Value>,
}

// ============================================================================
// WAIT DRIVER
// ============================================================================

/// Drives wait tasks: parking, signal evaluation, timeout
#[derive(Clone)]
pub struct WaitDriver {
    states: StateStore,
    configs: ConfigStore,
    create_state: CreateState,
    executor: std::sync::Arc<TaskExecutor>,
    events: EventLog,
}

impl WaitDriver {
    pub fn new(
        states: StateStore,
        configs: ConfigStore,
        executor: std::sync::Arc<TaskExecutor>,
        events: EventLog,
    ) -> Self {
        let create_state = CreateState::new(states.clone(), configs.clone());
        Self {
            states,
            configs,
            create_state,
            executor,
            events,
        }
    }

    /// Park a dispatched wait task at `waiting`
    #[instrument(skip(self), fields(exec_id = %task_exec_id))]
    pub async fn begin_wait(&self, task_exec_id: TaskExecId) -> Result<TaskState> {
        let config = self.configs.get(task_exec_id).await?;
        if config.task_type != TaskType::Wait {
            return Err(OrdoError::validation(format!(
                "task {} is not a wait task",
                config.id
            )));
        }

        let state = self
            .states
            .update_state(task_exec_id, |s| {
                s.mark_running();
                s.mark_waiting();
            })
            .await?;
        self.emit(&state, EventType::Started, Value::Null);
        self.emit(&state, EventType::Waiting, Value::Null);
        Ok(state)
    }

    /// Process one signal delivery against a waiting task
    ///
    /// Hard errors: wrong task type, task not waiting. A name mismatch is a
    /// non-event. Condition evaluation errors fail the task.
    #[instrument(skip(self, workflow, workflow_config, signal, cancel), fields(exec_id = %task_exec_id, signal = %signal.name))]
    pub async fn process_signal(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_exec_id: TaskExecId,
        signal: &Signal,
        cancel: &CancellationToken,
    ) -> Result<SignalOutcome> {
        if cancel.is_cancelled() {
            return Err(OrdoError::Canceled);
        }

        let state = self.states.get_state(task_exec_id).await?;
        let config = self.configs.get(task_exec_id).await?;
        let block = config.wait.as_ref().ok_or_else(|| {
            OrdoError::validation(format!("task {} is not a wait task", config.id))
        })?;
        if state.status != Status::Waiting {
            return Err(OrdoError::validation(format!(
                "task {} is not waiting (status {})",
                config.id, state.status
            )));
        }

        // mismatched name: normal control flow, no mutation
        if signal.name != block.wait_for {
            debug!(expected = %block.wait_for, "signal name mismatch");
            return Ok(SignalOutcome {
                condition_met: false,
                processor_output: None,
            });
        }

        // optional processor run, freshest output wins
        let processor_output = match &block.processor {
            Some(processor_config) => {
                let output = self
                    .run_processor(workflow, workflow_config, processor_config, signal, cancel)
                    .await?;
                self.states
                    .update_state(task_exec_id, |s| {
                        let mut existing = s
                            .output
                            .as_ref()
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        existing.insert("processor_output".to_string(), output.clone());
                        s.output = Some(Value::Object(existing));
                    })
                    .await?;
                Some(output)
            }
            None => prior_processor_output(&state),
        };

        let mut context = json!({
            "signal": {"name": signal.name, "payload": signal.payload},
            "task": {
                "id": state.task_id.as_str(),
                "status": state.status,
                "input": state.input,
                "output": state.output,
            },
            "workflow": {"id": workflow.workflow_id, "exec_id": workflow.workflow_exec_id},
        });
        if let Some(output) = &processor_output {
            context["processor"] = json!({ "output": output });
        }

        let condition_met = match condition::evaluate(&block.condition, &context) {
            Ok(met) => met,
            Err(e) => {
                warn!(error = %e, "condition evaluation failed");
                let failed = self
                    .states
                    .update_state(task_exec_id, |s| {
                        s.mark_failed(ErrorInfo::new("CONDITION_EVAL_ERROR", e.to_string()));
                    })
                    .await?;
                self.emit(&failed, EventType::Failed, json!({"error": e.to_string()}));
                return Err(e);
            }
        };

        if condition_met {
            let resumed = self
                .states
                .update_state(task_exec_id, |s| {
                    s.status = Status::Running;
                })
                .await?;
            self.emit(&resumed, EventType::WaitingEnded, Value::Null);
        }

        Ok(SignalOutcome {
            condition_met,
            processor_output,
        })
    }

    /// Runtime timer fired before a matching signal arrived
    #[instrument(skip(self), fields(exec_id = %task_exec_id))]
    pub async fn timeout_wait(&self, task_exec_id: TaskExecId) -> Result<TaskState> {
        let state = self
            .states
            .update_state(task_exec_id, |s| {
                if s.status == Status::Waiting {
                    s.mark_failed(ErrorInfo::execution("wait timed out"));
                }
            })
            .await?;
        self.emit(&state, EventType::WaitingTimedOut, Value::Null);
        Ok(state)
    }

    /// Run the processor sub-task inline and return its output
    async fn run_processor(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        processor_config: &crate::config::TaskConfig,
        signal: &Signal,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        // the processor sees the signal payload through the workflow input
        let mut processor_workflow = workflow.clone();
        if let Some(map) = processor_workflow.input.as_object_mut() {
            map.insert("signal".to_string(), signal.payload.clone());
        }

        let state = self
            .create_state
            .create_state(&processor_workflow, workflow_config, processor_config)
            .await?;
        let result = self
            .executor
            .execute(&processor_workflow, state.task_exec_id, cancel)
            .await?;

        match result.error {
            None => {
                let output = result.output.unwrap_or(Value::Null);
                self.states
                    .update_state(state.task_exec_id, |s| {
                        s.mark_success(Some(output.clone()));
                    })
                    .await?;
                Ok(output)
            }
            Some(error) => {
                self.states
                    .update_state(state.task_exec_id, |s| s.mark_failed(error.clone()))
                    .await?;
                Err(OrdoError::adapter(format!(
                    "wait processor failed: {}",
                    error.message
                )))
            }
        }
    }

    fn emit(&self, state: &TaskState, event_type: EventType, details: Value) {
        self.events.publish(TaskEvent {
            seq: 0,
            timestamp_ms: 0,
            component: Component::Task,
            event_type,
            workflow_id: state.workflow_id.clone(),
            workflow_exec_id: state.workflow_exec_id.clone(),
            task_id: state.task_id.as_str().to_string(),
            task_exec_id: state.task_exec_id,
            details,
        });
    }
}

fn prior_processor_output(state: &TaskState) -> Option<Value> {
    state
        .output
        .as_ref()
        .and_then(|o| o.get("processor_output"))
        .cloned()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, MockAgent};
    use crate::config::{AgentBinding, TaskConfig, WaitBlock};
    use crate::types::TaskId;
    use serde_json::Map;
    use std::sync::Arc;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    struct Fixture {
        driver: WaitDriver,
        create_state: CreateState,
        states: StateStore,
        events: EventLog,
        agent: Arc<MockAgent>,
    }

    fn fixture() -> Fixture {
        let states = StateStore::new();
        let configs = ConfigStore::new();
        let events = EventLog::new();
        let registry = AdapterRegistry::new();
        let agent = Arc::new(MockAgent::new());
        registry.register_agent("checker", agent.clone());

        let executor = Arc::new(TaskExecutor::new(
            states.clone(),
            configs.clone(),
            registry,
            events.clone(),
        ));
        Fixture {
            driver: WaitDriver::new(states.clone(), configs.clone(), executor, events.clone()),
            create_state: CreateState::new(states.clone(), configs),
            states,
            events,
            agent,
        }
    }

    fn workflow() -> WorkflowState {
        WorkflowState::new("wf", "wf-exec-1").with_input(json!({}))
    }

    fn wait_config(id: &str, condition: &str, processor: Option<TaskConfig>) -> TaskConfig {
        let mut config = TaskConfig::basic(tid(id));
        config.task_type = TaskType::Wait;
        config.wait = Some(WaitBlock {
            wait_for: "approve".into(),
            condition: condition.into(),
            processor: processor.map(Box::new),
            timeout: None,
        });
        config
    }

    async fn parked(f: &Fixture, config: &TaskConfig) -> TaskState {
        let state = f
            .create_state
            .create_state(&workflow(), &WorkflowConfig::default(), config)
            .await
            .unwrap();
        f.driver.begin_wait(state.task_exec_id).await.unwrap()
    }

    #[tokio::test]
    async fn begin_wait_parks_and_emits() {
        let f = fixture();
        let config = wait_config("gate", "signal.payload.approved == true", None);
        let state = parked(&f, &config).await;

        assert_eq!(state.status, Status::Waiting);
        let events = f.events.for_execution(state.task_exec_id);
        assert!(events.iter().any(|e| e.subject().starts_with("task.waiting.")));
    }

    #[tokio::test]
    async fn matching_signal_meets_condition() {
        let f = fixture();
        let config = wait_config("gate", "signal.payload.approved == true", None);
        let state = parked(&f, &config).await;

        let outcome = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("approve", json!({"approved": true})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.condition_met);
        // waiting → running
        let resumed = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(resumed.status, Status::Running);
        assert!(f
            .events
            .for_execution(state.task_exec_id)
            .iter()
            .any(|e| e.subject().starts_with("task.waiting_ended.")));
    }

    #[tokio::test]
    async fn name_mismatch_is_not_an_error_and_does_not_mutate() {
        let f = fixture();
        let config = wait_config("gate", "signal.payload.approved == true", None);
        let state = parked(&f, &config).await;

        let outcome = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("reject", json!({"approved": true})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.condition_met);
        let unchanged = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(unchanged.status, Status::Waiting);
    }

    #[tokio::test]
    async fn unmet_condition_stays_waiting() {
        let f = fixture();
        let config = wait_config("gate", "signal.payload.approved == true", None);
        let state = parked(&f, &config).await;

        let outcome = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("approve", json!({"approved": false})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.condition_met);
        let unchanged = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(unchanged.status, Status::Waiting);
    }

    #[tokio::test]
    async fn condition_eval_error_fails_the_task() {
        let f = fixture();
        // ordering comparison against a string payload
        let config = wait_config("gate", "signal.payload.approved > 2", None);
        let state = parked(&f, &config).await;

        let err = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("approve", json!({"approved": "yes"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CONDITION_EVAL_ERROR"));

        let failed = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.error.unwrap().category, "CONDITION_EVAL_ERROR");
    }

    #[tokio::test]
    async fn signal_to_non_waiting_task_is_hard_error() {
        let f = fixture();
        let config = wait_config("gate", "true", None);
        let state = f
            .create_state
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap();
        // never parked: still pending

        let err = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("approve", json!({})),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not waiting"));
    }

    #[tokio::test]
    async fn processor_output_feeds_condition() {
        let f = fixture();
        f.agent.queue_response(json!({"score": 0.9}));

        let mut processor = TaskConfig::basic(tid("score-check"));
        processor.agent = Some(AgentBinding {
            id: "checker".into(),
            config: Map::new(),
        });

        let config = wait_config("gate", "processor.output.score > 0.5", Some(processor));
        let state = parked(&f, &config).await;

        let outcome = f
            .driver
            .process_signal(
                &workflow(),
                &WorkflowConfig::default(),
                state.task_exec_id,
                &Signal::new("approve", json!({"request": 7})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.condition_met);
        assert_eq!(outcome.processor_output, Some(json!({"score": 0.9})));

        // stored for future deliveries
        let stored = f.states.get_state(state.task_exec_id).await.unwrap();
        assert_eq!(stored.output.unwrap()["processor_output"]["score"], 0.9);
    }

    #[tokio::test]
    async fn timeout_fails_waiting_task() {
        let f = fixture();
        let config = wait_config("gate", "true", None);
        let state = parked(&f, &config).await;

        let timed_out = f.driver.timeout_wait(state.task_exec_id).await.unwrap();
        assert_eq!(timed_out.status, Status::Failed);
        assert!(f
            .events
            .for_execution(state.task_exec_id)
            .iter()
            .any(|e| e.subject().starts_with("task.waiting_timed_out.")));
    }
}
