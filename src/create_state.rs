//! Create-state use case
//!
//! Translates a [`TaskConfig`] into a persisted [`TaskState`] plus, for
//! container tasks, the metadata blob that later drives child fan-out.
//!
//! Write order matters for crash recovery: the config snapshot lands first,
//! so a resuming worker never observes a state without its config. Any later
//! failure compensates by deleting what was already written - except
//! collection expansion failures, which mark the parent failed and keep the
//! row so the response handler can route the error.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::collection::{self, DEFAULT_MAX_COLLECTION_ITEMS};
use crate::config::{TaskConfig, TaskType};
use crate::context;
use crate::error::{OrdoError, Result};
use crate::state::{ErrorInfo, PartialState, TaskState};
use crate::store::{
    CollectionMeta, CompositeMeta, ConfigStore, ParallelMeta, ParentMetadata, StateStore,
};
use crate::template;
use crate::types::TaskExecId;
use crate::workflow::{WorkflowConfig, WorkflowState};

/// Creates persisted task states from configs
#[derive(Clone)]
pub struct CreateState {
    states: StateStore,
    configs: ConfigStore,
    max_collection_items: usize,
}

impl CreateState {
    pub fn new(states: StateStore, configs: ConfigStore) -> Self {
        Self {
            states,
            configs,
            max_collection_items: DEFAULT_MAX_COLLECTION_ITEMS,
        }
    }

    /// Override the collection size bound (tests, constrained deployments)
    pub fn with_max_collection_items(mut self, max: usize) -> Self {
        self.max_collection_items = max;
        self
    }

    /// Create the state (and metadata) for one task execution
    #[instrument(skip(self, workflow, workflow_config, config), fields(task = %config.id))]
    pub async fn create_state(
        &self,
        workflow: &WorkflowState,
        workflow_config: &WorkflowConfig,
        config: &TaskConfig,
    ) -> Result<TaskState> {
        config.validate()?;

        let task_exec_id = TaskExecId::mint();

        // config first; compensate on any later failure
        self.configs.save(task_exec_id, config.clone()).await?;

        let env = config.merged_env(&workflow_config.env);
        let partial = match build_partial(workflow, config, env, None) {
            Ok(partial) => partial,
            Err(e) => {
                self.configs.delete(task_exec_id).await.ok();
                return Err(e);
            }
        };
        let state = TaskState::from_partial(task_exec_id, partial);

        if let Err(e) = self.states.upsert_state(state.clone()).await {
            self.configs.delete(task_exec_id).await.ok();
            return Err(e.into());
        }

        if let Err(e) = validate_input_schema(config, &state.input) {
            self.configs.delete_all(task_exec_id).await.ok();
            return Err(e);
        }

        if config.is_parent() {
            if let Err(e) = self.prepare_metadata(workflow, config, &state).await {
                // expansion failures keep the row: the parent fails and the
                // response handler routes it
                self.states
                    .update_state(task_exec_id, |s| {
                        s.mark_failed(ErrorInfo::execution(e.to_string()));
                    })
                    .await
                    .ok();
                return Err(e);
            }
        }

        debug!(exec_id = %task_exec_id, "task state created");
        self.states.get_state(task_exec_id).await.map_err(Into::into)
    }

    /// Build and store the parent→children metadata blob
    async fn prepare_metadata(
        &self,
        workflow: &WorkflowState,
        config: &TaskConfig,
        state: &TaskState,
    ) -> Result<()> {
        let metadata = match config.task_type {
            TaskType::Parallel | TaskType::Composite => {
                static_parent_metadata(config).expect("validated container block")
            }
            TaskType::Collection => {
                let block = config.collection.as_ref().expect("validated collection block");
                let context = context::task_context(workflow, state, &state.env);
                let expanded =
                    collection::evaluate_items(block, &context, self.max_collection_items)?;
                let children =
                    collection::materialize_child_configs(config, block, &expanded, &context)?;

                let collection_state = collection::initial_collection_state(block, &expanded);
                self.states
                    .update_state(state.task_exec_id, |s| {
                        s.collection_state = Some(collection_state.clone());
                    })
                    .await?;

                ParentMetadata::Collection(CollectionMeta {
                    mode: block.mode,
                    batch: block.batch,
                    continue_on_error: block.continue_on_error,
                    item_var: block.item_var().to_string(),
                    index_var: block.index_var().to_string(),
                    max_workers: block.max_workers,
                    timeout: block.timeout.clone(),
                    child_configs: children,
                })
            }
            _ => return Ok(()),
        };

        self.configs
            .save_metadata(state.task_exec_id, metadata)
            .await
            .map_err(Into::into)
    }
}

/// Metadata for containers whose children are declared statically
///
/// Parallel and composite blocks carry their child configs verbatim;
/// collections need live-state expansion and are handled separately.
/// Create-children uses this for container children nested one level down.
pub(crate) fn static_parent_metadata(config: &TaskConfig) -> Option<ParentMetadata> {
    match config.task_type {
        TaskType::Parallel => {
            let block = config.parallel.as_ref()?;
            Some(ParentMetadata::Parallel(ParallelMeta {
                strategy: block.strategy,
                max_workers: block.max_workers,
                timeout: block.timeout.clone(),
                child_configs: block.tasks.clone(),
            }))
        }
        TaskType::Composite => {
            let block = config.composite.as_ref()?;
            Some(ParentMetadata::Composite(CompositeMeta {
                child_configs: block.tasks.clone(),
            }))
        }
        _ => None,
    }
}

/// Derive the partial state for a config (shared with create-children)
pub(crate) fn build_partial(
    workflow: &WorkflowState,
    config: &TaskConfig,
    env: HashMap<String, String>,
    parent_state_id: Option<TaskExecId>,
) -> Result<PartialState> {
    // render `with` against the live workflow context
    let mut render_context = context::workflow_context(workflow);
    if let Some(map) = render_context.as_object_mut() {
        map.insert("env".to_string(), Value::Object(context::safe_env(&env)));
    }

    let input = match &config.with {
        Some(with) => template::parse_map(&Value::Object(with.clone()), &render_context)?,
        // parents get an empty-but-present input so drivers can stamp
        // metadata keys later
        None => Value::Object(Map::new()),
    };

    Ok(PartialState {
        workflow_id: workflow.workflow_id.clone(),
        workflow_exec_id: workflow.workflow_exec_id.clone(),
        task_id: config.id.clone(),
        parent_state_id,
        component: config.component(),
        execution_type: config.execution_type(),
        input,
        action_id: config.action.clone(),
        env,
    })
}

/// Validate the rendered input against the config's declared schema
fn validate_input_schema(config: &TaskConfig, input: &Value) -> Result<()> {
    let Some(schema) = &config.input_schema else {
        return Ok(());
    };
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| OrdoError::validation(format!("task {}: bad input schema: {e}", config.id)))?;

    if let Err(errors) = compiled.validate(input) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(OrdoError::validation(format!(
            "task {}: input failed schema validation: {}",
            config.id,
            detail.join("; ")
        )));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentBinding, CollectionBlock};
    use crate::types::{CollectionMode, Component, ExecutionType, Status, TaskId};
    use serde_json::json;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn workflow() -> WorkflowState {
        WorkflowState::new("wf", "wf-exec-1").with_input(json!({"name": "Ada", "list": ["a", "b"]}))
    }

    fn use_case() -> (CreateState, StateStore, ConfigStore) {
        let states = StateStore::new();
        let configs = ConfigStore::new();
        (
            CreateState::new(states.clone(), configs.clone()),
            states,
            configs,
        )
    }

    #[tokio::test]
    async fn basic_agent_state() {
        let (uc, states, configs) = use_case();
        let mut config = TaskConfig::basic(tid("greet"));
        config.agent = Some(AgentBinding {
            id: "a1".into(),
            config: Map::new(),
        });
        config.action = Some("hello".into());
        config.with = Some(
            json!({"name": "{{ workflow.input.name }}"})
                .as_object()
                .unwrap()
                .clone(),
        );

        let state = uc
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap();

        assert_eq!(state.status, Status::Pending);
        assert_eq!(state.component, Component::Agent);
        assert_eq!(state.execution_type, ExecutionType::Basic);
        assert_eq!(state.input["name"], "Ada");
        assert_eq!(state.action_id.as_deref(), Some("hello"));

        // config snapshot present
        assert!(configs.contains(state.task_exec_id));
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn parent_gets_empty_input_and_metadata() {
        let (uc, _states, configs) = use_case();
        let mut config = TaskConfig::basic(tid("both"));
        config.task_type = TaskType::Parallel;
        config.parallel = Some(crate::config::ParallelBlock {
            strategy: crate::types::Strategy::WaitAll,
            max_workers: Some(2),
            timeout: None,
            tasks: vec![TaskConfig::basic(tid("a")), TaskConfig::basic(tid("b"))],
        });

        let state = uc
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap();

        assert_eq!(state.input, json!({}));
        let metadata = configs.get_metadata(state.task_exec_id).await.unwrap();
        assert_eq!(metadata.kind(), "parallel");
        assert_eq!(metadata.child_configs().len(), 2);
    }

    #[tokio::test]
    async fn collection_expansion_persists_collection_state() {
        let (uc, states, configs) = use_case();
        let mut config = TaskConfig::basic(tid("fanout"));
        config.task_type = TaskType::Collection;
        config.collection = Some(CollectionBlock {
            items: "{{ workflow.input.list }}".into(),
            filter: None,
            mode: CollectionMode::Parallel,
            batch: None,
            continue_on_error: false,
            item_var: None,
            index_var: None,
            max_workers: None,
            timeout: None,
            task: Box::new(TaskConfig::basic(tid("echo"))),
        });

        let state = uc
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap();

        let stored = states.get_state(state.task_exec_id).await.unwrap();
        let cs = stored.collection_state.unwrap();
        assert_eq!(cs.total, 2);
        assert_eq!(cs.filtered, 2);

        let metadata = configs.get_metadata(state.task_exec_id).await.unwrap();
        let meta = metadata.as_collection().unwrap();
        assert_eq!(meta.child_configs.len(), 2);
        assert_eq!(meta.child_configs[0].id.as_str(), "fanout.item[0]");
    }

    #[tokio::test]
    async fn oversize_collection_marks_parent_failed() {
        let (uc, states, _configs) = use_case();
        let uc = uc.with_max_collection_items(1);
        let mut config = TaskConfig::basic(tid("fanout"));
        config.task_type = TaskType::Collection;
        config.collection = Some(CollectionBlock {
            items: "{{ workflow.input.list }}".into(),
            filter: None,
            mode: CollectionMode::Parallel,
            batch: None,
            continue_on_error: false,
            item_var: None,
            index_var: None,
            max_workers: None,
            timeout: None,
            task: Box::new(TaskConfig::basic(tid("echo"))),
        });

        let err = uc
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum allowed"));

        // the parent row survives, failed, with no children
        assert_eq!(states.len(), 1);
        let rows = states.list_task_executions("wf-exec-1", "fanout").await;
        assert_eq!(rows[0].status, Status::Failed);
    }

    #[tokio::test]
    async fn schema_failure_compensates_config() {
        let (uc, states, configs) = use_case();
        let mut config = TaskConfig::basic(tid("typed"));
        config.with = Some(json!({"count": "not-a-number"}).as_object().unwrap().clone());
        config.input_schema = Some(json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        }));

        let err = uc
            .create_state(&workflow(), &WorkflowConfig::default(), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("schema"));

        // both writes rolled back
        assert_eq!(configs.len(), 0);
        assert_eq!(states.len(), 1); // state row remains pending but config gone
    }

    #[tokio::test]
    async fn env_merges_workflow_under_task() {
        let (uc, _states, _configs) = use_case();
        let mut wf_config = WorkflowConfig::default();
        wf_config.env.insert("REGION".into(), "eu".into());
        wf_config.env.insert("TIER".into(), "prod".into());

        let mut config = TaskConfig::basic(tid("greet"));
        config.env.insert("TIER".into(), "dev".into());

        let state = uc
            .create_state(&workflow(), &wf_config, &config)
            .await
            .unwrap();
        assert_eq!(state.env["REGION"], "eu");
        assert_eq!(state.env["TIER"], "dev");
    }
}
