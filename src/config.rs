//! Task configuration - the authored, immutable description of work
//!
//! A [`TaskConfig`] is authored externally (YAML through the resource store,
//! or built programmatically), then snapshotted per execution into the config
//! store. Six task types share one struct with optional type-specific blocks:
//!
//! ```yaml
//! id: fanout
//! type: collection
//! collection:
//!   items: "{{ workflow.input.cities }}"
//!   filter: "{{ item }}"
//!   mode: parallel
//!   task:
//!     id: fetch
//!     tool:
//!       id: http_fetch
//! ```
//!
//! Exactly one of `agent` / `tool` may be bound; neither means the task is a
//! pure orchestrator (containers, wait, memory).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OrdoError;
use crate::types::{CollectionMode, Component, ExecutionType, MemoryOp, Strategy, TaskId};

// ============================================================================
// TASK TYPE
// ============================================================================

/// The six task types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Basic,
    Parallel,
    Collection,
    Composite,
    Wait,
    Memory,
}

// ============================================================================
// COMPONENT BINDINGS
// ============================================================================

/// Binding to an agent component
///
/// `config` is carried verbatim and re-parsed against live workflow state
/// right before dispatch (templates inside resolve at run time, not at
/// authoring time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBinding {
    pub id: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

/// Binding to a tool component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub id: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Success / error transition pointer
///
/// `with` is template-rendered at response-handling time, against the live
/// workflow context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,
}

// ============================================================================
// TYPE-SPECIFIC BLOCKS
// ============================================================================

/// Parallel parent block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBlock {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Advisory timeout for the runtime ("30s", "5m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    pub tasks: Vec<TaskConfig>,
}

/// Collection parent block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionBlock {
    /// Items expression: `{{ … }}` template, literal JSON array, or a single value
    pub items: String,

    /// Optional per-item filter expression; truthy keeps the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    #[serde(default)]
    pub mode: CollectionMode,

    /// Concurrency for sequential mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Per-item task template
    pub task: Box<TaskConfig>,
}

impl CollectionBlock {
    /// Item variable name (default "item")
    pub fn item_var(&self) -> &str {
        self.item_var.as_deref().unwrap_or("item")
    }

    /// Index variable name (default "index")
    pub fn index_var(&self) -> &str {
        self.index_var.as_deref().unwrap_or("index")
    }
}

/// Composite parent block (ordered children)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeBlock {
    pub tasks: Vec<TaskConfig>,
}

/// Wait task block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitBlock {
    /// Signal name this task waits for
    pub wait_for: String,

    /// Boolean condition over `{signal, task, workflow, processor}`
    pub condition: String,

    /// Optional inner task run on each matching signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<Box<TaskConfig>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Memory task block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub operation: MemoryOp,

    /// Which memory resource this operation addresses
    pub memory_ref: String,

    /// Key template; final resolution happens in the backend
    pub key_template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default)]
    pub config: MemoryOpConfig,
}

/// Per-operation knobs for memory tasks
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryOpConfig {
    /// Required by `clear`
    #[serde(default)]
    pub confirm: bool,

    /// `flush` returns a health snapshot without mutating
    #[serde(default)]
    pub dry_run: bool,

    /// `stats` adds per-message token averages
    #[serde(default)]
    pub include_content: bool,
}

// ============================================================================
// TASK CONFIG
// ============================================================================

/// Declarative description of one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: TaskId,

    #[serde(rename = "type", default)]
    pub task_type: TaskType,

    /// Action name passed to the bound agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Inline prompt for agent tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Input mapping, template-rendered at create-state time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,

    /// Environment overlay; children inherit parent env with child winning
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolBinding>,

    /// JSON Schema the rendered input must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Transition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Transition>,

    /// Post-execution output transform, rendered against the final context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryBlock>,
}

impl TaskConfig {
    /// Minimal basic task
    pub fn basic(id: TaskId) -> Self {
        Self {
            id,
            task_type: TaskType::Basic,
            action: None,
            prompt: None,
            with: None,
            env: HashMap::new(),
            agent: None,
            tool: None,
            input_schema: None,
            on_success: None,
            on_error: None,
            outputs: None,
            parallel: None,
            collection: None,
            composite: None,
            wait: None,
            memory: None,
        }
    }

    /// Which component executes this task
    pub fn component(&self) -> Component {
        if self.agent.is_some() {
            Component::Agent
        } else if self.tool.is_some() {
            Component::Tool
        } else {
            Component::Task
        }
    }

    /// How the state machine drives this task
    pub fn execution_type(&self) -> ExecutionType {
        match self.task_type {
            TaskType::Parallel => ExecutionType::Parallel,
            TaskType::Collection => ExecutionType::Collection,
            TaskType::Composite => ExecutionType::Composite,
            TaskType::Basic | TaskType::Wait | TaskType::Memory => ExecutionType::Basic,
        }
    }

    /// Whether this config materializes children
    pub fn is_parent(&self) -> bool {
        self.execution_type().can_have_children()
    }

    /// Merge a parent env under this config's env (child overrides)
    pub fn merged_env(&self, parent_env: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = parent_env.clone();
        for (k, v) in &self.env {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Structural validation
    ///
    /// Checked when a config enters the system (resource store upsert,
    /// create-state) so drivers can assume a well-formed shape.
    pub fn validate(&self) -> Result<(), OrdoError> {
        if self.agent.is_some() && self.tool.is_some() {
            return Err(OrdoError::validation(format!(
                "task {}: agent and tool are mutually exclusive",
                self.id
            )));
        }

        match self.task_type {
            TaskType::Parallel => {
                let block = self.parallel.as_ref().ok_or_else(|| {
                    OrdoError::validation(format!("task {}: parallel block required", self.id))
                })?;
                if block.tasks.is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: parallel block needs at least one child",
                        self.id
                    )));
                }
                for child in &block.tasks {
                    validate_container_child(&self.id, child)?;
                    child.validate()?;
                }
            }
            TaskType::Collection => {
                let block = self.collection.as_ref().ok_or_else(|| {
                    OrdoError::validation(format!("task {}: collection block required", self.id))
                })?;
                if block.items.trim().is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: collection items expression is empty",
                        self.id
                    )));
                }
                validate_container_child(&self.id, &block.task)?;
                block.task.validate()?;
            }
            TaskType::Composite => {
                let block = self.composite.as_ref().ok_or_else(|| {
                    OrdoError::validation(format!("task {}: composite block required", self.id))
                })?;
                if block.tasks.is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: composite block needs at least one child",
                        self.id
                    )));
                }
                for child in &block.tasks {
                    validate_container_child(&self.id, child)?;
                    child.validate()?;
                }
            }
            TaskType::Wait => {
                let block = self.wait.as_ref().ok_or_else(|| {
                    OrdoError::validation(format!("task {}: wait block required", self.id))
                })?;
                if block.wait_for.trim().is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: wait_for signal name is empty",
                        self.id
                    )));
                }
                if let Some(processor) = &block.processor {
                    processor.validate()?;
                }
            }
            TaskType::Memory => {
                let block = self.memory.as_ref().ok_or_else(|| {
                    OrdoError::validation(format!("task {}: memory block required", self.id))
                })?;
                if block.key_template.trim().is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: memory key_template is required",
                        self.id
                    )));
                }
                if block.memory_ref.trim().is_empty() {
                    return Err(OrdoError::validation(format!(
                        "task {}: memory_ref is required",
                        self.id
                    )));
                }
            }
            TaskType::Basic => {}
        }

        Ok(())
    }

    /// Serialize to a JSON map (for template-driven child materialization)
    pub fn as_map(&self) -> Result<Map<String, Value>, OrdoError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(OrdoError::validation("task config must serialize to a map")),
            Err(e) => Err(OrdoError::validation(format!(
                "task config serialization failed: {e}"
            ))),
        }
    }

    /// Rebuild a config from a JSON map (inverse of [`Self::as_map`])
    pub fn from_map(map: Map<String, Value>) -> Result<Self, OrdoError> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| OrdoError::validation(format!("invalid task config map: {e}")))
    }
}

/// What a container may nest
///
/// Parallel and composite children recurse one level at a time; collections
/// inside containers would need live-state expansion mid-fan-out (aggregation
/// order is ambiguous), and wait children have no signal routing, so both
/// are rejected up front.
fn validate_container_child(parent_id: &TaskId, child: &TaskConfig) -> Result<(), OrdoError> {
    match child.task_type {
        TaskType::Collection => Err(OrdoError::validation(format!(
            "task {parent_id}: collection tasks cannot be nested inside a container"
        ))),
        TaskType::Wait => Err(OrdoError::validation(format!(
            "task {parent_id}: wait tasks cannot be nested inside a container"
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn parse_basic_agent_task_yaml() {
        let yaml = r#"
id: greet
agent:
  id: a1
action: hello
with:
  name: Ada
outputs:
  msg: "Hello, {{ output.text }}"
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.id.as_str(), "greet");
        assert_eq!(config.task_type, TaskType::Basic);
        assert_eq!(config.component(), Component::Agent);
        assert_eq!(config.with.as_ref().unwrap()["name"], "Ada");
        config.validate().unwrap();
    }

    #[test]
    fn parse_collection_yaml() {
        let yaml = r#"
id: fanout
type: collection
collection:
  items: "{{ workflow.input.list }}"
  filter: "{{ item }}"
  mode: sequential
  batch: 2
  continue_on_error: true
  task:
    id: echo
    tool:
      id: echo_tool
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.execution_type(), ExecutionType::Collection);
        assert!(config.is_parent());
        let block = config.collection.as_ref().unwrap();
        assert_eq!(block.mode, CollectionMode::Sequential);
        assert_eq!(block.item_var(), "item");
        assert_eq!(block.index_var(), "index");
        config.validate().unwrap();
    }

    #[test]
    fn agent_and_tool_are_mutually_exclusive() {
        let mut config = TaskConfig::basic(tid("both"));
        config.agent = Some(AgentBinding {
            id: "a".into(),
            config: Map::new(),
        });
        config.tool = Some(ToolBinding {
            id: "t".into(),
            config: Map::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn orchestrator_has_task_component() {
        let config = TaskConfig::basic(tid("noop"));
        assert_eq!(config.component(), Component::Task);
    }

    #[test]
    fn wait_requires_signal_name() {
        let mut config = TaskConfig::basic(tid("gate"));
        config.task_type = TaskType::Wait;
        config.wait = Some(WaitBlock {
            wait_for: "  ".into(),
            condition: "true".into(),
            processor: None,
            timeout: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_requires_key_template() {
        let mut config = TaskConfig::basic(tid("mem"));
        config.task_type = TaskType::Memory;
        config.memory = Some(MemoryBlock {
            operation: MemoryOp::Read,
            memory_ref: "conversation".into(),
            key_template: "".into(),
            payload: None,
            config: MemoryOpConfig::default(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_template"));
    }

    #[test]
    fn nested_collections_are_rejected() {
        let inner = TaskConfig {
            task_type: TaskType::Collection,
            collection: Some(CollectionBlock {
                items: "{{ item }}".into(),
                filter: None,
                mode: CollectionMode::Parallel,
                batch: None,
                continue_on_error: false,
                item_var: None,
                index_var: None,
                max_workers: None,
                timeout: None,
                task: Box::new(TaskConfig::basic(tid("leaf"))),
            }),
            ..TaskConfig::basic(tid("inner"))
        };
        let outer = TaskConfig {
            task_type: TaskType::Collection,
            collection: Some(CollectionBlock {
                items: "{{ workflow.input.list }}".into(),
                filter: None,
                mode: CollectionMode::Parallel,
                batch: None,
                continue_on_error: false,
                item_var: None,
                index_var: None,
                max_workers: None,
                timeout: None,
                task: Box::new(inner),
            }),
            ..TaskConfig::basic(tid("outer"))
        };
        assert!(outer.validate().is_err());
    }

    #[test]
    fn merged_env_child_overrides() {
        let mut parent_env = HashMap::new();
        parent_env.insert("REGION".to_string(), "eu".to_string());
        parent_env.insert("TIER".to_string(), "prod".to_string());

        let mut config = TaskConfig::basic(tid("child"));
        config.env.insert("TIER".to_string(), "dev".to_string());

        let merged = config.merged_env(&parent_env);
        assert_eq!(merged["REGION"], "eu");
        assert_eq!(merged["TIER"], "dev");
    }

    #[test]
    fn map_round_trip_preserves_identity() {
        let yaml = r#"
id: greet
type: basic
agent:
  id: a1
with:
  name: Ada
env:
  LANG: fr
on_success:
  next: thank
  with:
    greeted: "true"
on_error:
  next: apologize
outputs:
  msg: "Hello, {{ output.text }}"
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        let map = config.as_map().unwrap();
        let back = TaskConfig::from_map(map).unwrap();

        assert_eq!(back.id, config.id);
        assert_eq!(back.task_type, config.task_type);
        assert_eq!(back.with, config.with);
        assert_eq!(back.env, config.env);
        assert_eq!(back.agent, config.agent);
        assert_eq!(back.tool, config.tool);
        assert_eq!(back.outputs, config.outputs);
        assert_eq!(back.on_success, config.on_success);
        assert_eq!(back.on_error, config.on_error);
        assert_eq!(back, config);
    }

    #[test]
    fn from_map_rejects_garbage() {
        let mut map = Map::new();
        map.insert("type".to_string(), json!("no_such_type"));
        assert!(TaskConfig::from_map(map).is_err());
    }
}
