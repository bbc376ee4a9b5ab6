//! # Ordo - task execution core
//!
//! The task subsystem of a durable AI-agent workflow engine: it turns
//! declarative task configs into persisted, reconcilable execution state,
//! dispatches work through adapters, aggregates child results, and feeds
//! the next task back to the surrounding workflow driver.
//!
//! ## Task types
//!
//! | Type | Kind | Description |
//! |------|------|-------------|
//! | `basic` | leaf | agent / tool / pass-through execution |
//! | `parallel` | container | fan-out under a completion strategy |
//! | `collection` | container | per-item fan-out over an expression |
//! | `composite` | container | ordered child sequence |
//! | `wait` | leaf | parks until a signal's condition holds |
//! | `memory` | leaf | transactional keyed message-log operations |
//!
//! ## Architecture
//!
//! Two stores with strict ownership: the **state store** holds mutable
//! [`TaskState`] rows (row-locked, transactional child insertion); the
//! **config store** holds immutable per-execution [`TaskConfig`] snapshots
//! plus typed parent metadata. Authored configs live separately in the
//! ETag-versioned **resource store**.
//!
//! The durable runtime (external) dispatches the idempotent activities in
//! [`TaskActivities`], keyed by `task_exec_id`; retries, timers, and signal
//! transport are its concern, not ours.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ordo::{AdapterRegistry, TaskActivities, TaskConfig, WorkflowConfig, WorkflowState};
//! use tokio_util::sync::CancellationToken;
//!
//! let registry = AdapterRegistry::new();
//! registry.register_agent("assistant", my_adapter);
//! let activities = TaskActivities::new(registry);
//!
//! let config: TaskConfig = serde_yaml::from_str(yaml)?;
//! let mut workflow = WorkflowState::new("wf", "wf-exec-1");
//! let state = activities
//!     .create_task_state(&workflow, &WorkflowConfig::default(), &config)
//!     .await?;
//! let response = activities
//!     .run_task(&mut workflow, &WorkflowConfig::default(), state.task_exec_id,
//!               &CancellationToken::new())
//!     .await?;
//! ```

pub mod activities;
pub mod adapter;
pub mod collection;
pub mod condition;
pub mod config;
pub mod context;
pub mod create_children;
pub mod create_state;
pub mod error;
pub mod events;
pub mod memory;
pub mod parallel;
pub mod response;
pub mod state;
pub mod store;
pub mod task_executor;
pub mod template;
pub mod types;
pub mod util;
pub mod wait;
pub mod workflow;

// Facade and adapters
pub use activities::TaskActivities;
pub use adapter::{
    AdapterRegistry, AgentAdapter, AgentRequest, FlushOutcome, HttpTool, InMemoryMemory,
    MemoryBackend, MemoryHealth, MemoryMessage, MockAgent, MockTool, ToolAdapter, ToolRequest,
};
// Config and state model
pub use config::{
    AgentBinding, CollectionBlock, CompositeBlock, MemoryBlock, MemoryOpConfig, ParallelBlock,
    TaskConfig, TaskType, ToolBinding, Transition, WaitBlock,
};
pub use state::{
    CollectionStateInfo, ErrorInfo, ExecutionResult, ItemResult, PartialState, ProgressInfo,
    TaskState,
};
pub use types::{
    CollectionMode, Component, ExecutionType, MemoryOp, MessageRole, Status, Strategy, TaskExecId,
    TaskId,
};
// Use cases
pub use create_children::CreateChildren;
pub use create_state::CreateState;
pub use memory::MemoryDriver;
pub use parallel::FanOutDriver;
pub use response::{ResponseHandler, TaskResponse};
pub use task_executor::TaskExecutor;
pub use wait::{Signal, SignalOutcome, WaitDriver};
// Stores
pub use store::{
    ConfigStore, ListDirection, ListPage, ListQuery, ParentMetadata, ResourceKey, ResourceStore,
    StateStore, StoreError, TaskResources,
};
// Events and errors
pub use error::{ErrorCategory, OrdoError};
pub use events::{EventLog, EventPublisher, EventType, TaskEvent};
// Workflow surface
pub use workflow::{WorkflowConfig, WorkflowState};
