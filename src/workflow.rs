//! Minimal workflow surface consumed by the task machine
//!
//! The full workflow engine lives outside this crate; the task subsystem only
//! needs (a) the live workflow state to build template contexts and (b) the
//! declared task list to determine the next task after a response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::TaskConfig;
use crate::types::TaskId;

// ============================================================================
// WORKFLOW STATE
// ============================================================================

/// Live state of one workflow execution
///
/// `task_outputs` maps task id → output and feeds `tasks.<id>.output`
/// template references.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_exec_id: String,

    #[serde(default)]
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub task_outputs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, workflow_exec_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            input: Value::Null,
            output: None,
            task_outputs: Map::new(),
            project: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Record a finished task's output
    pub fn record_output(&mut self, task_id: &TaskId, output: Value) {
        self.task_outputs
            .insert(task_id.as_str().to_string(), output);
    }
}

// ============================================================================
// WORKFLOW CONFIG
// ============================================================================

/// Declared workflow: an ordered task list plus an env overlay
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,

    #[serde(default)]
    pub tasks: Vec<TaskConfig>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl WorkflowConfig {
    /// Look up a declared task by id
    pub fn task(&self, id: &TaskId) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.id == *id)
    }

    /// Next task after `current` finished with `is_success`
    ///
    /// Explicit transitions win; otherwise success falls through to the next
    /// declared task, failure stops the workflow.
    pub fn determine_next(&self, current: &TaskConfig, is_success: bool) -> Option<TaskId> {
        let transition = if is_success {
            current.on_success.as_ref()
        } else {
            current.on_error.as_ref()
        };
        if let Some(next) = transition.and_then(|t| t.next.clone()) {
            return Some(next);
        }
        if !is_success {
            return None;
        }
        let position = self.tasks.iter().position(|t| t.id == current.id)?;
        self.tasks.get(position + 1).map(|t| t.id.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transition;
    use serde_json::json;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn wf_with(tasks: Vec<TaskConfig>) -> WorkflowConfig {
        WorkflowConfig {
            id: "wf".into(),
            tasks,
            env: HashMap::new(),
        }
    }

    #[test]
    fn explicit_transition_wins() {
        let mut first = TaskConfig::basic(tid("first"));
        first.on_success = Some(Transition {
            next: Some(tid("third")),
            with: None,
        });
        let wf = wf_with(vec![
            first.clone(),
            TaskConfig::basic(tid("second")),
            TaskConfig::basic(tid("third")),
        ]);

        assert_eq!(wf.determine_next(&first, true), Some(tid("third")));
    }

    #[test]
    fn success_falls_through_declaration_order() {
        let first = TaskConfig::basic(tid("first"));
        let wf = wf_with(vec![first.clone(), TaskConfig::basic(tid("second"))]);
        assert_eq!(wf.determine_next(&first, true), Some(tid("second")));
    }

    #[test]
    fn last_task_has_no_next() {
        let only = TaskConfig::basic(tid("only"));
        let wf = wf_with(vec![only.clone()]);
        assert_eq!(wf.determine_next(&only, true), None);
    }

    #[test]
    fn failure_without_transition_stops() {
        let first = TaskConfig::basic(tid("first"));
        let wf = wf_with(vec![first.clone(), TaskConfig::basic(tid("second"))]);
        assert_eq!(wf.determine_next(&first, false), None);
    }

    #[test]
    fn failure_with_on_error_routes() {
        let mut risky = TaskConfig::basic(tid("risky"));
        risky.on_error = Some(Transition {
            next: Some(tid("cleanup")),
            with: None,
        });
        let wf = wf_with(vec![risky.clone(), TaskConfig::basic(tid("cleanup"))]);
        assert_eq!(wf.determine_next(&risky, false), Some(tid("cleanup")));
    }

    #[test]
    fn record_output_feeds_task_outputs() {
        let mut state = WorkflowState::new("wf", "wf-exec").with_input(json!({"city": "Paris"}));
        state.record_output(&tid("fetch"), json!({"temp": 21}));
        assert_eq!(state.task_outputs["fetch"]["temp"], 21);
    }
}
