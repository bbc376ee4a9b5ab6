//! Evaluation-context building
//!
//! Every template render sees the same shape:
//!
//! ```json
//! {
//!   "workflow": {"id": …, "exec_id": …, "input": …, "output": …},
//!   "tasks": {"<task_id>": {"output": …}},
//!   "task": {"id": …, "status": …, "input": …, "output": …},
//!   "project": …,
//!   "env": {…merged…},
//!   "<item_var>": …, "<index_var>": …        // collection items only
//! }
//! ```
//!
//! Context maps for per-item evaluation are pooled via [`ContextScope`];
//! the pool is an implementation detail owned by the driver, never global,
//! and scopes clear their map on release.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Map, Value};

use crate::state::TaskState;
use crate::workflow::WorkflowState;

// ============================================================================
// ENV HYGIENE
// ============================================================================

/// Env names matching these fragments never enter a template context
const BLOCKED_ENV_PATTERNS: &[&str] = &[
    "API_KEY", "APIKEY", "SECRET", "TOKEN", "PASSWORD", "CREDENTIAL", "AUTH", "PRIVATE_KEY",
];

fn env_blocked(name: &str) -> bool {
    let upper = name.to_uppercase();
    BLOCKED_ENV_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Filter an env map down to names safe for template exposure
pub fn safe_env(env: &HashMap<String, String>) -> Map<String, Value> {
    let mut out = Map::with_capacity(env.len());
    for (k, v) in env {
        if !env_blocked(k) {
            out.insert(k.clone(), Value::String(v.clone()));
        }
    }
    out
}

// ============================================================================
// CONTEXT BUILDING
// ============================================================================

/// Base context from live workflow state
pub fn workflow_context(workflow: &WorkflowState) -> Value {
    let mut tasks = Map::with_capacity(workflow.task_outputs.len());
    for (task_id, output) in &workflow.task_outputs {
        tasks.insert(task_id.clone(), json!({ "output": output }));
    }

    json!({
        "workflow": {
            "id": workflow.workflow_id,
            "exec_id": workflow.workflow_exec_id,
            "input": workflow.input,
            "output": workflow.output,
        },
        "tasks": tasks,
        "project": workflow.project,
    })
}

/// Base context extended with the current task and its merged env
pub fn task_context(
    workflow: &WorkflowState,
    state: &TaskState,
    env: &HashMap<String, String>,
) -> Value {
    let mut context = workflow_context(workflow);
    let map = context.as_object_mut().expect("workflow context is a map");
    map.insert(
        "task".to_string(),
        json!({
            "id": state.task_id.as_str(),
            "status": state.status,
            "input": state.input,
            "output": state.output,
        }),
    );
    map.insert("env".to_string(), Value::Object(safe_env(env)));
    context
}

/// Overlay `{item_var: item, index_var: index}` on a context
pub fn with_item(
    context: &Value,
    item_var: &str,
    item: &Value,
    index_var: &str,
    index: usize,
) -> Value {
    let mut extended = context.clone();
    if let Some(map) = extended.as_object_mut() {
        map.insert(item_var.to_string(), item.clone());
        map.insert(index_var.to_string(), json!(index));
    }
    extended
}

// ============================================================================
// CONTEXT POOL
// ============================================================================

/// Bounded pool of context maps for per-item evaluation
///
/// Hot loops over large collections rebuild nearly identical contexts; the
/// pool recycles the allocations. Scopes hand their map back cleared, so
/// nothing observable leaks between items - tests must not depend on reuse.
pub struct ContextPool {
    pool: Mutex<Vec<Map<String, Value>>>,
    max_size: usize,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::with_capacity(8)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    /// Borrow a scope backed by a pooled (or fresh) map
    pub fn scope(&self) -> ContextScope<'_> {
        let map = self
            .pool
            .lock()
            .expect("context pool poisoned")
            .pop()
            .unwrap_or_default();
        ContextScope {
            pool: self,
            map: Some(map),
        }
    }

    fn release(&self, mut map: Map<String, Value>) {
        map.clear();
        let mut pool = self.pool.lock().expect("context pool poisoned");
        if pool.len() < self.max_size {
            pool.push(map);
        }
    }

    #[cfg(test)]
    fn size(&self) -> usize {
        self.pool.lock().expect("context pool poisoned").len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled context map, returned to the pool (cleared) on drop
pub struct ContextScope<'a> {
    pool: &'a ContextPool,
    map: Option<Map<String, Value>>,
}

impl ContextScope<'_> {
    /// Seed the scope from a base context object
    pub fn load(&mut self, base: &Value) {
        let map = self.map.as_mut().expect("scope map taken");
        map.clear();
        if let Some(object) = base.as_object() {
            map.extend(object.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.map
            .as_mut()
            .expect("scope map taken")
            .insert(key.into(), value);
    }

    /// View the scope as a JSON context value
    pub fn as_value(&self) -> Value {
        Value::Object(self.map.as_ref().expect("scope map taken").clone())
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            self.pool.release(map);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
