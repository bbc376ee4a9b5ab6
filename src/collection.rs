//! Collection expansion and child materialization
//!
//! Turns a collection block into concrete child configs:
//!
//! 1. evaluate the `items` expression against the live context
//! 2. enforce the size bound
//! 3. apply the per-item `filter`
//! 4. render the task template once per surviving item
//!
//! Expansion is pure with respect to the stores; the create-state preparer
//! persists the resulting metadata and `collection_state`, and the fan-out
//! driver aggregates the item results afterwards.

use serde_json::{json, Map, Value};

use crate::condition;
use crate::config::{CollectionBlock, TaskConfig};
use crate::context::ContextPool;
use crate::error::OrdoError;
use crate::state::{CollectionStateInfo, ItemResult};
use crate::template;
use crate::types::{is_valid_variable_name, Status};

/// Hard bound on expanded collection size
pub const DEFAULT_MAX_COLLECTION_ITEMS: usize = 10_000;

/// Substrings refused inside `items` / `filter` expressions
///
/// Static guard against template injection reaching an expression engine.
const BLOCKED_EXPRESSION_FRAGMENTS: &[&str] = &["exec", "system"];

// ============================================================================
// EXPANSION
// ============================================================================

/// Result of expanding a collection block
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedCollection {
    /// Items surviving the filter, in source order
    pub items: Vec<Value>,
    /// Count before filtering
    pub total: usize,
    /// Count after filtering
    pub filtered: usize,
}

fn guard_expression(kind: &str, expr: &str) -> Result<(), OrdoError> {
    let lowered = expr.to_lowercase();
    for fragment in BLOCKED_EXPRESSION_FRAGMENTS {
        if lowered.contains(fragment) {
            return Err(OrdoError::validation(format!(
                "{kind} expression contains blocked fragment {fragment:?}"
            )));
        }
    }
    Ok(())
}

/// Evaluate `items` and `filter` into a concrete item list
pub fn evaluate_items(
    block: &CollectionBlock,
    context: &Value,
    max_items: usize,
) -> Result<ExpandedCollection, OrdoError> {
    let item_var = block.item_var();
    let index_var = block.index_var();
    for name in [item_var, index_var] {
        if !is_valid_variable_name(name) {
            return Err(OrdoError::validation(format!(
                "invalid variable name {name:?}"
            )));
        }
    }

    guard_expression("items", &block.items)?;
    if let Some(filter) = &block.filter {
        guard_expression("filter", filter)?;
    }

    let expression = block.items.trim();
    let evaluated = if template::is_templated(expression) {
        template::render_value(expression, context)?
    } else if expression.starts_with('[') {
        serde_json::from_str::<Value>(expression)
            .map_err(|e| OrdoError::validation(format!("invalid items literal: {e}")))?
    } else {
        Value::String(expression.to_string())
    };

    let items: Vec<Value> = match evaluated {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    };

    let total = items.len();
    if total > max_items {
        return Err(OrdoError::validation(format!(
            "collection size {total} exceeds maximum allowed {max_items} items"
        )));
    }

    let items = match &block.filter {
        Some(filter) => {
            let pool = ContextPool::new();
            let mut kept = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let mut scope = pool.scope();
                scope.load(context);
                scope.insert(item_var, item.clone());
                scope.insert(index_var, json!(index));

                let keep = if template::is_templated(filter) {
                    let verdict = template::render_value(filter, &scope.as_value())?;
                    template::is_truthy(&verdict)
                } else {
                    // bare expressions go through the condition grammar,
                    // so comparisons like `item != "b"` work
                    condition::evaluate(filter, &scope.as_value())?
                };
                if keep {
                    kept.push(item);
                }
            }
            kept
        }
        None => items,
    };

    let filtered = items.len();
    Ok(ExpandedCollection {
        items,
        total,
        filtered,
    })
}

/// Initial `collection_state` for the parent
pub fn initial_collection_state(
    block: &CollectionBlock,
    expanded: &ExpandedCollection,
) -> CollectionStateInfo {
    CollectionStateInfo {
        items: expanded.items.clone(),
        total: expanded.total,
        filtered: expanded.filtered,
        processed: 0,
        completed: 0,
        failed: 0,
        item_results: Vec::new(),
        continue_on_error: block.continue_on_error,
        item_var: block.item_var().to_string(),
        index_var: block.index_var().to_string(),
        mode: block.mode,
    }
}

// ============================================================================
// CHILD MATERIALIZATION
// ============================================================================

/// Render the task template once per item into concrete child configs
///
/// Every field except `outputs` resolves now; `outputs` renders after the
/// child executes. Child ids take the form `<parent_id>.item[<index>]`, and
/// each child's `with` carries the item/index variables so agent-action
/// templates can still resolve them downstream.
pub fn materialize_child_configs(
    parent: &TaskConfig,
    block: &CollectionBlock,
    expanded: &ExpandedCollection,
    context: &Value,
) -> Result<Vec<TaskConfig>, OrdoError> {
    let item_var = block.item_var();
    let index_var = block.index_var();
    let template_map = block.task.as_map()?;
    let pool = ContextPool::new();

    let mut children = Vec::with_capacity(expanded.items.len());
    for (index, item) in expanded.items.iter().enumerate() {
        let mut scope = pool.scope();
        scope.load(context);
        scope.insert(item_var, item.clone());
        scope.insert(index_var, json!(index));

        let rendered = template::parse_map_with_filter(
            &Value::Object(template_map.clone()),
            &scope.as_value(),
            &["outputs"],
        )?;
        let Value::Object(rendered_map) = rendered else {
            return Err(OrdoError::validation(
                "collection task template did not render to a map",
            ));
        };

        let mut child = TaskConfig::from_map(rendered_map)?;
        child.id = parent.id.item_child(index);

        let with = child.with.get_or_insert_with(Map::new);
        with.insert(item_var.to_string(), item.clone());
        with.insert(index_var.to_string(), json!(index));

        children.push(child);
    }

    Ok(children)
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Aggregated collection outcome for the parent
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionOutcome {
    pub status: Status,
    pub output: Value,
}

/// Fold item results (index order) into the parent's state and output
///
/// Final status law: empty collections succeed; with `continue_on_error`
/// the parent fails only when every item failed; otherwise any failure
/// fails the parent.
pub fn aggregate(
    collection_state: &mut CollectionStateInfo,
    mut results: Vec<ItemResult>,
) -> CollectionOutcome {
    results.sort_by_key(|r| r.index);

    collection_state.processed = results.len();
    collection_state.completed = results
        .iter()
        .filter(|r| r.status == Status::Success)
        .count();
    collection_state.failed = results
        .iter()
        .filter(|r| matches!(r.status, Status::Failed | Status::Canceled))
        .count();

    let outputs: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "index": r.index,
                "task_exec_id": r.task_exec_id,
                "status": r.status,
                "output": r.output,
                "error": r.error,
            })
        })
        .collect();

    let skipped = collection_state.total - collection_state.filtered;
    let summary = json!({
        "total_items": collection_state.total,
        "filtered_items": collection_state.filtered,
        "completed": collection_state.completed,
        "failed": collection_state.failed,
        "skipped": skipped,
        "mode": collection_state.mode,
    });

    let status = if collection_state.total == 0 {
        Status::Success
    } else if collection_state.continue_on_error {
        if collection_state.filtered > 0 && collection_state.failed == collection_state.filtered {
            Status::Failed
        } else {
            Status::Success
        }
    } else if collection_state.failed > 0 {
        Status::Failed
    } else {
        Status::Success
    };

    collection_state.item_results = results;

    CollectionOutcome {
        status,
        output: json!({"summary": summary, "results": outputs}),
    }
}

// ============================================================================
// TESTS
// ============================================================================
