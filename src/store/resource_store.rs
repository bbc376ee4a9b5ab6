//! Resource store - authored configs under ETag-versioned keys
//!
//! Generic `(project, type, id)` key/value layer with optimistic concurrency,
//! plus [`TaskResources`], the task-config CRUD surface: upsert with id/ETag
//! checks, delete with referential-integrity conflict detection, and
//! prefix/cursor listing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::config::TaskConfig;
use crate::store::StoreError;
use crate::workflow::WorkflowConfig;

// ============================================================================
// KEYS AND ENTRIES
// ============================================================================

/// Fully-qualified resource key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub project: String,
    pub kind: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(project: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Key for an authored task config
    pub fn task(project: &str, id: &str) -> Self {
        Self::new(project, "task", id)
    }

    /// Key for an authored workflow
    pub fn workflow(project: &str, id: &str) -> Self {
        Self::new(project, "workflow", id)
    }
}

/// Provenance recorded on every write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteMeta {
    pub source: &'static str,
    pub updated_by: String,
}

#[derive(Debug, Clone)]
struct StoredResource {
    value: Value,
    etag: String,
    #[allow(dead_code)]
    meta: WriteMeta,
}

// ============================================================================
// RESOURCE STORE
// ============================================================================

/// ETag-versioned key/value store
#[derive(Clone, Default)]
pub struct ResourceStore {
    entries: Arc<DashMap<ResourceKey, StoredResource>>,
    version: Arc<AtomicU64>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        format!("{:016x}", self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Unconditional put; returns the new ETag
    pub fn put(&self, key: ResourceKey, value: Value, meta: WriteMeta) -> String {
        let etag = self.next_etag();
        self.entries.insert(
            key,
            StoredResource {
                value,
                etag: etag.clone(),
                meta,
            },
        );
        etag
    }

    /// Compare-and-swap put against an expected ETag
    pub fn put_if_match(
        &self,
        key: ResourceKey,
        value: Value,
        expected_etag: &str,
        meta: WriteMeta,
    ) -> Result<String, StoreError> {
        let mut entry = match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return Err(StoreError::StaleIfMatch),
        };
        if entry.etag != expected_etag {
            return Err(StoreError::EtagMismatch);
        }
        let etag = self.next_etag();
        *entry = StoredResource {
            value,
            etag: etag.clone(),
            meta,
        };
        Ok(etag)
    }

    pub fn get(&self, key: &ResourceKey) -> Result<(Value, String), StoreError> {
        self.entries
            .get(key)
            .map(|e| (e.value.clone(), e.etag.clone()))
            .ok_or_else(|| StoreError::NotFound {
                resource: "resource",
                id: format!("{}/{}/{}", key.project, key.kind, key.id),
            })
    }

    pub fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                resource: "resource",
                id: format!("{}/{}/{}", key.project, key.kind, key.id),
            })
    }

    /// All `(id, value, etag)` under a project/kind, sorted by id
    pub fn list_with_values(&self, project: &str, kind: &str) -> Vec<(String, Value, String)> {
        let mut items: Vec<(String, Value, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().project == project && e.key().kind == kind)
            .map(|e| (e.key().id.clone(), e.value().value.clone(), e.value().etag.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }
}

// ============================================================================
// LIST QUERIES
// ============================================================================

/// Cursor direction relative to the cursor id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListDirection {
    #[default]
    After,
    Before,
}

/// Parameters for listing task configs
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Id prefix filter
    pub prefix: Option<String>,
    /// Restrict to tasks declared by this workflow
    pub workflow_id: Option<String>,
    /// Exclusive cursor id
    pub cursor: Option<String>,
    pub direction: ListDirection,
    /// Clamped to 1..=MAX_LIST_LIMIT, defaults to DEFAULT_LIST_LIMIT
    pub limit: Option<usize>,
}

/// One page of listed task configs
#[derive(Debug, Clone)]
pub struct ListPage {
    /// Config maps, each with an injected `_etag`
    pub items: Vec<Value>,
    /// Id to resume from, when more items remain
    pub next_cursor: Option<String>,
}

/// Default page size
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Hard ceiling on page size
pub const MAX_LIST_LIMIT: usize = 500;

// ============================================================================
// TASK RESOURCES (CRUD SURFACE)
// ============================================================================

/// CRUD for authored task configs on top of [`ResourceStore`]
#[derive(Clone)]
pub struct TaskResources {
    store: Arc<ResourceStore>,
}

impl TaskResources {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self { store }
    }

    /// Access to the underlying store (workflows share it)
    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    fn meta(updated_by: Option<&str>) -> WriteMeta {
        WriteMeta {
            source: "api",
            updated_by: updated_by.unwrap_or("api").to_string(),
        }
    }

    /// Upsert a task config body under `(project, "task", id)`
    ///
    /// The body id may be empty (the path id is stamped in) but must not
    /// disagree with the path id. With `if_match` the write is a
    /// compare-and-swap.
    pub fn upsert(
        &self,
        project: &str,
        path_id: &str,
        mut body: Value,
        if_match: Option<&str>,
        updated_by: Option<&str>,
    ) -> Result<(TaskConfig, String), StoreError> {
        let path_id = path_id.trim();
        if project.trim().is_empty() || path_id.is_empty() {
            return Err(StoreError::IdMismatch {
                path_id: path_id.to_string(),
                body_id: String::new(),
            });
        }

        // Body id: empty or equal to the path id
        if let Some(map) = body.as_object_mut() {
            match map.get("id").and_then(Value::as_str).map(str::trim) {
                None | Some("") => {
                    map.insert("id".to_string(), Value::String(path_id.to_string()));
                }
                Some(body_id) if body_id != path_id => {
                    return Err(StoreError::IdMismatch {
                        path_id: path_id.to_string(),
                        body_id: body_id.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        let config: TaskConfig = serde_json::from_value(body.clone())
            .map_err(|e| StoreError::InvalidBody(format!("task config: {e}")))?;
        config
            .validate()
            .map_err(|e| StoreError::InvalidBody(e.to_string()))?;

        let key = ResourceKey::task(project, path_id);
        let etag = match if_match {
            Some(expected) => self.store.put_if_match(key, body, expected, Self::meta(updated_by))?,
            None => self.store.put(key, body, Self::meta(updated_by)),
        };
        debug!(project, task = path_id, %etag, "task config upserted");
        Ok((config, etag))
    }

    /// Fetch a decoded config and its ETag
    pub fn get(&self, project: &str, id: &str) -> Result<(TaskConfig, String), StoreError> {
        let (value, etag) = self.store.get(&ResourceKey::task(project, id))?;
        let config: TaskConfig = serde_json::from_value(value)
            .map_err(|e| StoreError::Transaction(format!("stored task config corrupt: {e}")))?;
        Ok((config, etag))
    }

    /// Delete, refusing when the task is still referenced
    ///
    /// Conflicts carry the referencing resource ids so the caller can render
    /// a structured response.
    pub fn delete(&self, project: &str, id: &str) -> Result<(), StoreError> {
        let referencing = self.references_to(project, id);
        if !referencing.is_empty() {
            return Err(StoreError::Conflict {
                resource: format!("task:{id}"),
                ids: referencing,
            });
        }
        self.store.delete(&ResourceKey::task(project, id))
    }

    /// Workflows and tasks that reference `id`
    fn references_to(&self, project: &str, id: &str) -> Vec<String> {
        let mut referencing = Vec::new();

        for (wf_id, value, _etag) in self.store.list_with_values(project, "workflow") {
            let Ok(workflow) = serde_json::from_value::<WorkflowConfig>(value) else {
                continue;
            };
            if workflow.tasks.iter().any(|t| config_references(t, id)) {
                referencing.push(format!("workflow:{wf_id}"));
            }
        }

        for (task_id, value, _etag) in self.store.list_with_values(project, "task") {
            if task_id == id {
                continue;
            }
            let Ok(config) = serde_json::from_value::<TaskConfig>(value) else {
                continue;
            };
            if config_references(&config, id) {
                referencing.push(format!("task:{task_id}"));
            }
        }

        referencing
    }

    /// List configs with prefix/workflow scoping and a cursor window
    pub fn list(&self, project: &str, query: &ListQuery) -> Result<ListPage, StoreError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        // Workflow scope: intersect with the workflow's declared task ids
        let scope: Option<Vec<String>> = match &query.workflow_id {
            Some(workflow_id) => {
                let (value, _etag) = self.store.get(&ResourceKey::workflow(project, workflow_id))?;
                let workflow: WorkflowConfig = serde_json::from_value(value).map_err(|e| {
                    StoreError::Transaction(format!("stored workflow corrupt: {e}"))
                })?;
                Some(
                    workflow
                        .tasks
                        .iter()
                        .map(|t| t.id.as_str().to_string())
                        .collect(),
                )
            }
            None => None,
        };

        let mut items: Vec<(String, Value, String)> = self
            .store
            .list_with_values(project, "task")
            .into_iter()
            .filter(|(id, _, _)| match &query.prefix {
                Some(prefix) => id.starts_with(prefix.as_str()),
                None => true,
            })
            .filter(|(id, _, _)| match &scope {
                Some(ids) => ids.contains(id),
                None => true,
            })
            .collect();

        if query.direction == ListDirection::Before {
            items.reverse();
        }
        if let Some(cursor) = &query.cursor {
            if let Some(pos) = items.iter().position(|(id, _, _)| id == cursor) {
                items = items.split_off(pos + 1);
            }
        }

        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|(id, _, _)| id.clone())
        } else {
            None
        };

        let items = items
            .into_iter()
            .map(|(_, mut value, etag)| {
                if let Some(map) = value.as_object_mut() {
                    map.insert("_etag".to_string(), Value::String(etag));
                }
                value
            })
            .collect();

        Ok(ListPage { items, next_cursor })
    }
}

/// Whether `config` references task `id` as child or processor
fn config_references(config: &TaskConfig, id: &str) -> bool {
    let id_matches = |t: &TaskConfig| t.id.as_str() == id || config_references(t, id);

    if config.id.as_str() == id {
        return true;
    }
    if let Some(block) = &config.parallel {
        if block.tasks.iter().any(id_matches) {
            return true;
        }
    }
    if let Some(block) = &config.composite {
        if block.tasks.iter().any(id_matches) {
            return true;
        }
    }
    if let Some(block) = &config.collection {
        if id_matches(&block.task) {
            return true;
        }
    }
    if let Some(block) = &config.wait {
        if let Some(processor) = &block.processor {
            if id_matches(processor) {
                return true;
            }
        }
    }
    if let Some(next) = config.on_success.as_ref().and_then(|t| t.next.as_ref()) {
        if next.as_str() == id {
            return true;
        }
    }
    if let Some(next) = config.on_error.as_ref().and_then(|t| t.next.as_ref()) {
        if next.as_str() == id {
            return true;
        }
    }
    false
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resources() -> TaskResources {
        TaskResources::new(Arc::new(ResourceStore::new()))
    }

    #[test]
    fn upsert_stamps_path_id_when_body_id_empty() {
        let res = resources();
        let (config, etag) = res
            .upsert("demo", "greet", json!({"type": "basic"}), None, None)
            .unwrap();
        assert_eq!(config.id.as_str(), "greet");
        assert!(!etag.is_empty());
    }

    #[test]
    fn upsert_rejects_id_mismatch() {
        let res = resources();
        let err = res
            .upsert("demo", "greet", json!({"id": "other"}), None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IdMismatch { .. }));
    }

    #[test]
    fn if_match_cas_semantics() {
        let res = resources();
        let (_c, etag) = res
            .upsert("demo", "greet", json!({"id": "greet"}), None, None)
            .unwrap();

        // wrong etag
        let err = res
            .upsert("demo", "greet", json!({"id": "greet"}), Some("bogus"), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::EtagMismatch));

        // stale if-match on a missing resource
        let err = res
            .upsert("demo", "absent", json!({"id": "absent"}), Some(&etag), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleIfMatch));

        // correct etag succeeds and rotates
        let (_c, new_etag) = res
            .upsert("demo", "greet", json!({"id": "greet"}), Some(&etag), None)
            .unwrap();
        assert_ne!(etag, new_etag);
    }

    #[test]
    fn delete_refuses_when_workflow_references() {
        let res = resources();
        res.upsert("demo", "greet", json!({"id": "greet"}), None, None)
            .unwrap();
        res.store().put(
            ResourceKey::workflow("demo", "wf1"),
            json!({"id": "wf1", "tasks": [{"id": "greet"}]}),
            WriteMeta {
                source: "api",
                updated_by: "test".into(),
            },
        );

        let err = res.delete("demo", "greet").unwrap_err();
        match err {
            StoreError::Conflict { resource, ids } => {
                assert_eq!(resource, "task:greet");
                assert_eq!(ids, vec!["workflow:wf1"]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn delete_refuses_when_task_references_as_processor() {
        let res = resources();
        res.upsert("demo", "approve-check", json!({"id": "approve-check"}), None, None)
            .unwrap();
        res.upsert(
            "demo",
            "gate",
            json!({
                "id": "gate",
                "type": "wait",
                "wait": {
                    "wait_for": "approve",
                    "condition": "signal.payload.ok",
                    "processor": {"id": "approve-check"}
                }
            }),
            None,
            None,
        )
        .unwrap();

        let err = res.delete("demo", "approve-check").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn delete_unreferenced_succeeds() {
        let res = resources();
        res.upsert("demo", "solo", json!({"id": "solo"}), None, None)
            .unwrap();
        res.delete("demo", "solo").unwrap();
        assert!(res.get("demo", "solo").is_err());
    }

    #[test]
    fn list_prefix_and_etag_injection() {
        let res = resources();
        for id in ["fetch-a", "fetch-b", "store-c"] {
            res.upsert("demo", id, json!({"id": id}), None, None).unwrap();
        }

        let page = res
            .list(
                "demo",
                &ListQuery {
                    prefix: Some("fetch-".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|i| i.get("_etag").is_some()));
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn list_cursor_window() {
        let res = resources();
        for id in ["a", "b", "c", "d"] {
            res.upsert("demo", id, json!({"id": id}), None, None).unwrap();
        }

        let first = res
            .list(
                "demo",
                &ListQuery {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let second = res
            .list(
                "demo",
                &ListQuery {
                    cursor: first.next_cursor,
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        let ids: Vec<&str> = second
            .items
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["c", "d"]);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn list_workflow_scope_intersects() {
        let res = resources();
        for id in ["a", "b", "c"] {
            res.upsert("demo", id, json!({"id": id}), None, None).unwrap();
        }
        res.store().put(
            ResourceKey::workflow("demo", "wf1"),
            json!({"id": "wf1", "tasks": [{"id": "a"}, {"id": "c"}]}),
            WriteMeta {
                source: "api",
                updated_by: "test".into(),
            },
        );

        let page = res
            .list(
                "demo",
                &ListQuery {
                    workflow_id: Some("wf1".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let ids: Vec<&str> = page.items.iter().map(|i| i["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn list_limit_is_clamped() {
        let res = resources();
        res.upsert("demo", "x", json!({"id": "x"}), None, None).unwrap();
        // zero becomes one, absurd becomes the ceiling; both must not panic
        res.list(
            "demo",
            &ListQuery {
                limit: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        res.list(
            "demo",
            &ListQuery {
                limit: Some(1_000_000),
                ..Default::default()
            },
        )
        .unwrap();
    }
}
