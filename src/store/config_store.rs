//! Config store - immutable per-execution snapshots
//!
//! Keyed by `task_exec_id`. A config is written once by create-state and
//! never mutated afterwards; overwrites with identical content are tolerated
//! for crash recovery. Parent executions additionally own one typed metadata
//! blob binding them to their child configs.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::store::StoreError;
use crate::types::{CollectionMode, Strategy, TaskExecId};

// ============================================================================
// PARENT METADATA
// ============================================================================

/// Parallel parent metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMeta {
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub child_configs: Vec<TaskConfig>,
}

/// Collection parent metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub mode: CollectionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    #[serde(default)]
    pub continue_on_error: bool,
    pub item_var: String,
    pub index_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    pub child_configs: Vec<TaskConfig>,
}

/// Composite parent metadata (ordered children)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeMeta {
    pub child_configs: Vec<TaskConfig>,
}

/// Tagged parent→children binding
///
/// The store hands this back as the full enum; drivers perform exactly one
/// typed cast and get a precise error on mismatch instead of a duck-typed
/// map probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParentMetadata {
    Parallel(ParallelMeta),
    Collection(CollectionMeta),
    Composite(CompositeMeta),
}

impl ParentMetadata {
    pub fn kind(&self) -> &'static str {
        match self {
            ParentMetadata::Parallel(_) => "parallel",
            ParentMetadata::Collection(_) => "collection",
            ParentMetadata::Composite(_) => "composite",
        }
    }

    /// Child configs regardless of kind
    pub fn child_configs(&self) -> &[TaskConfig] {
        match self {
            ParentMetadata::Parallel(m) => &m.child_configs,
            ParentMetadata::Collection(m) => &m.child_configs,
            ParentMetadata::Composite(m) => &m.child_configs,
        }
    }

    pub fn as_parallel(&self) -> Result<&ParallelMeta, StoreError> {
        match self {
            ParentMetadata::Parallel(m) => Ok(m),
            other => Err(StoreError::MetadataType {
                expected: "parallel",
                found: other.kind(),
            }),
        }
    }

    pub fn as_collection(&self) -> Result<&CollectionMeta, StoreError> {
        match self {
            ParentMetadata::Collection(m) => Ok(m),
            other => Err(StoreError::MetadataType {
                expected: "collection",
                found: other.kind(),
            }),
        }
    }

    pub fn as_composite(&self) -> Result<&CompositeMeta, StoreError> {
        match self {
            ParentMetadata::Composite(m) => Ok(m),
            other => Err(StoreError::MetadataType {
                expected: "composite",
                found: other.kind(),
            }),
        }
    }
}

// ============================================================================
// CONFIG STORE
// ============================================================================

/// Per-execution config snapshots plus parent metadata blobs
#[derive(Clone, Default)]
pub struct ConfigStore {
    configs: Arc<DashMap<TaskExecId, TaskConfig>>,
    metadata: Arc<DashMap<TaskExecId, ParentMetadata>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a config for one execution (idempotent overwrite)
    pub async fn save(&self, id: TaskExecId, config: TaskConfig) -> Result<(), StoreError> {
        self.configs.insert(id, config);
        Ok(())
    }

    pub async fn get(&self, id: TaskExecId) -> Result<TaskConfig, StoreError> {
        self.configs
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::NotFound {
                resource: "task_config",
                id: id.to_string(),
            })
    }

    /// Delete a snapshot; absent is fine (compensation path re-runs)
    pub async fn delete(&self, id: TaskExecId) -> Result<(), StoreError> {
        self.configs.remove(&id);
        Ok(())
    }

    pub async fn save_metadata(
        &self,
        id: TaskExecId,
        metadata: ParentMetadata,
    ) -> Result<(), StoreError> {
        self.metadata.insert(id, metadata);
        Ok(())
    }

    pub async fn get_metadata(&self, id: TaskExecId) -> Result<ParentMetadata, StoreError> {
        self.metadata
            .get(&id)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::NotFound {
                resource: "task_metadata",
                id: id.to_string(),
            })
    }

    /// Remove the snapshot and any metadata (parent teardown)
    pub async fn delete_all(&self, id: TaskExecId) -> Result<(), StoreError> {
        self.configs.remove(&id);
        self.metadata.remove(&id);
        Ok(())
    }

    pub fn contains(&self, id: TaskExecId) -> bool {
        self.configs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
