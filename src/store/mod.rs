//! Persistence for the task subsystem
//!
//! Three logical stores with strict ownership:
//!
//! - [`state_store`] - mutable task states, row-locked, transactional child
//!   insertion (the task repository)
//! - [`config_store`] - immutable per-execution config snapshots and typed
//!   parent metadata blobs
//! - [`resource_store`] - authored configs under ETag-versioned
//!   `(project, type, id)` keys, plus the task CRUD surface
//!
//! All three are in-memory, lock-free for reads (DashMap) with per-row
//! async locks for writes, matching the repository contract the durable
//! runtime consumes.

pub mod config_store;
pub mod resource_store;
pub mod state_store;

pub use config_store::{CollectionMeta, CompositeMeta, ConfigStore, ParallelMeta, ParentMetadata};
pub use resource_store::{
    ListDirection, ListPage, ListQuery, ResourceKey, ResourceStore, TaskResources,
};
pub use state_store::StateStore;

use thiserror::Error;

use crate::error::ErrorCategory;

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Errors shared by the three stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// If-Match did not match the stored ETag
    #[error("etag mismatch")]
    EtagMismatch,

    /// If-Match supplied but no stored version exists
    #[error("stale if-match: resource does not exist")]
    StaleIfMatch,

    /// Body id disagrees with the path id
    #[error("id mismatch: path {path_id:?} vs body {body_id:?}")]
    IdMismatch { path_id: String, body_id: String },

    /// Body failed to decode or validate
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// Delete refused because other resources still reference this one
    #[error("conflict: {resource} referenced by {ids:?}")]
    Conflict { resource: String, ids: Vec<String> },

    /// A write tried to leave a terminal status
    #[error("state {id} is terminal ({status}); write rejected")]
    TerminalState { id: String, status: String },

    /// Metadata blob kind did not match the parent's execution type
    #[error("metadata type mismatch: expected {expected}, found {found}")]
    MetadataType {
        expected: &'static str,
        found: &'static str,
    },

    /// Multi-row transaction aborted
    #[error("transaction aborted: {0}")]
    Transaction(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::NotFound { .. } => ErrorCategory::NotFound,
            StoreError::EtagMismatch | StoreError::StaleIfMatch => ErrorCategory::Concurrency,
            StoreError::IdMismatch { .. }
            | StoreError::InvalidBody(_)
            | StoreError::MetadataType { .. } => ErrorCategory::Validation,
            StoreError::Conflict { .. } => ErrorCategory::Conflict,
            StoreError::TerminalState { .. } => ErrorCategory::Concurrency,
            StoreError::Transaction(_) => ErrorCategory::Transaction,
        }
    }
}
