//! Unified error handling for the task execution core
//!
//! Each layer keeps its own thiserror enum (store, template, memory); this
//! module wraps them into a single [`OrdoError`] for the activity surface
//! and tags every error with an [`ErrorCategory`] so callers and the durable
//! runtime can decide retry semantics without parsing messages.
//!
//! Propagation policy:
//! - context cancellation is a soft exit (`Canceled`), never retried
//! - validation / not-found / conflict errors are surfaced, never retried
//! - adapter failures are wrapped and left to the runtime's retry policy

use thiserror::Error;

use crate::store::StoreError;
use crate::template::TemplateError;

// ============================================================================
// ERROR CATEGORY
// ============================================================================

/// Category token attached to every error
///
/// The token is part of the public contract: it appears in user-visible
/// messages and in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Concurrency,
    NotFound,
    Conflict,
    Adapter,
    Transaction,
    Canceled,
    Template,
    Execution,
    ConditionEval,
}

impl ErrorCategory {
    /// Stable token used in messages and event payloads
    pub fn token(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Concurrency => "concurrency_error",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Adapter => "adapter_error",
            ErrorCategory::Transaction => "transaction_error",
            ErrorCategory::Canceled => "canceled",
            ErrorCategory::Template => "template_error",
            ErrorCategory::Execution => "execution_error",
            ErrorCategory::ConditionEval => "CONDITION_EVAL_ERROR",
        }
    }
}

// ============================================================================
// TOP-LEVEL ERROR
// ============================================================================

/// Top-level error type for the task execution core
#[derive(Error, Debug)]
pub enum OrdoError {
    /// Input or configuration failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Store-level failure (not-found, etag, conflict, terminal write)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Template rendering failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// An agent / tool / memory backend failed
    #[error("adapter error: {0}")]
    Adapter(String),

    /// A multi-row transaction aborted
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The ambient cancellation token fired
    #[error("canceled")]
    Canceled,

    /// A task execution failed (response handler failure path)
    #[error("execution_error: {0}")]
    Execution(String),

    /// A wait-task condition failed to evaluate
    #[error("CONDITION_EVAL_ERROR: {0}")]
    ConditionEval(String),
}

impl OrdoError {
    /// Category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrdoError::Validation(_) => ErrorCategory::Validation,
            OrdoError::Store(e) => e.category(),
            OrdoError::Template(_) => ErrorCategory::Template,
            OrdoError::Adapter(_) => ErrorCategory::Adapter,
            OrdoError::Transaction(_) => ErrorCategory::Transaction,
            OrdoError::Canceled => ErrorCategory::Canceled,
            OrdoError::Execution(_) => ErrorCategory::Execution,
            OrdoError::ConditionEval(_) => ErrorCategory::ConditionEval,
        }
    }

    /// Shorthand for validation failures
    pub fn validation(msg: impl Into<String>) -> Self {
        OrdoError::Validation(msg.into())
    }

    /// Shorthand for adapter failures
    pub fn adapter(msg: impl Into<String>) -> Self {
        OrdoError::Adapter(msg.into())
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, OrdoError>;

// ============================================================================
// TESTS
// ============================================================================
