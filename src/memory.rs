//! Memory operation driver
//!
//! Dispatches the eight memory operations against a registered backend.
//! Payloads are template-resolved and validated before any mutation; a
//! write is transactional: backup, clear, apply, with rollback restoring
//! the backup when the apply step fails. Final key resolution belongs to
//! the backend (it may honor a configured default key template).

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapter::{AdapterRegistry, MemoryBackend, MemoryMessage};
use crate::config::{MemoryBlock, TaskType};
use crate::context;
use crate::error::{OrdoError, Result};
use crate::state::{ExecutionResult, TaskState};
use crate::store::{ConfigStore, StateStore};
use crate::template;
use crate::types::{MemoryOp, MessageRole, TaskExecId};
use crate::workflow::WorkflowState;

/// Drives memory tasks end to end
#[derive(Clone)]
pub struct MemoryDriver {
    states: StateStore,
    configs: ConfigStore,
    registry: AdapterRegistry,
}

impl MemoryDriver {
    pub fn new(states: StateStore, configs: ConfigStore, registry: AdapterRegistry) -> Self {
        Self {
            states,
            configs,
            registry,
        }
    }

    /// Execute one memory task to an [`ExecutionResult`]
    #[instrument(skip(self, workflow, cancel), fields(exec_id = %task_exec_id))]
    pub async fn execute(
        &self,
        workflow: &WorkflowState,
        task_exec_id: TaskExecId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(OrdoError::Canceled);
        }

        let config = self.configs.get(task_exec_id).await?;
        if config.task_type != TaskType::Memory {
            return Err(OrdoError::validation(format!(
                "task {} is not a memory task",
                config.id
            )));
        }
        let block = config.memory.as_ref().expect("validated memory block");

        let backend = self
            .registry
            .memory(&block.memory_ref)
            .map_err(|e| OrdoError::validation(e.to_string()))?;

        let state = self
            .states
            .update_state(task_exec_id, TaskState::mark_running)
            .await?;

        let eval_context = payload_context(workflow, &state);
        let key = backend
            .resolve_key(&block.key_template, &eval_context)
            .map_err(|e| OrdoError::validation(format!("memory key: {e}")))?;

        debug!(op = %block.operation, key = %key, "memory operation");
        let output = self
            .dispatch(&*backend, block, &key, &eval_context)
            .await?;
        Ok(ExecutionResult::success(output))
    }

    async fn dispatch(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
        eval_context: &Value,
    ) -> Result<Value> {
        match block.operation {
            MemoryOp::Read => self.op_read(backend, key).await,
            MemoryOp::Write => self.op_write(backend, block, key, eval_context).await,
            MemoryOp::Append => self.op_append(backend, block, key, eval_context).await,
            MemoryOp::Delete => self.op_delete(backend, key).await,
            MemoryOp::Flush => self.op_flush(backend, block, key).await,
            MemoryOp::Health => self.op_health(backend, key).await,
            MemoryOp::Clear => self.op_clear(backend, block, key).await,
            MemoryOp::Stats => self.op_stats(backend, block, key).await,
        }
    }

    async fn op_read(&self, backend: &dyn MemoryBackend, key: &str) -> Result<Value> {
        let messages = backend
            .read(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("read: {e}")))?;
        let count = messages.len();
        Ok(json!({
            "messages": messages,
            "count": count,
            "key": key,
        }))
    }

    /// Transactional write: backup, clear, apply, rollback on failure
    async fn op_write(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
        eval_context: &Value,
    ) -> Result<Value> {
        let messages = resolve_payload_messages(block, eval_context)?;

        let backup = backend
            .read(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("write backup: {e}")))?;
        backend
            .clear(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("write clear: {e}")))?;

        if let Err(write_err) = backend.append(key, &messages).await {
            // apply failed: restore the backup byte for byte
            let rollback = async {
                backend.clear(key).await?;
                backend.append(key, &backup).await
            };
            return match rollback.await {
                Ok(_) => Err(OrdoError::adapter(format!(
                    "write failed, memory restored: {write_err}"
                ))),
                Err(rollback_err) => Err(OrdoError::adapter(format!(
                    "write failed and rollback failed: {rollback_err} (original: {write_err})"
                ))),
            };
        }

        Ok(json!({
            "success": true,
            "count": messages.len(),
            "key": key,
        }))
    }

    async fn op_append(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
        eval_context: &Value,
    ) -> Result<Value> {
        let messages = resolve_payload_messages(block, eval_context)?;
        let appended = backend
            .append(key, &messages)
            .await
            .map_err(|e| OrdoError::adapter(format!("append: {e}")))?;
        let total = backend
            .read(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("append count: {e}")))?
            .len();
        Ok(json!({
            "success": true,
            "appended": appended,
            "total_count": total,
            "key": key,
        }))
    }

    async fn op_delete(&self, backend: &dyn MemoryBackend, key: &str) -> Result<Value> {
        backend
            .clear(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("delete: {e}")))?;
        Ok(json!({"success": true, "key": key}))
    }

    async fn op_flush(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
    ) -> Result<Value> {
        if !backend.supports_flush() {
            return Err(OrdoError::validation(format!(
                "memory {} does not support flush",
                block.memory_ref
            )));
        }

        if block.config.dry_run {
            let health = backend
                .health(key)
                .await
                .map_err(|e| OrdoError::adapter(format!("flush dry-run: {e}")))?;
            return Ok(json!({
                "success": true,
                "dry_run": true,
                "summary_generated": false,
                "message_count": health.message_count,
                "token_count": health.token_count,
                "key": key,
            }));
        }

        let outcome = backend
            .flush(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("flush: {e}")))?;
        Ok(json!({
            "success": true,
            "dry_run": false,
            "summary_generated": outcome.summary_generated,
            "message_count": outcome.message_count,
            "token_count": outcome.token_count,
            "key": key,
        }))
    }

    async fn op_health(&self, backend: &dyn MemoryBackend, key: &str) -> Result<Value> {
        let health = backend
            .health(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("health: {e}")))?;
        Ok(json!({
            "healthy": health.healthy,
            "token_count": health.token_count,
            "message_count": health.message_count,
            "flush_strategy": health.flush_strategy,
            "last_flush": health.last_flush,
            "current_tokens": health.token_count,
            "key": key,
        }))
    }

    async fn op_clear(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
    ) -> Result<Value> {
        if !block.config.confirm {
            return Err(OrdoError::validation(
                "clear requires confirm=true in the operation config",
            ));
        }

        // snapshot before destruction so the count survives the clear
        let backup = backend
            .read(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("clear snapshot: {e}")))?;
        let cleared = backend
            .clear(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("clear: {e}")))?;
        if cleared != backup.len() {
            warn!(snapshot = backup.len(), cleared, "clear count drifted under concurrent writes");
        }

        Ok(json!({
            "success": true,
            "messages_cleared": cleared,
            "backup_created": true,
            "key": key,
        }))
    }

    async fn op_stats(
        &self,
        backend: &dyn MemoryBackend,
        block: &MemoryBlock,
        key: &str,
    ) -> Result<Value> {
        let health = backend
            .health(key)
            .await
            .map_err(|e| OrdoError::adapter(format!("stats: {e}")))?;
        let mut stats = json!({
            "message_count": health.message_count,
            "token_count": health.token_count,
            "flush_strategy": health.flush_strategy,
            "key": key,
        });
        if block.config.include_content && health.message_count > 0 {
            stats["avg_tokens_per_message"] =
                json!(health.token_count as f64 / health.message_count as f64);
        }
        Ok(stats)
    }
}

// ============================================================================
// PAYLOAD RESOLUTION
// ============================================================================

/// Evaluation context for key templates and payloads
fn payload_context(workflow: &WorkflowState, state: &TaskState) -> Value {
    let mut ctx = context::workflow_context(workflow);
    if let Some(map) = ctx.as_object_mut() {
        map.insert("input".to_string(), state.input.clone());
    }
    ctx
}

/// Resolve and validate the payload into memory messages
///
/// A single map is one message, an array is many, a bare string becomes a
/// user message. Every message must carry a known role and non-empty
/// content; the first invalid message aborts the whole operation before
/// any mutation.
fn resolve_payload_messages(
    block: &MemoryBlock,
    eval_context: &Value,
) -> Result<Vec<MemoryMessage>> {
    let payload = block
        .payload
        .as_ref()
        .ok_or_else(|| OrdoError::validation(format!("{} requires a payload", block.operation)))?;

    let resolved = template::parse_map(payload, eval_context)?;

    let raw_messages: Vec<Value> = match resolved {
        Value::Array(items) => items,
        Value::Object(map) => vec![Value::Object(map)],
        Value::String(content) => vec![json!({"role": "user", "content": content})],
        other => {
            return Err(OrdoError::validation(format!(
                "payload must be a message, a list of messages, or a string; got {other}"
            )))
        }
    };

    let mut messages = Vec::with_capacity(raw_messages.len());
    for (position, raw) in raw_messages.iter().enumerate() {
        messages.push(validate_message(position, raw)?);
    }
    Ok(messages)
}

fn validate_message(position: usize, raw: &Value) -> Result<MemoryMessage> {
    let map = raw.as_object().ok_or_else(|| {
        OrdoError::validation(format!("payload message {position} is not a map"))
    })?;

    let role_str = map
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| OrdoError::validation(format!("payload message {position} missing role")))?;
    let role = MessageRole::parse(role_str).ok_or_else(|| {
        OrdoError::validation(format!(
            "payload message {position} has invalid role {role_str:?}"
        ))
    })?;

    let content = map
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(OrdoError::validation(format!(
            "payload message {position} has empty content"
        )));
    }

    Ok(MemoryMessage {
        role,
        content: content.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
