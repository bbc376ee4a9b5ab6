//! Create-child-tasks use case
//!
//! Materializes every child row of a container parent atomically, then saves
//! the per-child config snapshots. State rows commit in one repository
//! transaction (readers see all-or-none); config saves happen after, with
//! best-effort compensating deletes when one fails. Stale configs are inert,
//! so compensation is safe to lose.

use tracing::{instrument, warn};

use crate::config::TaskConfig;
use crate::create_state::build_partial;
use crate::error::{OrdoError, Result};
use crate::state::TaskState;
use crate::store::{ConfigStore, ParentMetadata, StateStore};
use crate::types::{ExecutionType, TaskExecId};
use crate::workflow::WorkflowState;

/// Materializes child states for parallel / collection / composite parents
#[derive(Clone)]
pub struct CreateChildren {
    states: StateStore,
    configs: ConfigStore,
}

impl CreateChildren {
    pub fn new(states: StateStore, configs: ConfigStore) -> Self {
        Self { states, configs }
    }

    /// Create all children of `parent_state_id`; returns them in declaration order
    #[instrument(skip(self, workflow), fields(parent = %parent_state_id))]
    pub async fn create_children(
        &self,
        workflow: &WorkflowState,
        parent_state_id: TaskExecId,
    ) -> Result<Vec<TaskState>> {
        let parent = self.states.get_state(parent_state_id).await?;
        if !parent.can_have_children() {
            return Err(OrdoError::validation(format!(
                "state {} ({}) cannot have children",
                parent_state_id, parent.execution_type
            )));
        }

        let parent_config = self.configs.get(parent_state_id).await?;
        let metadata = self.configs.get_metadata(parent_state_id).await?;
        check_metadata_kind(parent.execution_type, &metadata)?;

        let child_configs = metadata.child_configs();
        for child in child_configs {
            if child.id.as_str().trim().is_empty() {
                return Err(OrdoError::validation(
                    "child config with empty id in metadata",
                ));
            }
        }

        // build every row before touching the store
        let mut children = Vec::with_capacity(child_configs.len());
        for config in child_configs {
            let env = config.merged_env(&parent_config.merged_env(&Default::default()));
            let partial = build_partial(workflow, config, env, Some(parent_state_id))?;
            children.push((
                TaskState::from_partial(TaskExecId::mint(), partial),
                config.clone(),
            ));
        }

        // atomic state insertion
        let states_only: Vec<TaskState> = children.iter().map(|(s, _)| s.clone()).collect();
        self.states
            .create_child_states_in_transaction(parent_state_id, states_only.clone())
            .await
            .map_err(OrdoError::from)?;

        // config snapshots after the transaction, with compensation
        self.save_child_configs(&children).await?;

        Ok(states_only)
    }

    async fn save_child_configs(&self, children: &[(TaskState, TaskConfig)]) -> Result<()> {
        let mut saved: Vec<TaskExecId> = Vec::with_capacity(children.len());
        for (state, config) in children {
            let result = async {
                self.configs.save(state.task_exec_id, config.clone()).await?;
                // container children (nested parallel/composite) need their
                // own metadata so the driver can fan them out in turn
                if let Some(metadata) = crate::create_state::static_parent_metadata(config) {
                    self.configs.save_metadata(state.task_exec_id, metadata).await?;
                }
                Ok::<(), crate::store::StoreError>(())
            }
            .await;

            if let Err(e) = result {
                let rolled_back = self.compensate(&saved).await;
                return Err(OrdoError::Transaction(format!(
                    "failed to save child config {} after transaction (rolled back {rolled_back} configs): {e}",
                    state.task_exec_id
                )));
            }
            saved.push(state.task_exec_id);
        }
        Ok(())
    }

    /// Best-effort deletes of configs (and metadata) already saved in this batch
    async fn compensate(&self, saved: &[TaskExecId]) -> usize {
        let mut rolled_back = 0;
        for id in saved {
            match self.configs.delete_all(*id).await {
                Ok(()) => rolled_back += 1,
                Err(e) => warn!(child = %id, error = %e, "compensating config delete failed"),
            }
        }
        rolled_back
    }
}

fn check_metadata_kind(
    execution_type: ExecutionType,
    metadata: &ParentMetadata,
) -> Result<()> {
    let matches = matches!(
        (execution_type, metadata),
        (ExecutionType::Parallel, ParentMetadata::Parallel(_))
            | (ExecutionType::Collection, ParentMetadata::Collection(_))
            | (ExecutionType::Composite, ParentMetadata::Composite(_))
    );
    if matches {
        Ok(())
    } else {
        Err(OrdoError::validation(format!(
            "metadata kind {} does not match execution type {execution_type}",
            metadata.kind()
        )))
    }
}

// ============================================================================
// TESTS
// ============================================================================
