use super::clean_text;
use crate::access::{AccessResolver, ShareRole};
use crate::error::{AccessError, AccessResult};
use crate::store::{ResourceStore, Step};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// A step to append to a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStep {
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// Partial update of a step. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepPatch {
    pub description: Option<String>,
    pub completed: Option<bool>,
}

/// Checklist steps of a task. Every call resolves the owning task: VIEWER to
/// read, EDITOR to change anything.
#[derive(Clone)]
pub struct StepService {
    store: Arc<dyn ResourceStore>,
    resolver: AccessResolver,
}

impl StepService {
    pub fn new(store: Arc<dyn ResourceStore>, resolver: AccessResolver) -> Self {
        Self { store, resolver }
    }

    pub async fn list(&self, task_id: &str, principal_id: &str) -> AccessResult<Vec<Step>> {
        let task = self
            .resolver
            .resolve_task(task_id, principal_id, ShareRole::Viewer)
            .await?;
        Ok(self.store.steps_of_task(&task.id).await?)
    }

    pub async fn create(
        &self,
        task_id: &str,
        principal_id: &str,
        step: &NewStep,
    ) -> AccessResult<Step> {
        let description = clean_text(&step.description, "Step description")?;
        let task = self
            .resolver
            .resolve_task(task_id, principal_id, ShareRole::Editor)
            .await?;

        let step = self
            .store
            .insert_step(&task.id, &description, step.completed)
            .await?;
        tracing::info!(step_id = %step.id, task_id, user_id = principal_id, "Step created");
        Ok(step)
    }

    pub async fn update(
        &self,
        step_id: &str,
        principal_id: &str,
        patch: &StepPatch,
    ) -> AccessResult<Step> {
        let description = patch
            .description
            .as_deref()
            .map(|d| clean_text(d, "Step description"))
            .transpose()?;

        let step = self.live_step(step_id).await?;
        self.resolver
            .resolve_task(&step.task_id, principal_id, ShareRole::Editor)
            .await?;

        let step = self
            .store
            .update_step(step_id, description.as_deref(), patch.completed)
            .await?
            .ok_or_else(|| step_not_found(step_id))?;
        tracing::info!(step_id, user_id = principal_id, "Step updated");
        Ok(step)
    }

    pub async fn remove(&self, step_id: &str, principal_id: &str) -> AccessResult<()> {
        let step = self.live_step(step_id).await?;
        self.resolver
            .resolve_task(&step.task_id, principal_id, ShareRole::Editor)
            .await?;

        self.store.soft_delete_step(step_id).await?;
        tracing::info!(step_id, user_id = principal_id, "Step removed (soft)");
        Ok(())
    }

    /// Put the task's steps in the given order. `step_ids` must name every
    /// live step of the task exactly once.
    pub async fn reorder(
        &self,
        task_id: &str,
        principal_id: &str,
        step_ids: &[String],
    ) -> AccessResult<Vec<Step>> {
        if step_ids.is_empty() {
            return Err(AccessError::BadRequest("Step order cannot be empty".into()));
        }

        let task = self
            .resolver
            .resolve_task(task_id, principal_id, ShareRole::Editor)
            .await?;

        let current: HashSet<String> = self
            .store
            .steps_of_task(&task.id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let requested: HashSet<&String> = step_ids.iter().collect();
        if requested.len() != step_ids.len()
            || requested.len() != current.len()
            || !requested.iter().all(|id| current.contains(*id))
        {
            return Err(AccessError::BadRequest(
                "Step order must list every step of the task exactly once".into(),
            ));
        }

        self.store.reorder_steps(&task.id, step_ids).await?;
        tracing::info!(task_id, user_id = principal_id, count = step_ids.len(), "Steps reordered");
        Ok(self.store.steps_of_task(&task.id).await?)
    }

    async fn live_step(&self, step_id: &str) -> AccessResult<Step> {
        self.store
            .find_step(step_id)
            .await?
            .ok_or_else(|| step_not_found(step_id))
    }
}

fn step_not_found(step_id: &str) -> AccessError {
    AccessError::NotFound(format!("Step with ID {step_id} not found"))
}
