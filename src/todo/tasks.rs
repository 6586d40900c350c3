use super::{clean_text, ensure_deletable};
use crate::access::{AccessResolver, ShareRole};
use crate::error::{AccessError, AccessResult};
use crate::store::{Resource, ResourceKind, ResourceStore, Step, Task};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A task together with its live steps.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub steps: Vec<Step>,
}

/// Partial update of a task. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub description: Option<String>,
    pub completed: Option<bool>,
}

/// Task lifecycle: create in a list, read, update, soft delete, restore, purge.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn ResourceStore>,
    resolver: AccessResolver,
}

impl TaskService {
    pub fn new(store: Arc<dyn ResourceStore>, resolver: AccessResolver) -> Self {
        Self { store, resolver }
    }

    /// Add a task to a list. Needs EDITOR on the list. The task belongs to the
    /// list's owner; the creator is only recorded.
    pub async fn create(
        &self,
        list_id: &str,
        principal_id: &str,
        description: &str,
    ) -> AccessResult<Task> {
        let description = clean_text(description, "Description")?;
        let list = self
            .resolver
            .resolve_list(list_id, principal_id, ShareRole::Editor)
            .await?;

        let task = self
            .store
            .insert_task(principal_id, Some(&list.id), &description)
            .await?;
        tracing::info!(task_id = %task.id, list_id, user_id = principal_id, "Task created");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str, principal_id: &str) -> AccessResult<TaskDetail> {
        let task = self
            .resolver
            .resolve_task(task_id, principal_id, ShareRole::Viewer)
            .await?;
        let steps = self.store.steps_of_task(&task.id).await?;
        Ok(TaskDetail { task, steps })
    }

    pub async fn list_in(&self, list_id: &str, principal_id: &str) -> AccessResult<Vec<Task>> {
        let list = self
            .resolver
            .resolve_list(list_id, principal_id, ShareRole::Viewer)
            .await?;
        Ok(self.store.tasks_in_list(&list.id).await?)
    }

    pub async fn update(
        &self,
        task_id: &str,
        principal_id: &str,
        patch: &TaskPatch,
    ) -> AccessResult<Task> {
        let description = patch
            .description
            .as_deref()
            .map(|d| clean_text(d, "Description"))
            .transpose()?;

        self.resolver
            .resolve_task(task_id, principal_id, ShareRole::Editor)
            .await?;

        let task = self
            .store
            .update_task(task_id, description.as_deref(), patch.completed)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("Task with ID {task_id} not found")))?;
        tracing::info!(task_id, user_id = principal_id, "Task updated");
        Ok(task)
    }

    /// Soft delete. Owner only: the list's owner for a task in a list.
    pub async fn remove(&self, task_id: &str, principal_id: &str) -> AccessResult<()> {
        let task = Resource::Task(
            self.resolver
                .resolve_task(task_id, principal_id, ShareRole::Viewer)
                .await?,
        );
        let owner = self.resolver.owner_of(&task).await?;
        ensure_deletable(&task, &owner, principal_id)?;

        self.store.soft_delete(ResourceKind::Task, task_id).await?;
        tracing::info!(task_id, user_id = principal_id, "Task removed (soft)");
        Ok(())
    }

    pub async fn restore(&self, task_id: &str, principal_id: &str) -> AccessResult<Task> {
        self.resolver
            .resolve_deleted_owned(ResourceKind::Task, task_id, principal_id)
            .await?;
        self.store.restore(ResourceKind::Task, task_id).await?;
        tracing::info!(task_id, user_id = principal_id, "Task restored");

        self.resolver
            .resolve_task(task_id, principal_id, ShareRole::Viewer)
            .await
    }

    pub async fn purge(&self, task_id: &str, principal_id: &str) -> AccessResult<()> {
        self.resolver
            .resolve_deleted_owned(ResourceKind::Task, task_id, principal_id)
            .await?;
        self.store.purge(ResourceKind::Task, task_id).await?;
        tracing::info!(task_id, user_id = principal_id, "Task permanently deleted");
        Ok(())
    }
}
