use super::{clean_text, ensure_deletable};
use crate::access::{AccessResolver, ShareRole};
use crate::error::{AccessError, AccessResult};
use crate::store::{Resource, ResourceKind, ResourceStore, Task, TodoList};
use serde::Serialize;
use std::sync::Arc;

/// Name of the per-user system list that collects completed tasks.
pub const FINISHED_LIST_NAME: &str = "Finished Tasks";

/// A list together with its live tasks.
#[derive(Debug, Clone, Serialize)]
pub struct ListDetail {
    #[serde(flatten)]
    pub list: TodoList,
    pub tasks: Vec<Task>,
}

/// List lifecycle: create, read, rename, soft delete, restore, purge.
#[derive(Clone)]
pub struct ListService {
    store: Arc<dyn ResourceStore>,
    resolver: AccessResolver,
}

impl ListService {
    pub fn new(store: Arc<dyn ResourceStore>, resolver: AccessResolver) -> Self {
        Self { store, resolver }
    }

    pub async fn create(&self, owner_id: &str, name: &str) -> AccessResult<TodoList> {
        let name = clean_text(name, "List name")?;
        let list = self.store.insert_list(owner_id, &name, false).await?;
        tracing::info!(list_id = %list.id, user_id = owner_id, "List created");
        Ok(list)
    }

    /// The owner's "Finished Tasks" list, created on first use.
    pub async fn ensure_finished_list(&self, owner_id: &str) -> AccessResult<TodoList> {
        if let Some(list) = self.store.find_system_list(owner_id).await? {
            return Ok(list);
        }
        let list = self
            .store
            .insert_list(owner_id, FINISHED_LIST_NAME, true)
            .await?;
        tracing::info!(list_id = %list.id, user_id = owner_id, "System list created");
        Ok(list)
    }

    /// Lists owned by `owner_id`. Shared lists come from the share service.
    pub async fn list_owned(&self, owner_id: &str) -> AccessResult<Vec<TodoList>> {
        Ok(self.store.lists_owned_by(owner_id).await?)
    }

    pub async fn get(&self, list_id: &str, principal_id: &str) -> AccessResult<ListDetail> {
        let list = self
            .resolver
            .resolve_list(list_id, principal_id, ShareRole::Viewer)
            .await?;
        let tasks = self.store.tasks_in_list(&list.id).await?;
        Ok(ListDetail { list, tasks })
    }

    pub async fn rename(
        &self,
        list_id: &str,
        principal_id: &str,
        name: &str,
    ) -> AccessResult<TodoList> {
        let name = clean_text(name, "List name")?;
        self.resolver
            .resolve_list(list_id, principal_id, ShareRole::Editor)
            .await?;

        let list = self
            .store
            .rename_list(list_id, &name)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("ToDoList with ID {list_id} not found")))?;
        tracing::info!(list_id, user_id = principal_id, "List updated");
        Ok(list)
    }

    /// Soft delete. Owner only, and never a system list.
    pub async fn remove(&self, list_id: &str, principal_id: &str) -> AccessResult<()> {
        let list = Resource::List(
            self.resolver
                .resolve_list(list_id, principal_id, ShareRole::Viewer)
                .await?,
        );
        let owner = self.resolver.owner_of(&list).await?;
        ensure_deletable(&list, &owner, principal_id)?;

        self.store.soft_delete(ResourceKind::List, list_id).await?;
        tracing::info!(list_id, user_id = principal_id, "List removed (soft)");
        Ok(())
    }

    pub async fn restore(&self, list_id: &str, principal_id: &str) -> AccessResult<TodoList> {
        self.resolver
            .resolve_deleted_owned(ResourceKind::List, list_id, principal_id)
            .await?;
        self.store.restore(ResourceKind::List, list_id).await?;
        tracing::info!(list_id, user_id = principal_id, "List restored");

        self.resolver
            .resolve_list(list_id, principal_id, ShareRole::Viewer)
            .await
    }

    /// Remove a soft-deleted list with its tasks and shares for good.
    pub async fn purge(&self, list_id: &str, principal_id: &str) -> AccessResult<()> {
        self.resolver
            .resolve_deleted_owned(ResourceKind::List, list_id, principal_id)
            .await?;
        self.store.purge(ResourceKind::List, list_id).await?;
        tracing::info!(list_id, user_id = principal_id, "List permanently deleted");
        Ok(())
    }
}
