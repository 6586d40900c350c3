//! Per-request access decisions for lists and tasks.
//!
//! A decision is a pure function of the principal, the live resource, its
//! owner and the shares reachable through its grant sources. Nothing is
//! cached: a revoked share stops granting on the very next call.

use super::role::{satisfies, ShareRole};
use crate::error::{AccessError, AccessResult};
use crate::store::{Resource, ResourceKind, ResourceStore, Task, TodoList};
use std::sync::Arc;

/// Where a share granting access on a resource may come from.
///
/// Sources are evaluated in order and short-circuit: the first one holding a
/// sufficient role grants access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSource {
    /// A share on the resource itself.
    Direct,
    /// A share on the task's parent list.
    ParentList,
}

const LIST_SOURCES: &[GrantSource] = &[GrantSource::Direct];
const TASK_SOURCES: &[GrantSource] = &[GrantSource::Direct, GrantSource::ParentList];

/// Grant sources consulted for a kind of resource.
pub fn grant_sources(kind: ResourceKind) -> &'static [GrantSource] {
    match kind {
        ResourceKind::List => LIST_SOURCES,
        ResourceKind::Task => TASK_SOURCES,
    }
}

/// Answers "may this principal act on this resource with this role?".
#[derive(Clone)]
pub struct AccessResolver {
    store: Arc<dyn ResourceStore>,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// The principal who owns `resource`.
    ///
    /// A task in a list belongs to the list's owner, also while the list is
    /// soft-deleted. The task's creator is not an owner. Lists, and tasks
    /// outside any list, are owned by their recorded `owner_id`.
    pub async fn owner_of(&self, resource: &Resource) -> AccessResult<String> {
        if let Some(list_id) = resource.parent_list_id() {
            if let Some(owner) = self.store.list_owner(list_id).await? {
                return Ok(owner);
            }
        }
        Ok(resource.owner_id().to_string())
    }

    /// Resolve a live resource for `principal_id` requiring `required`.
    ///
    /// Owners (see [`Self::owner_of`]) always pass. Otherwise one of the
    /// kind's grant sources must hold a share whose role satisfies `required`.
    /// Soft-deleted resources are `NotFound`, for their owner too.
    pub async fn resolve(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        principal_id: &str,
        required: ShareRole,
    ) -> AccessResult<Resource> {
        let resource = self
            .store
            .find_live(kind, resource_id)
            .await?
            .ok_or_else(|| not_found(kind, resource_id))?;

        if self.owner_of(&resource).await? == principal_id {
            return Ok(resource);
        }

        let mut best_held: Option<ShareRole> = None;
        for source in grant_sources(kind) {
            let share = match source {
                GrantSource::Direct => {
                    self.store
                        .find_share(kind, resource.id(), principal_id)
                        .await?
                }
                GrantSource::ParentList => match resource.parent_list_id() {
                    Some(list_id) => {
                        self.store
                            .find_share(ResourceKind::List, list_id, principal_id)
                            .await?
                    }
                    None => None,
                },
            };

            if let Some(share) = share {
                if satisfies(share.role, required) {
                    tracing::debug!(
                        kind = %kind,
                        resource_id,
                        principal_id,
                        source = ?source,
                        role = %share.role,
                        "access granted via share"
                    );
                    return Ok(resource);
                }
                best_held = best_held.max(Some(share.role));
            }
        }

        tracing::debug!(
            kind = %kind,
            resource_id,
            principal_id,
            required = %required,
            "access denied"
        );

        Err(match best_held {
            None => AccessError::Forbidden(format!("You do not have access to this {kind}")),
            Some(_) => AccessError::Forbidden(format!(
                "You need {} permissions for this action",
                display_role(required)
            )),
        })
    }

    pub async fn resolve_list(
        &self,
        list_id: &str,
        principal_id: &str,
        required: ShareRole,
    ) -> AccessResult<TodoList> {
        let resource = self
            .resolve(ResourceKind::List, list_id, principal_id, required)
            .await?;
        resource
            .into_list()
            .ok_or_else(|| not_found(ResourceKind::List, list_id))
    }

    pub async fn resolve_task(
        &self,
        task_id: &str,
        principal_id: &str,
        required: ShareRole,
    ) -> AccessResult<Task> {
        let resource = self
            .resolve(ResourceKind::Task, task_id, principal_id, required)
            .await?;
        resource
            .into_task()
            .ok_or_else(|| not_found(ResourceKind::Task, task_id))
    }

    /// Owner-scoped lookup of a soft-deleted resource for restore and
    /// permanent delete, with the same notion of owner as [`Self::owner_of`].
    /// Anything else is `NotFound`.
    pub async fn resolve_deleted_owned(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        principal_id: &str,
    ) -> AccessResult<Resource> {
        self.store
            .find_deleted_owned(kind, resource_id, principal_id)
            .await?
            .ok_or_else(|| {
                AccessError::NotFound(format!(
                    "Deleted {} with ID {resource_id} not found",
                    display_kind(kind)
                ))
            })
    }
}

fn not_found(kind: ResourceKind, id: &str) -> AccessError {
    AccessError::NotFound(format!("{} with ID {id} not found", display_kind(kind)))
}

fn display_kind(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::List => "ToDoList",
        ResourceKind::Task => "Task",
    }
}

fn display_role(role: ShareRole) -> &'static str {
    match role {
        ShareRole::Viewer => "Viewer",
        ShareRole::Editor => "Editor",
    }
}
