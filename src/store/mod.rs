//! Resource and share persistence.
//!
//! Provides:
//! - The list / task / step / share records the access layer reasons about
//! - [`ResourceStore`], the narrow async interface the core consumes
//! - [`SqliteStore`], the rusqlite-backed implementation
//!
//! Every read on the live path excludes soft-deleted rows. Only
//! [`ResourceStore::find_deleted_owned`] looks at deleted rows for their
//! owner, and [`ResourceStore::list_owner`] reads a list's owner whatever its
//! deletion state.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::access::ShareRole;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Records ─────────────────────────────────────────────────────────

/// The two kinds of access-controlled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    List,
    Task,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Task => "task",
        }
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::List),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A to-do list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// System lists (e.g. "Finished Tasks") cannot be deleted.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A task, optionally belonging to a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Creator of the task. Owns it only when the task has no list; a task in
    /// a list belongs to the list's owner.
    pub owner_id: String,
    pub todo_list_id: Option<String>,
    pub description: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One checklist step of a task, kept in `position` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub task_id: String,
    pub description: String,
    pub completed: bool,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Either kind of resource, as returned by a successful access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    List(TodoList),
    Task(Task),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::List(_) => ResourceKind::List,
            Self::Task(_) => ResourceKind::Task,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::List(l) => &l.id,
            Self::Task(t) => &t.id,
        }
    }

    /// Owner recorded on the row. See [`Task::owner_id`] for tasks in a list.
    pub fn owner_id(&self) -> &str {
        match self {
            Self::List(l) => &l.owner_id,
            Self::Task(t) => &t.owner_id,
        }
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::List(l) => l.deleted_at,
            Self::Task(t) => t.deleted_at,
        }
    }

    /// Parent list of a task. Lists have no parent.
    pub fn parent_list_id(&self) -> Option<&str> {
        match self {
            Self::List(_) => None,
            Self::Task(t) => t.todo_list_id.as_deref(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::List(l) if l.is_system)
    }

    pub fn into_list(self) -> Option<TodoList> {
        match self {
            Self::List(l) => Some(l),
            Self::Task(_) => None,
        }
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            Self::Task(t) => Some(t),
            Self::List(_) => None,
        }
    }
}

/// A grant of `role` on one resource to one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub shared_with_id: String,
    pub role: ShareRole,
    pub created_at: DateTime<Utc>,
}

/// A live resource shared with a principal, with the role they hold on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedResource {
    pub resource: Resource,
    pub role: ShareRole,
}

// ── Store interface ─────────────────────────────────────────────────

/// Persistence consumed by the access, sharing and lifecycle services.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource by id, excluding soft-deleted rows.
    async fn find_live(&self, kind: ResourceKind, id: &str) -> Result<Option<Resource>>;

    /// Fetch a soft-deleted resource owned by `owner_id`. Used by restore and
    /// permanent delete only. A task in a list is owned by the list's owner.
    async fn find_deleted_owned(
        &self,
        kind: ResourceKind,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<Resource>>;

    /// Owner of a list, live or soft-deleted. `None` once it is purged.
    async fn list_owner(&self, list_id: &str) -> Result<Option<String>>;

    /// Share for `(resource, principal)`, ignoring shares on deleted resources.
    async fn find_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        principal_id: &str,
    ) -> Result<Option<Share>>;

    /// Insert a share. Returns `None` when one already exists for the pair;
    /// the existing row is left untouched.
    async fn create_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> Result<Option<Share>>;

    /// Remove a share. Returns whether a row was deleted.
    async fn delete_share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
    ) -> Result<bool>;

    /// Change the role of an existing share. Returns `None` if there is none.
    async fn update_share_role(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> Result<Option<Share>>;

    /// All shares on a resource, oldest first.
    async fn list_shares(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Share>>;

    /// Live lists and tasks directly shared with `principal_id`.
    async fn shared_with(&self, principal_id: &str) -> Result<Vec<SharedResource>>;

    async fn insert_list(&self, owner_id: &str, name: &str, is_system: bool) -> Result<TodoList>;

    async fn insert_task(
        &self,
        owner_id: &str,
        todo_list_id: Option<&str>,
        description: &str,
    ) -> Result<Task>;

    async fn rename_list(&self, id: &str, name: &str) -> Result<Option<TodoList>>;

    async fn update_task(
        &self,
        id: &str,
        description: Option<&str>,
        completed: Option<bool>,
    ) -> Result<Option<Task>>;

    /// Live lists owned by `owner_id`, oldest first.
    async fn lists_owned_by(&self, owner_id: &str) -> Result<Vec<TodoList>>;

    /// Live tasks of a list, oldest first.
    async fn tasks_in_list(&self, list_id: &str) -> Result<Vec<Task>>;

    /// The owner's live system list, if one was created.
    async fn find_system_list(&self, owner_id: &str) -> Result<Option<TodoList>>;

    /// Mark a live resource deleted. Returns whether a row changed.
    async fn soft_delete(&self, kind: ResourceKind, id: &str) -> Result<bool>;

    /// Clear the deletion mark. Returns whether a row changed.
    async fn restore(&self, kind: ResourceKind, id: &str) -> Result<bool>;

    /// Remove a resource and everything hanging off it (tasks, steps, shares).
    async fn purge(&self, kind: ResourceKind, id: &str) -> Result<bool>;

    /// Append a step after the task's last live step.
    async fn insert_step(
        &self,
        task_id: &str,
        description: &str,
        completed: bool,
    ) -> Result<Step>;

    /// A live step by id.
    async fn find_step(&self, id: &str) -> Result<Option<Step>>;

    /// Live steps of a task in position order.
    async fn steps_of_task(&self, task_id: &str) -> Result<Vec<Step>>;

    async fn update_step(
        &self,
        id: &str,
        description: Option<&str>,
        completed: Option<bool>,
    ) -> Result<Option<Step>>;

    /// Mark a live step deleted. Returns whether a row changed.
    async fn soft_delete_step(&self, id: &str) -> Result<bool>;

    /// Renumber the given steps of a task in the order given, atomically.
    async fn reorder_steps(&self, task_id: &str, step_ids: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: "t1".into(),
            owner_id: "alice".into(),
            todo_list_id: Some("l1".into()),
            description: "buy milk".into(),
            completed: false,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn resource_accessors_follow_variant() {
        let task = Resource::Task(sample_task());
        assert_eq!(task.kind(), ResourceKind::Task);
        assert_eq!(task.id(), "t1");
        assert_eq!(task.owner_id(), "alice");
        assert_eq!(task.parent_list_id(), Some("l1"));
        assert!(!task.is_system());
        assert!(task.clone().into_list().is_none());
        assert!(task.into_task().is_some());
    }

    #[test]
    fn system_flag_only_applies_to_lists() {
        let list = Resource::List(TodoList {
            id: "l1".into(),
            owner_id: "alice".into(),
            name: "Finished Tasks".into(),
            is_system: true,
            created_at: Utc::now(),
            deleted_at: None,
        });
        assert!(list.is_system());
        assert_eq!(list.parent_list_id(), None);
    }

    #[test]
    fn resource_serializes_with_kind_tag() {
        let json = serde_json::to_value(Resource::Task(sample_task())).unwrap();
        assert_eq!(json["kind"], "task");
        assert_eq!(json["todo_list_id"], "l1");
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [ResourceKind::List, ResourceKind::Task] {
            assert_eq!(ResourceKind::from_str_lossy(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::from_str_lossy("step"), None);
    }
}
