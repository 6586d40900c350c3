//! List and task lifecycle on top of the access resolver.
//!
//! Reads need VIEWER, edits need EDITOR. Deleting needs ownership, which is
//! stricter than EDITOR and checked here after resolution. System lists are
//! never deletable. Restore and permanent delete go through the owner-scoped
//! deleted-resource lookup instead of the live path.
//!
//! Steps have no access rules of their own: they follow their task.

pub mod lists;
pub mod steps;
pub mod tasks;

pub use lists::{ListDetail, ListService, FINISHED_LIST_NAME};
pub use steps::{NewStep, StepPatch, StepService};
pub use tasks::{TaskDetail, TaskPatch, TaskService};

use crate::error::{AccessError, AccessResult};
use crate::store::Resource;

/// Longest accepted list name, task or step description, in characters.
pub const MAX_TEXT_LEN: usize = 500;

/// Trim and validate user-supplied text.
fn clean_text(value: &str, field: &str) -> AccessResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AccessError::BadRequest(format!("{field} cannot be empty")));
    }
    if trimmed.chars().count() > MAX_TEXT_LEN {
        return Err(AccessError::BadRequest(format!(
            "{field} too long (max {MAX_TEXT_LEN} characters)"
        )));
    }
    Ok(trimmed.to_string())
}

/// Deletion guard: only the owner may delete, and never a system list.
///
/// `owner_id` comes from [`crate::access::AccessResolver::owner_of`].
fn ensure_deletable(resource: &Resource, owner_id: &str, principal_id: &str) -> AccessResult<()> {
    if owner_id != principal_id {
        return Err(AccessError::Forbidden(format!(
            "Only the owner can delete this {}",
            resource.kind()
        )));
    }
    if resource.is_system() {
        return Err(AccessError::Forbidden(
            "System lists cannot be deleted".into(),
        ));
    }
    Ok(())
}
