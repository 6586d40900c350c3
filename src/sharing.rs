//! Share management for lists and tasks.
//!
//! Every mutation validates before any row is written:
//! - sharing with the resource owner (or with yourself) is a `BadRequest`
//! - an unknown grantee is `NotFound`, reported only after the caller's own
//!   access was resolved
//! - a second share for the same `(resource, grantee)` is a `Conflict`
//!
//! Granting and changing shares requires EDITOR access on the resource,
//! listing them requires VIEWER. Revoking requires EDITOR access too, except
//! that a grantee may always remove their own share.
//!
//! Changes are announced on a broadcast channel so a push layer can notify
//! the affected user.

use crate::access::{AccessResolver, ShareRole};
use crate::error::{AccessError, AccessResult};
use crate::store::{Resource, ResourceKind, ResourceStore, Share, SharedResource};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the share event channel. Slow subscribers miss old events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change to the share set, addressed to the affected grantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShareEvent {
    Shared { share: Share },
    Unshared {
        kind: ResourceKind,
        resource_id: String,
        user_id: String,
    },
    RoleChanged { share: Share },
}

impl ShareEvent {
    /// The user the event should be delivered to.
    pub fn recipient(&self) -> &str {
        match self {
            Self::Shared { share } | Self::RoleChanged { share } => &share.shared_with_id,
            Self::Unshared { user_id, .. } => user_id,
        }
    }
}

/// Where grantees are looked up.
pub trait UserDirectory: Send + Sync {
    /// Whether a user with this id exists.
    fn user_exists(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Id of the user with this email address or username.
    fn find_user_id(&self, login: &str) -> anyhow::Result<Option<String>>;
}

/// Creates, updates, revokes and lists shares.
#[derive(Clone)]
pub struct ShareService {
    store: Arc<dyn ResourceStore>,
    resolver: AccessResolver,
    directory: Option<Arc<dyn UserDirectory>>,
    events: broadcast::Sender<ShareEvent>,
}

impl ShareService {
    pub fn new(store: Arc<dyn ResourceStore>, resolver: AccessResolver) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            resolver,
            directory: None,
            events,
        }
    }

    /// Check grantees against `directory`. Without one, grantee ids are taken
    /// as given and logins cannot be resolved.
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Subscribe to share changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// Grant `role` on a resource to the user `grantee_id`.
    pub async fn share(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        actor_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> AccessResult<Share> {
        let grantee_id = grantee_id.trim();
        if grantee_id.is_empty() {
            return Err(AccessError::BadRequest("A user to share with is required".into()));
        }
        if grantee_id == actor_id {
            return Err(share_with_self(kind));
        }

        let resource = self
            .resolver
            .resolve(kind, resource_id, actor_id, ShareRole::Editor)
            .await?;

        if let Some(directory) = &self.directory {
            if !directory.user_exists(grantee_id)? {
                return Err(AccessError::NotFound(format!(
                    "User with ID {grantee_id} not found"
                )));
            }
        }

        self.grant(&resource, actor_id, grantee_id, role).await
    }

    /// Grant `role` on a resource to the user with this email or username.
    pub async fn share_with_login(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        actor_id: &str,
        login: &str,
        role: ShareRole,
    ) -> AccessResult<Share> {
        let login = login.trim();
        if login.is_empty() {
            return Err(AccessError::BadRequest("A user to share with is required".into()));
        }

        let resource = self
            .resolver
            .resolve(kind, resource_id, actor_id, ShareRole::Editor)
            .await?;

        let found = match &self.directory {
            Some(directory) => directory.find_user_id(login)?,
            None => None,
        };
        let grantee_id =
            found.ok_or_else(|| AccessError::NotFound(format!("User {login} not found")))?;

        if grantee_id == actor_id {
            return Err(share_with_self(kind));
        }

        self.grant(&resource, actor_id, &grantee_id, role).await
    }

    async fn grant(
        &self,
        resource: &Resource,
        actor_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> AccessResult<Share> {
        let kind = resource.kind();
        let resource_id = resource.id();

        if grantee_id == self.resolver.owner_of(resource).await? {
            return Err(AccessError::BadRequest(format!(
                "You cannot share a {kind} with its owner"
            )));
        }

        if self
            .store
            .find_share(kind, resource_id, grantee_id)
            .await?
            .is_some()
        {
            return Err(already_shared(kind));
        }

        // The unique key still guards a concurrent insert of the same pair
        let share = self
            .store
            .create_share(kind, resource_id, grantee_id, role)
            .await?
            .ok_or_else(|| already_shared(kind))?;

        tracing::info!(
            kind = %kind,
            resource_id,
            actor_id,
            grantee_id,
            role = %role,
            "Resource shared"
        );
        self.publish(ShareEvent::Shared {
            share: share.clone(),
        });
        Ok(share)
    }

    /// Change the role of an existing share.
    pub async fn update_role(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        actor_id: &str,
        grantee_id: &str,
        role: ShareRole,
    ) -> AccessResult<Share> {
        self.resolver
            .resolve(kind, resource_id, actor_id, ShareRole::Editor)
            .await?;

        let share = self
            .store
            .update_share_role(kind, resource_id, grantee_id, role)
            .await?
            .ok_or_else(|| share_not_found(kind))?;

        tracing::info!(
            kind = %kind,
            resource_id,
            actor_id,
            grantee_id,
            role = %role,
            "Share role changed"
        );
        self.publish(ShareEvent::RoleChanged {
            share: share.clone(),
        });
        Ok(share)
    }

    /// Revoke `grantee_id`'s share. Grantees may always leave a share.
    pub async fn unshare(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        actor_id: &str,
        grantee_id: &str,
    ) -> AccessResult<()> {
        let required = if actor_id == grantee_id {
            ShareRole::Viewer
        } else {
            ShareRole::Editor
        };
        self.resolver
            .resolve(kind, resource_id, actor_id, required)
            .await?;

        if !self
            .store
            .delete_share(kind, resource_id, grantee_id)
            .await?
        {
            return Err(share_not_found(kind));
        }

        tracing::info!(kind = %kind, resource_id, actor_id, grantee_id, "Share removed");
        self.publish(ShareEvent::Unshared {
            kind,
            resource_id: resource_id.to_string(),
            user_id: grantee_id.to_string(),
        });
        Ok(())
    }

    /// Shares on a resource visible to anyone who can view it.
    pub async fn list_shares(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        actor_id: &str,
    ) -> AccessResult<Vec<Share>> {
        self.resolver
            .resolve(kind, resource_id, actor_id, ShareRole::Viewer)
            .await?;
        Ok(self.store.list_shares(kind, resource_id).await?)
    }

    /// Live lists and tasks shared with `principal_id`.
    pub async fn shared_with(&self, principal_id: &str) -> AccessResult<Vec<SharedResource>> {
        Ok(self.store.shared_with(principal_id).await?)
    }

    fn publish(&self, event: ShareEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn share_with_self(kind: ResourceKind) -> AccessError {
    AccessError::BadRequest(format!("You cannot share a {kind} with yourself"))
}

fn already_shared(kind: ResourceKind) -> AccessError {
    AccessError::Conflict(format!("This {kind} is already shared with that user"))
}

fn share_not_found(kind: ResourceKind) -> AccessError {
    AccessError::NotFound(format!("Share for this {kind} not found"))
}
