//! Typed failures of access resolution and share management.
//!
//! Stores and startup code return `anyhow::Result`; anything that crosses the
//! access-control seam is narrowed to [`AccessError`] so callers (the gateway,
//! the CLI) can translate it into a protocol-level response.

use thiserror::Error;

/// Why an access-controlled operation was refused.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The resource is absent, or soft-deleted when a live lookup was required.
    #[error("{0}")]
    NotFound(String),

    /// The principal is authenticated but lacks the required role.
    #[error("{0}")]
    Forbidden(String),

    /// The operation would duplicate an existing share.
    #[error("{0}")]
    Conflict(String),

    /// The request is malformed, e.g. sharing a resource with its owner.
    #[error("{0}")]
    BadRequest(String),

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AccessError {
    /// Short machine-readable kind, used in logs and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad_request",
            Self::Storage(_) => "storage",
        }
    }
}

/// Result type for access-controlled operations.
pub type AccessResult<T> = std::result::Result<T, AccessError>;
