//! Share-aware access control for lists and tasks.
//!
//! Provides:
//! - [`ShareRole`] with its total order (EDITOR implies VIEWER)
//! - [`AccessResolver`], which checks ownership first and then each
//!   [`GrantSource`] in turn
//!
//! Deletion is deliberately not a role: it requires ownership and is checked
//! by the lifecycle services after resolution.

pub mod resolver;
pub mod role;

pub use resolver::{grant_sources, AccessResolver, GrantSource};
pub use role::{satisfies, ShareRole};
