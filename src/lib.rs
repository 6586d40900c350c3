//! Shared to-do lists with share-aware access control.
//!
//! Server side: [`access::AccessResolver`] decides who may view or edit a list
//! or task, the [`todo`] and [`sharing`] services build on it, and [`gateway`]
//! exposes them over HTTP. Client side: [`session::SessionGuard`] keeps an
//! API session alive with a single-flight token refresh.

pub mod access;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod session;
pub mod sharing;
pub mod store;
pub mod todo;

pub use access::{AccessResolver, GrantSource, ShareRole};
pub use config::Config;
pub use error::{AccessError, AccessResult};
pub use session::{SessionError, SessionGuard};
