//! Client-side session handling.
//!
//! Provides:
//! - [`SessionGuard`], an HTTP wrapper that attaches bearer tokens and performs a
//!   single coalesced refresh when requests start failing with 401
//! - [`TokenStorage`] with in-memory and file-backed implementations
//! - [`SessionError`], the classified failure type every caller sees

pub mod error;
pub mod guard;
pub mod storage;

pub use error::SessionError;
pub use guard::{
    ApiRequest, ApiResponse, RequestBody, SessionGuard, TokenResponse, DEFAULT_TIMEOUT,
    LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH,
};
pub use storage::{FileTokenStorage, MemoryTokenStorage, TokenStorage};
