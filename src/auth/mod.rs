//! User authentication for the gateway.
//!
//! Provides:
//! - User registration with username/password (iterated SHA-256, 100k rounds + per-user salt)
//! - Token pairs: a short-lived access token and a long-lived refresh token
//! - Refresh with rotation (the old pair stops validating)
//! - SQLite-backed persistent storage
//!
//! ## Design Decisions
//! - Tokens are opaque random hex strings. Only their SHA-256 hashes are stored,
//!   so a leaked database does not leak usable tokens.
//! - Password hashing uses iterated SHA-256 (100k rounds) + per-user salt.

pub mod store;

pub use store::{AuthStore, Session, TokenPair, User};
