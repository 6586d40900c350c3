//! SQLite-backed user and token store.
//!
//! Tables:
//! - `users`: username, optional email, password_hash, salt, created_at
//! - `sessions`: access_hash, refresh_hash, user_id, access/refresh expiry

use crate::sharing::UserDirectory;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default access token lifetime: 15 minutes (seconds).
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 15 * 60;

/// Default refresh token lifetime: 7 days (seconds).
pub const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 3600;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// A registered user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: i64,
}

/// A validated access token.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub expires_at: i64,
}

/// Plaintext tokens handed to the client. Only revealed once.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

/// SQLite-backed authentication store.
pub struct AuthStore {
    conn: Mutex<rusqlite::Connection>,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl AuthStore {
    /// Open (or create) the auth database at the given path.
    pub fn new(
        db_path: &Path,
        access_ttl_secs: Option<u64>,
        refresh_ttl_secs: Option<u64>,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                email TEXT,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                access_hash TEXT PRIMARY KEY,
                refresh_hash TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                access_expires_at INTEGER NOT NULL,
                refresh_expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_refresh_expires ON sessions(refresh_expires_at);",
        )?;

        // Databases created before emails were stored lack the column
        let has_email = conn
            .prepare("SELECT 1 FROM pragma_table_info('users') WHERE name = 'email'")?
            .exists([])?;
        if !has_email {
            conn.execute_batch("ALTER TABLE users ADD COLUMN email TEXT;")?;
        }
        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users(email COLLATE NOCASE);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            access_ttl_secs: access_ttl_secs.unwrap_or(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl_secs: refresh_ttl_secs.unwrap_or(DEFAULT_REFRESH_TTL_SECS),
        })
    }

    // ── User Management ─────────────────────────────────────────────

    /// Register a new user. Returns the user ID.
    pub fn register(&self, username: &str, password: &str) -> Result<String> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            bail!("Username cannot be empty");
        }
        if trimmed.len() > 64 {
            bail!("Username too long (max 64 characters)");
        }
        if password.len() < 8 {
            bail!("Password must be at least 8 characters");
        }

        let user_id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs();

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, username, password_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, trimmed, password_hash, salt, now as i64],
        );

        match result {
            Ok(_) => {
                tracing::info!(user_id = %user_id, username = trimmed, "User registered");
                Ok(user_id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("Username '{}' is already taken", trimmed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Authenticate a user by username + password.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let conn = self.conn.lock();
        let row: Result<(String, String, Option<String>, String, String, i64), _> = conn.query_row(
            "SELECT id, username, email, password_hash, salt, created_at
             FROM users WHERE username = ?1 COLLATE NOCASE",
            rusqlite::params![username.trim()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        );

        match row {
            Ok((id, stored_name, email, stored_hash, salt, created_at)) => {
                let attempt_hash = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
                    bail!("Invalid username or password");
                }
                Ok(User {
                    id,
                    username: stored_name,
                    email,
                    created_at,
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Dummy hash keeps unknown-user timing close to a wrong password
                let _ = hash_password(password, "0000000000000000");
                bail!("Invalid username or password");
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a user by ID.
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, username, email, created_at FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            user_from_row,
        );

        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a user by email address or username, ignoring case. An email
    /// match wins over a username match.
    pub fn find_user(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, username, email, created_at FROM users
             WHERE email = ?1 COLLATE NOCASE OR username = ?1 COLLATE NOCASE
             ORDER BY (email = ?1 COLLATE NOCASE) DESC
             LIMIT 1",
            rusqlite::params![login.trim()],
            user_from_row,
        );

        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach an email address to a user so others can share with them by email.
    pub fn set_email(&self, user_id: &str, email: &str) -> Result<()> {
        let email = email.trim();
        if !is_plausible_email(email) {
            bail!("Invalid email address '{}'", email);
        }

        let conn = self.conn.lock();
        let result = conn.execute(
            "UPDATE users SET email = ?2 WHERE id = ?1",
            rusqlite::params![user_id, email],
        );

        match result {
            Ok(0) => bail!("User {} not found", user_id),
            Ok(_) => {
                tracing::info!(user_id, "User email set");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("Email '{}' is already in use", email)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Count registered users.
    pub fn user_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── Token Management ────────────────────────────────────────────

    /// Issue a fresh access/refresh pair for an authenticated user.
    pub fn issue_tokens(&self, user_id: &str) -> Result<TokenPair> {
        let conn = self.conn.lock();
        self.insert_session(&conn, user_id)
    }

    /// Validate an access token. `None` if unknown or expired.
    pub fn validate_access(&self, token: &str) -> Option<Session> {
        let access_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, access_expires_at
             FROM sessions
             WHERE access_hash = ?1 AND access_expires_at > ?2",
            rusqlite::params![access_hash, now],
            |row| {
                Ok(Session {
                    user_id: row.get(0)?,
                    expires_at: row.get(1)?,
                })
            },
        )
        .ok()
    }

    /// Exchange a refresh token for a new pair. The old pair is revoked in the
    /// same transaction, so a refresh token works exactly once.
    /// Returns `None` if the refresh token is unknown or expired.
    pub fn refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>> {
        let refresh_hash = hash_token(refresh_token);
        let now = epoch_secs() as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let user_id: Option<String> = match tx.query_row(
            "SELECT user_id FROM sessions
             WHERE refresh_hash = ?1 AND refresh_expires_at > ?2",
            rusqlite::params![refresh_hash, now],
            |row| row.get(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(user_id) = user_id else {
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM sessions WHERE refresh_hash = ?1",
            rusqlite::params![refresh_hash],
        )?;
        let pair = self.insert_session(&tx, &user_id)?;
        tx.commit()?;

        tracing::debug!(user_id = %user_id, "Session tokens rotated");
        Ok(Some(pair))
    }

    /// Revoke the session an access token belongs to.
    pub fn revoke(&self, access_token: &str) -> Result<bool> {
        let access_hash = hash_token(access_token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE access_hash = ?1",
            rusqlite::params![access_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Revoke all sessions for a user.
    pub fn revoke_all_sessions(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        Ok(deleted as u64)
    }

    /// Drop sessions whose refresh token has expired.
    pub fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE refresh_expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }

    fn insert_session(&self, conn: &rusqlite::Connection, user_id: &str) -> Result<TokenPair> {
        let access_token = generate_token();
        let refresh_token = generate_token();
        let now = epoch_secs();

        conn.execute(
            "INSERT INTO sessions
                (access_hash, refresh_hash, user_id, created_at, access_expires_at, refresh_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                hash_token(&access_token),
                hash_token(&refresh_token),
                user_id,
                now as i64,
                (now + self.access_ttl_secs) as i64,
                (now + self.refresh_ttl_secs) as i64,
            ],
        )?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_ttl_secs,
        })
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    hex::encode(rand::random::<[u8; SALT_BYTES]>())
}

/// Generate a random token: 32 bytes, 64 hex chars.
fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Single-pass SHA-256 of a token. Tokens are already high-entropy.
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

impl UserDirectory for AuthStore {
    fn user_exists(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_user(user_id)?.is_some())
    }

    fn find_user_id(&self, login: &str) -> Result<Option<String>> {
        Ok(self.find_user(login)?.map(|user| user.id))
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// `local@domain.tld` with no whitespace.
fn is_plausible_email(email: &str) -> bool {
    if email.len() > 254 || email.contains(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, AuthStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("auth.db");
        let store = AuthStore::new(&db_path, Some(3600), Some(7200)).unwrap();
        (tmp, store)
    }

    fn registered(store: &AuthStore) -> String {
        store.register("test_user", "securepassword123").unwrap()
    }

    #[test]
    fn register_and_authenticate() {
        let (_tmp, store) = test_store();

        let user_id = registered(&store);
        assert!(!user_id.is_empty());

        let user = store.authenticate("TEST_user", "securepassword123").unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(user.username, "test_user");
    }

    #[test]
    fn register_duplicate_username_fails() {
        let (_tmp, store) = test_store();

        store.register("test_user", "password123!").unwrap();
        let result = store.register("Test_User", "otherpassword1");
        assert!(result.unwrap_err().to_string().contains("already taken"));
    }

    #[test]
    fn register_validates_input() {
        let (_tmp, store) = test_store();

        let empty = store.register("  ", "password123!").unwrap_err();
        assert!(empty.to_string().contains("empty"));
        let short = store.register("test_user", "short").unwrap_err();
        assert!(short.to_string().contains("8 characters"));
    }

    #[test]
    fn authenticate_rejects_bad_credentials() {
        let (_tmp, store) = test_store();
        registered(&store);

        let wrong = store.authenticate("test_user", "wrong_password").unwrap_err();
        assert!(wrong.to_string().contains("Invalid"));
        let ghost = store.authenticate("ghost_user", "anypassword1").unwrap_err();
        assert!(ghost.to_string().contains("Invalid"));
    }

    #[test]
    fn issued_access_token_validates() {
        let (_tmp, store) = test_store();
        let user_id = registered(&store);

        let pair = store.issue_tokens(&user_id).unwrap();
        assert_eq!(pair.access_token.len(), 64);
        assert_eq!(pair.refresh_token.len(), 64);
        assert_ne!(pair.access_token, pair.refresh_token);
        assert_eq!(pair.expires_in, 3600);

        let session = store.validate_access(&pair.access_token).unwrap();
        assert_eq!(session.user_id, user_id);
        assert!(store.validate_access(&pair.refresh_token).is_none());
    }

    #[test]
    fn refresh_rotates_both_tokens() {
        let (_tmp, store) = test_store();
        let user_id = registered(&store);
        let old = store.issue_tokens(&user_id).unwrap();

        let new = store.refresh(&old.refresh_token).unwrap().unwrap();
        assert_ne!(new.access_token, old.access_token);
        assert_ne!(new.refresh_token, old.refresh_token);

        assert!(store.validate_access(&old.access_token).is_none());
        assert!(store.refresh(&old.refresh_token).unwrap().is_none());
        assert_eq!(
            store.validate_access(&new.access_token).unwrap().user_id,
            user_id
        );
    }

    #[test]
    fn refresh_with_unknown_token_is_none() {
        let (_tmp, store) = test_store();
        assert!(store.refresh("not-a-token").unwrap().is_none());
    }

    #[test]
    fn expired_tokens_do_not_validate() {
        let tmp = TempDir::new().unwrap();
        let store = AuthStore::new(&tmp.path().join("auth.db"), Some(0), Some(0)).unwrap();
        let user_id = registered(&store);
        let pair = store.issue_tokens(&user_id).unwrap();

        assert!(store.validate_access(&pair.access_token).is_none());
        assert!(store.refresh(&pair.refresh_token).unwrap().is_none());
        assert_eq!(store.cleanup_expired_sessions().unwrap(), 1);
    }

    #[test]
    fn revoke_single_and_all() {
        let (_tmp, store) = test_store();
        let user_id = registered(&store);
        let a = store.issue_tokens(&user_id).unwrap();
        let b = store.issue_tokens(&user_id).unwrap();

        assert!(store.revoke(&a.access_token).unwrap());
        assert!(!store.revoke(&a.access_token).unwrap());
        assert!(store.validate_access(&a.access_token).is_none());
        assert!(store.validate_access(&b.access_token).is_some());

        assert_eq!(store.revoke_all_sessions(&user_id).unwrap(), 1);
        assert!(store.validate_access(&b.access_token).is_none());
    }

    #[test]
    fn user_lookup_and_count() {
        let (_tmp, store) = test_store();
        assert_eq!(store.user_count().unwrap(), 0);

        let user_id = registered(&store);
        assert_eq!(store.user_count().unwrap(), 1);
        assert_eq!(store.get_user(&user_id).unwrap().unwrap().username, "test_user");
        assert!(store.get_user("nonexistent_id").unwrap().is_none());
    }

    #[test]
    fn password_hash_depends_on_salt() {
        assert_eq!(
            hash_password("test_password", "fixed_salt_value"),
            hash_password("test_password", "fixed_salt_value")
        );
        assert_ne!(
            hash_password("test_password", "salt_a"),
            hash_password("test_password", "salt_b")
        );
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn email_lookup_and_uniqueness() {
        let (_tmp, store) = test_store();
        let user_id = registered(&store);
        let other = store.register("other_user", "password123!").unwrap();

        store.set_email(&user_id, "Test@Example.com").unwrap();
        assert_eq!(
            store.find_user("test@example.com").unwrap().unwrap().id,
            user_id
        );
        assert_eq!(store.find_user("TEST_USER").unwrap().unwrap().id, user_id);
        assert!(store.find_user("nobody@example.com").unwrap().is_none());
        assert_eq!(
            store.get_user(&user_id).unwrap().unwrap().email.as_deref(),
            Some("Test@Example.com")
        );

        let taken = store.set_email(&other, "test@EXAMPLE.com").unwrap_err();
        assert!(taken.to_string().contains("already in use"));
        let invalid = store.set_email(&other, "not-an-email").unwrap_err();
        assert!(invalid.to_string().contains("Invalid email"));
        assert!(store.set_email("ghost", "ghost@example.com").is_err());
    }

    #[test]
    fn user_directory_resolves_ids_and_logins() {
        let (_tmp, store) = test_store();
        let user_id = registered(&store);

        assert!(store.user_exists(&user_id).unwrap());
        assert!(!store.user_exists("ghost").unwrap());
        assert_eq!(store.find_user_id("test_user").unwrap(), Some(user_id));
    }

    #[test]
    fn email_shapes() {
        assert!(is_plausible_email("a@b.co"));
        assert!(!is_plausible_email("a@b"));
        assert!(!is_plausible_email("@b.co"));
        assert!(!is_plausible_email("a b@c.co"));
        assert!(!is_plausible_email("a@b@c.co"));
    }
}
