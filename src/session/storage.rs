//! Where the client keeps its access and refresh tokens.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Token persistence used by [`SessionGuard`](super::SessionGuard).
pub trait TokenStorage: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredTokens {
    access_token: String,
    refresh_token: String,
}

/// Process-local storage. Tokens are gone when the process exits.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    tokens: Mutex<Option<StoredTokens>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access_token: &str, refresh_token: &str) -> Self {
        Self {
            tokens: Mutex::new(Some(StoredTokens {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
            })),
        }
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn access_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.access_token.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.refresh_token.clone())
    }

    fn set_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        *self.tokens.lock() = Some(StoredTokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
        });
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.tokens.lock() = None;
        Ok(())
    }
}

/// JSON file storage that survives restarts.
///
/// Reads are served from memory; every change is written through. On unix the
/// file is readable by its owner only.
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
    tokens: Mutex<Option<StoredTokens>>,
}

impl FileTokenStorage {
    /// Open the token file, loading any tokens already stored there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tokens = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read token file {}", path.display()))?;
            if raw.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str(&raw).with_context(|| {
                    format!("Token file {} is not valid JSON", path.display())
                })?)
            }
        } else {
            None
        };

        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tokens: &StoredTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(tokens)?;
        write_private(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write token file {}", self.path.display()))
    }
}

impl TokenStorage for FileTokenStorage {
    fn access_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.access_token.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().map(|t| t.refresh_token.clone())
    }

    fn set_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let tokens = StoredTokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
        };
        let mut guard = self.tokens.lock();
        self.persist(&tokens)?;
        *guard = Some(tokens);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self.tokens.lock();
        *guard = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // An existing file keeps its old mode on open
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
