//! Configuration for the server and the client.
//!
//! Loaded from `~/.todoshare/config.toml` when present. Every field has a
//! default, so an empty or missing file is valid. Environment variables win
//! over the file:
//!
//! | Variable              | Field               |
//! |-----------------------|---------------------|
//! | `TODOSHARE_DB_PATH`   | `database.path`     |
//! | `TODOSHARE_HOST`      | `server.host`       |
//! | `TODOSHARE_PORT`      | `server.port`       |
//! | `TODOSHARE_API_URL`   | `client.base_url`   |

use crate::auth::store::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the home directory holding config, database and tokens.
const APP_DIR: &str = ".todoshare";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            max_body_bytes: 64 * 1024,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database. `~` is expanded.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: format!("~/{APP_DIR}/todoshare.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Where the CLI keeps its session tokens. `~` is expanded.
    pub token_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".into(),
            timeout_secs: 30,
            token_path: format!("~/{APP_DIR}/tokens.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "todoshare=info".into(),
        }
    }
}

impl Config {
    /// Default config file location: `~/.todoshare/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(APP_DIR).join("config.toml"))
    }

    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `TODOSHARE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("TODOSHARE_DB_PATH") {
            self.database.path = path;
        }
        if let Some(host) = lookup("TODOSHARE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TODOSHARE_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("TODOSHARE_PORT is not a valid port: {port}"))?;
        }
        if let Some(url) = lookup("TODOSHARE_API_URL") {
            self.client.base_url = url;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database.path)
    }

    pub fn token_path(&self) -> PathBuf {
        expand_path(&self.client.token_path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.auth.access_ttl_secs, 15 * 60);
        assert_eq!(config.auth.refresh_ttl_secs, 7 * 24 * 3600);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 8080

            [auth]
            access_ttl_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.auth.access_ttl_secs, 60);
        assert_eq!(config.auth.refresh_ttl_secs, DEFAULT_REFRESH_TTL_SECS);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::from_toml("[server]\nport = \"high\"").is_err());
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("TODOSHARE_DB_PATH", "/tmp/t.db"),
                ("TODOSHARE_HOST", "0.0.0.0"),
                ("TODOSHARE_PORT", "9000"),
                ("TODOSHARE_API_URL", "https://todo.example.com"),
            ]))
            .unwrap();

        assert_eq!(config.database_path(), PathBuf::from("/tmp/t.db"));
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.client.base_url, "https://todo.example.com");
    }

    #[test]
    fn bad_port_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("TODOSHARE_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("TODOSHARE_PORT"));
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[client]\ntimeout_secs = 5\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client.timeout_secs, 5);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.client.timeout_secs, 30);
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let config = Config::default();
        assert!(!config.database_path().to_string_lossy().starts_with('~'));
        assert!(config.token_path().ends_with("tokens.json"));
    }
}
