//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TERMGATE_SECRET`, `TERMGATE_LISTEN`,
//!    `TERMGATE_SHELL`, `TERMGATE_UPLOAD_DIR`
//! 2. **Config file** — path via `--config <path>`, or `termgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7681"
//! max_sessions = 32
//! max_message_size = 10485760  # 10 MiB
//! rate_limit = 600             # messages per minute per session
//! heartbeat_interval_secs = 30
//!
//! [auth]
//! secret = "shared-secret"     # omit to generate one at startup
//! token_ttl_secs = 86400
//!
//! [shell]
//! shell = "/bin/bash"          # omit to use the login shell of the current user
//! working_dir = "/home/me"     # omit to use the server's CWD
//! default_cols = 80
//! default_rows = 24
//!
//! [shell.env]
//! LANG = "en_US.UTF-8"
//!
//! [files]
//! upload_dir = "/srv/uploads"  # omit to use the server's CWD
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "termgate.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and per-session resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7681`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent terminal sessions (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Largest inbound frame accepted, in bytes (default 10 MiB). Also caps
    /// the size of files served by `file_download`.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Inbound messages accepted per one-minute window (default 600).
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Seconds between liveness probes (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Token signing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret. When absent a random one is generated at startup and
    /// logged, since tokens cannot be minted without it.
    pub secret: Option<String>,
    /// Lifetime of minted tokens in seconds (default 24 h).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Shell defaults for spawned sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary. When absent, the user database entry for the current
    /// user is consulted, then a list of conventional paths.
    pub shell: Option<String>,
    /// Working directory for shells. Defaults to the server's CWD.
    pub working_dir: Option<String>,
    /// Terminal columns used when `auth` carries no size (default 80).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Terminal rows used when `auth` carries no size (default 24).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Sandbox for `file_upload` / `file_download`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesConfig {
    /// Directory uploads land in. Defaults to the server's CWD.
    pub upload_dir: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:7681".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_max_message_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_rate_limit() -> u32 {
    600
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_token_ttl() -> u64 {
    24 * 60 * 60
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            max_message_size: default_max_message_size(),
            rate_limit: default_rate_limit(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: None,
            working_dir: None,
            default_cols: default_cols(),
            default_rows: default_rows(),
            env: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `termgate.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: origin.clone(),
            source,
        })?;
        Self::from_toml(&content, &origin)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("TERMGATE_SECRET") {
            self.auth.secret = Some(secret);
        }
        if let Some(listen) = lookup("TERMGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(shell) = lookup("TERMGATE_SHELL") {
            self.shell.shell = Some(shell);
        }
        if let Some(dir) = lookup("TERMGATE_UPLOAD_DIR") {
            self.files.upload_dir = Some(dir);
        }
    }

    /// Directory uploads are confined to, falling back to the process CWD.
    pub fn upload_dir(&self) -> std::io::Result<PathBuf> {
        match self.files.upload_dir {
            Some(ref dir) => Ok(PathBuf::from(crate::util::expand_tilde(dir).as_ref())),
            None => std::env::current_dir(),
        }
    }

    /// Working directory for spawned shells, falling back to the process CWD.
    pub fn working_dir(&self) -> std::io::Result<PathBuf> {
        match self.shell.working_dir {
            Some(ref dir) => Ok(PathBuf::from(crate::util::expand_tilde(dir).as_ref())),
            None => std::env::current_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::from_toml("", "inline").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7681");
        assert_eq!(config.server.rate_limit, 600);
        assert_eq!(config.server.heartbeat_interval_secs, 30);
        assert_eq!(config.auth.token_ttl_secs, 86400);
        assert!(config.auth.secret.is_none());
        assert_eq!(config.shell.default_cols, 80);
        assert_eq!(config.shell.default_rows, 24);
    }

    #[test]
    fn test_partial_file() {
        let toml = r#"
            [server]
            rate_limit = 5

            [auth]
            secret = "abc"

            [shell.env]
            LANG = "C.UTF-8"
        "#;
        let config = Config::from_toml(toml, "inline").unwrap();
        assert_eq!(config.server.rate_limit, 5);
        assert_eq!(config.server.max_sessions, 32);
        assert_eq!(config.auth.secret.as_deref(), Some("abc"));
        assert_eq!(config.shell.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = Config::from_toml("[server\n", "broken.toml").unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("[auth]\nsecret = \"file\"\n", "inline").unwrap();
        config.apply_env(|key| match key {
            "TERMGATE_SECRET" => Some("env".to_string()),
            "TERMGATE_UPLOAD_DIR" => Some("/tmp/up".to_string()),
            _ => None,
        });
        assert_eq!(config.auth.secret.as_deref(), Some("env"));
        assert_eq!(config.upload_dir().unwrap(), PathBuf::from("/tmp/up"));
        assert_eq!(config.server.listen, "127.0.0.1:7681");
    }
}
