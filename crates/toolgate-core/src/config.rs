//! Configuration loading: `~/.toolgate/config.toml` with `${VAR}` expansion

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{ToolSpec, Transport};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Tool servers registered at boot
    #[serde(default)]
    pub servers: Vec<ServerManifest>,
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3100".to_string()
}

/// SQLite location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    config_dir().join("toolgate.db")
}

/// Call routing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Deadline for a single downstream attempt
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Total attempts per downstream call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `n * backoff_base_ms`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Deadline for spawning/opening a downstream connection and its handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl GatewaySettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_connect_timeout_secs() -> u64 {
    60
}

/// Order in which policy rules are evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEvaluation {
    /// Only allow rules are consulted; no matching allow means deny
    #[default]
    AllowOnly,
    /// A matching deny rule refuses access even when an allow rule matches
    DenyOverrides,
}

/// Authentication and authorization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    /// Seeded as the administrator key when no admin key exists yet
    #[serde(default = "default_admin_key")]
    pub bootstrap_admin_key: String,
    #[serde(default)]
    pub evaluation: PolicyEvaluation,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            admin_role: default_admin_role(),
            bootstrap_admin_key: default_admin_key(),
            evaluation: PolicyEvaluation::default(),
        }
    }
}

fn default_admin_role() -> String {
    "admin".to_string()
}

/// Well-known default admin key, replace it in production
pub const DEFAULT_ADMIN_KEY: &str = "tg_admin_change_me";

fn default_admin_key() -> String {
    DEFAULT_ADMIN_KEY.to_string()
}

/// Log filter used when `RUST_LOG` is unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A tool server registration, as found in config files, manifests and admin requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerManifest {
    pub name: String,
    pub transport: Transport,
    /// When absent, tools are discovered from the server itself
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
}

/// `~/.toolgate`
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
}

/// Expand `${VAR}` references from the environment. Unset variables expand to "".
pub fn expand_env(raw: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return raw.to_string(),
    };
    re.replace_all(raw, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            warn!("Config references unset environment variable {}", &caps[1]);
            String::new()
        })
    })
    .into_owned()
}

impl AppConfig {
    /// Parse a config document after environment expansion
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(&expand_env(raw)).context("Failed to parse config")
    }

    /// Load from an explicit path, or from the default location, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = config_dir().join("config.toml");
                if !default.exists() {
                    debug!("No config at {:?}, using defaults", default);
                    return Ok(Self::default());
                }
                default
            }
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&raw)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
