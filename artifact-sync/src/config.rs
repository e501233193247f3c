//! Configuration management for artifact-sync.
//!
//! Loads configuration from an optional TOML file with `ARTIFACT_SYNC__*`
//! environment variable overrides (e.g. `ARTIFACT_SYNC__SERVER__BASE_URL`).

use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix; sections and keys are separated by `__`.
pub const ENV_PREFIX: &str = "ARTIFACT_SYNC";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub revision: RevisionConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL serving `/manifests/{revision}.json` and `/artifacts/{digest}`
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory the manifest's relative paths are written under
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Maximum concurrent in-flight entries
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempts per file before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff base; attempt N waits N * base before the next one
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Per-request transport timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionConfig {
    /// Repository queried for the revision
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Ref whose tip is synchronized
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Render the in-place status line
    #[serde(default = "default_progress_enabled")]
    pub enabled: bool,

    /// Line width used when stderr is not a terminal
    #[serde(default = "default_fallback_width")]
    pub fallback_width: usize,
}

// Default values
fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_destination() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_max_concurrent() -> usize {
    32
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_git_ref() -> String {
    "origin/main".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_enabled() -> bool {
    true
}

fn default_fallback_width() -> usize {
    80
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            git_ref: default_git_ref(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_progress_enabled(),
            fallback_width: default_fallback_width(),
        }
    }
}

impl FetchConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.normalized()
    }

    /// Clamp limits and canonicalize the base URL.
    pub fn normalized(mut self) -> Result<Self> {
        let trimmed = self.server.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(SyncError::Config("server.base_url must not be empty".to_string()));
        }
        self.server.base_url = trimmed.to_string();
        self.sync.max_concurrent = self.sync.max_concurrent.max(1);
        self.fetch.max_attempts = self.fetch.max_attempts.max(1);
        Ok(self)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
