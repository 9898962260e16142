//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The runner API key is wrapped in secrecy::SecretString so it
//! never shows up in logs.

pub mod tools;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

/// Default lease TTL. A single run drains the whole queue, so the lease has
/// to outlive several back-to-back tasks.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct Config {
    pub database_url: String,
    /// Working tree the task runner operates in; artifact paths are
    /// relative to it.
    pub workspace_root: PathBuf,
    pub lock_path: PathBuf,
    pub logs_dir: PathBuf,
    pub lease_ttl: Duration,
    pub task_timeout: Duration,
    pub runner_command: String,
    pub allowed_tools_path: PathBuf,
    /// Files the task must not modify; restored after every task.
    pub protected_files: Vec<String>,
    pub runner_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workspace_root = PathBuf::from(optional_var("WORKSPACE_ROOT").unwrap_or_else(|| ".".into()));
        let under_root = |name: &str, default: &str| {
            let path = PathBuf::from(optional_var(name).unwrap_or_else(|| default.to_string()));
            if path.is_relative() {
                workspace_root.join(path)
            } else {
                path
            }
        };

        Ok(Self {
            database_url: required_var("DATABASE_URL")?,
            lock_path: under_root("RESEARCHQ_LOCK_PATH", "automation/logs/worker.lock"),
            logs_dir: under_root("RESEARCHQ_LOGS_DIR", "automation/logs"),
            allowed_tools_path: under_root("ALLOWED_TOOLS_PATH", "automation/allowed-tools.toml"),
            lease_ttl: duration_var("LEASE_TTL_SECS", DEFAULT_LEASE_TTL)?,
            task_timeout: duration_var("TASK_TIMEOUT_SECS", DEFAULT_TASK_TIMEOUT)?,
            runner_command: optional_var("RUNNER_COMMAND").unwrap_or_else(|| "claude".into()),
            protected_files: optional_var("PROTECTED_FILES")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| vec!["CLAUDE.md".to_string()]),
            runner_api_key: optional_var("ANTHROPIC_API_KEY").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            workspace_root,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {raw:?}"))),
    }
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
