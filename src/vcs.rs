//! Version-control side effects around a task.
//!
//! The runner commits locally; the worker publishes after validation and
//! puts protected files back after every task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish local commits. A failure leaves the local commit in place.
    async fn publish(&self) -> Result<()>;

    /// Best-effort restore of files the task must not modify. Never fails.
    async fn restore_protected(&self);
}

/// Publishes with `git push` and restores with `git checkout --`.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    repo_root: PathBuf,
    protected_files: Vec<String>,
    push_timeout: Duration,
}

impl GitPublisher {
    pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(repo_root: impl Into<PathBuf>, protected_files: Vec<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            protected_files,
            push_timeout: Self::DEFAULT_PUSH_TIMEOUT,
        }
    }

    pub fn push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    async fn git(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::Other(format!("git {} timed out after {timeout:?}", args.join(" "))))??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Other(format!(
                "git {} exited with status {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self) -> Result<()> {
        self.git(&["push"], self.push_timeout).await
    }

    async fn restore_protected(&self) {
        for file in &self.protected_files {
            match self.git(&["checkout", "--", file.as_str()], self.push_timeout).await {
                Ok(()) => debug!(file = %file, "protected file restored"),
                // Nothing to restore is the common case.
                Err(e) => debug!(file = %file, "protected file not restored: {e}"),
            }
        }
    }
}
