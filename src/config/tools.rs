//! Capability allow-list for the task runner.
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! [tools]
//! allow = ["Read", "Write", "WebSearch", "WebFetch", "Bash(git commit:*)"]
//! changelog = ["2026-03-01: added WebFetch"]
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ToolsFile {
    tools: AllowedTools,
}

/// Tools the external runner may use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowedTools {
    pub allow: Vec<String>,
    /// Free-form notes on why the list changed. Not passed to the runner.
    #[serde(default)]
    pub changelog: Vec<String>,
}

impl AllowedTools {
    pub fn new<I, S>(allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
            changelog: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read allowed tools {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad allowed tools {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let file: ToolsFile = toml::from_str(content)?;
        Ok(file.tools)
    }
}
