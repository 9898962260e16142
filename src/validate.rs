//! Artifact validation.
//!
//! Checks the file a research task was expected to write. Every defect is
//! data: the validator never fails, it accumulates errors (which block
//! completion) and warnings (which are only logged).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::model::QueueItem;
use crate::prompt::SESSION_LOG;

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A---\r?\n((?s:.*?))\r?\n---").expect("valid header regex"));
static HEADER_TOPIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"topic:[ \t]*(.+)").expect("valid topic regex"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s)>\]]+").expect("valid link regex"));

/// Keys the header block must contain.
pub const HEADER_KEYS: [&str; 4] = ["date", "topic", "status", "tags"];

/// Outcome of validating one artifact.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub output_file: PathBuf,
}

impl ValidationResult {
    /// Valid means no errors. Warnings never count.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors joined into one line, as stored on a failed item.
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Thresholds and required structure.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Below this many characters the artifact is rejected.
    pub min_chars: usize,
    /// Below this many characters the artifact gets a warning.
    pub typical_chars: usize,
    pub required_sections: Vec<String>,
    /// Fewer distinct links than this gets a warning.
    pub min_links: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_chars: 5_000,
            typical_chars: 8_000,
            required_sections: [
                "## Context",
                "## Findings",
                "## Open Questions",
                "## Extracted Principles",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            min_links: 3,
        }
    }
}

/// Validates artifacts under a workspace root.
#[derive(Debug, Clone)]
pub struct Validator {
    root: PathBuf,
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, ValidatorConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: ValidatorConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Validate the artifact expected at `expected` (relative paths are
    /// resolved against the workspace root).
    pub async fn validate(&self, item: &QueueItem, expected: &Path) -> ValidationResult {
        let mut result = ValidationResult {
            output_file: expected.to_path_buf(),
            ..Default::default()
        };
        let full = self.root.join(expected);

        // Stray bytes that are not UTF-8 become replacement characters; the
        // rest of the artifact is still checked.
        let content = match tokio::fs::read(&full).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                result
                    .errors
                    .push(format!("Output file not found: {}", expected.display()));
                return result;
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("Output file unreadable: {} ({e})", expected.display()));
                return result;
            }
        };

        self.check_length(&content, &mut result);
        check_header(item, &content, &mut result);
        self.check_sections(&content, &mut result);
        self.check_links(&content, &mut result);
        self.check_session_log(item, &mut result).await;

        result
    }

    fn check_length(&self, content: &str, result: &mut ValidationResult) {
        let len = content.chars().count();
        if len < self.config.min_chars {
            result.errors.push(format!(
                "Content too short: {len} chars (minimum {}). Research may be incomplete.",
                self.config.min_chars
            ));
        } else if len < self.config.typical_chars {
            result.warnings.push(format!(
                "Content is short: {len} chars. Typical research files are {}+.",
                self.config.typical_chars
            ));
        }
    }

    fn check_sections(&self, content: &str, result: &mut ValidationResult) {
        for section in &self.config.required_sections {
            if !content.contains(section.as_str()) {
                result
                    .errors
                    .push(format!("Missing required section: {section}"));
            }
        }
    }

    fn check_links(&self, content: &str, result: &mut ValidationResult) {
        let links: HashSet<&str> = LINK.find_iter(content).map(|m| m.as_str()).collect();
        if links.len() < self.config.min_links {
            result.warnings.push(format!(
                "Only {} source URLs found (target: {}+). Research may lack citations.",
                links.len(),
                self.config.min_links
            ));
        }
    }

    async fn check_session_log(&self, item: &QueueItem, result: &mut ValidationResult) {
        let Ok(log) = tokio::fs::read(self.root.join(SESSION_LOG)).await else {
            return;
        };
        let log = String::from_utf8_lossy(&log);
        if !log.contains("[automated]") || !log.contains(item.topic.as_str()) {
            result.warnings.push(format!(
                "{SESSION_LOG} may not have been updated with this research entry"
            ));
        }
    }
}

fn check_header(item: &QueueItem, content: &str, result: &mut ValidationResult) {
    let Some(header) = HEADER.captures(content).and_then(|c| c.get(1)) else {
        result
            .errors
            .push("Missing header block (---...---)".to_string());
        return;
    };
    let header = header.as_str();

    for key in HEADER_KEYS {
        if !header.contains(&format!("{key}:")) {
            result
                .errors
                .push(format!("Header missing '{key}' field"));
        }
    }

    if let Some(topic) = HEADER_TOPIC.captures(header).and_then(|c| c.get(1)) {
        let file_topic = topic.as_str().trim();
        if !topics_overlap(file_topic, &item.topic) {
            result.errors.push(format!(
                "Topic mismatch: file says \"{file_topic}\", queue says \"{}\"",
                item.topic
            ));
        }
    }
}

/// At least one word of the queue topic longer than 3 characters appears in
/// the header topic, ignoring case.
fn topics_overlap(file_topic: &str, queue_topic: &str) -> bool {
    let file_topic = file_topic.to_lowercase();
    queue_topic
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .any(|w| file_topic.contains(w))
}
