//! Origin records: the captured topics queue items are created from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of origin records that feed the research queue.
pub const RESEARCH_CATEGORY: &str = "research-topic";

/// Processing status of an origin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginStatus {
    Pending,
    Processed,
}

impl OriginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OriginStatus::Pending => "pending",
            OriginStatus::Processed => "processed",
        }
    }
}

impl std::str::FromStr for OriginStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "pending" => Ok(OriginStatus::Pending),
            "processed" => Ok(OriginStatus::Processed),
            _ => Err(crate::error::Error::Other(format!("unknown origin status: {s}"))),
        }
    }
}

/// A captured record that may feed the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginRecord {
    pub id: super::OriginId,
    pub category: String,
    pub description: String,
    pub status: OriginStatus,
    pub context: OriginContext,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Structured context stored alongside an origin record.
///
/// Stored as JSON text. Parsed once when a row is read; a missing or
/// malformed payload yields the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginContext {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default, deserialize_with = "string_entries")]
    pub tags: Vec<String>,
}

impl OriginContext {
    pub fn parse(raw: Option<&str>) -> Self {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "topic": self.topic, "tags": self.tags }).to_string()
    }
}

/// Keep only string entries of a tag array; anything else becomes empty.
fn string_entries<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Array(entries) => entries
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Parameters for recording a new origin.
#[derive(Debug, Clone)]
pub struct NewOrigin {
    pub description: String,
    pub context: OriginContext,
    pub status: OriginStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOrigin {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: OriginContext::default(),
            status: OriginStatus::Pending,
            created_at: None,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.context.topic = Some(topic.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn processed(mut self) -> Self {
        self.status = OriginStatus::Processed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_context_falls_back_to_defaults() {
        assert_eq!(OriginContext::parse(Some("{not json")), OriginContext::default());
        assert_eq!(OriginContext::parse(None), OriginContext::default());
    }

    #[test]
    fn non_string_tags_are_dropped() {
        let ctx = OriginContext::parse(Some(r#"{"topic":"CRDTs","tags":["sync",3,null,"offline"]}"#));
        assert_eq!(ctx.topic.as_deref(), Some("CRDTs"));
        assert_eq!(ctx.tags, vec!["sync", "offline"]);
    }

    #[test]
    fn tags_that_are_not_an_array_become_empty() {
        let ctx = OriginContext::parse(Some(r#"{"tags":"sync"}"#));
        assert!(ctx.tags.is_empty());
        assert!(ctx.topic.is_none());
    }
}
