//! Queue items and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Queue row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q-{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("q-").unwrap_or(s);
        digits
            .parse()
            .map(ItemId)
            .map_err(|_| Error::Other(format!("invalid item id: {s}")))
    }
}

/// Origin record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginId(pub i64);

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be picked.
    Queued,
    /// Picked by a worker; the external task is (or was) running.
    Running,
    /// Artifact passed validation. Terminal.
    Completed,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Queued)     // retry
                | (Running, Failed) // exhausted
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Model selector
// ---------------------------------------------------------------------------

/// Which model the external runner should use for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSelector {
    #[default]
    Sonnet,
    Opus,
    Haiku,
}

impl ModelSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSelector::Sonnet => "sonnet",
            ModelSelector::Opus => "opus",
            ModelSelector::Haiku => "haiku",
        }
    }
}

impl std::fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ModelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sonnet" => Ok(ModelSelector::Sonnet),
            "opus" => Ok(ModelSelector::Opus),
            "haiku" => Ok(ModelSelector::Haiku),
            _ => Err(Error::Other(format!("unknown model: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// One unit of schedulable work with its own retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,

    /// The origin record this item was created from.
    pub origin_id: OriginId,

    pub topic: String,
    pub description: String,
    pub tags: Vec<String>,

    /// Lower = more urgent.
    pub priority: i32,

    pub status: Status,

    /// Picks so far. Incremented once per pick, before the task starts.
    pub attempts: u32,

    /// Fixed at creation.
    pub max_attempts: u32,

    pub model: ModelSelector,

    pub added: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_file: Option<String>,
    pub error: Option<String>,
}

impl QueueItem {
    /// True once the retry budget is spent. Shared by validation failures
    /// and crash recovery.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing a research topic directly.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub(crate) topic: String,
    pub(crate) description: String,
    pub(crate) tags: Vec<String>,
    pub(crate) priority: i32,
    pub(crate) model: ModelSelector,
    pub(crate) max_attempts: u32,
}

impl NewQueueItem {
    pub const DEFAULT_PRIORITY: i32 = 5;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

    /// The description defaults to the topic.
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            description: topic.clone(),
            topic,
            tags: Vec::new(),
            priority: Self::DEFAULT_PRIORITY,
            model: ModelSelector::default(),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn model(mut self, model: ModelSelector) -> Self {
        self.model = model;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }
}

/// What happened when an item was inserted.
#[derive(Debug)]
pub enum InsertResult {
    /// A new queued item was created.
    Created(Box<QueueItem>),
    /// The origin already had a queue item; nothing was written.
    Existing(Box<QueueItem>),
}

impl InsertResult {
    pub fn item(&self) -> &QueueItem {
        match self {
            InsertResult::Created(item) | InsertResult::Existing(item) => item,
        }
    }
}

// ---------------------------------------------------------------------------
// Partial update
// ---------------------------------------------------------------------------

/// Partial update of a queue row. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub status: Option<Status>,
    pub attempts: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_file: Option<String>,
    pub error: Option<String>,
}

impl ItemUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
