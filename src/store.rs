//! Queue store capability.
//!
//! The scheduler only ever talks to storage through this trait. `Db` is the
//! SQLite implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{InsertResult, ItemId, ItemUpdate, NewQueueItem, OriginId, QueueItem, Status};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// The queued item with the lowest priority number, oldest first on ties.
    async fn next_queued(&self) -> Result<Option<QueueItem>>;

    /// Every item currently marked running.
    async fn running(&self) -> Result<Vec<QueueItem>>;

    /// Create a queued item. Idempotent per origin: inserting an item whose
    /// origin already has one returns the existing item untouched.
    async fn insert(&self, new: NewQueueItem) -> Result<InsertResult>;

    /// Atomic partial update of one row.
    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<()>;

    /// Promote newly eligible origin records into queued items.
    /// Returns how many were promoted.
    async fn sync(&self) -> Result<u64>;

    /// Tell the origin record its research is done.
    async fn mark_origin_processed(&self, origin: OriginId) -> Result<()>;

    async fn get(&self, id: ItemId) -> Result<QueueItem>;

    async fn list(&self, status: Option<Status>) -> Result<Vec<QueueItem>>;
}
