//! Queue item operations: ordered pick, idempotent insert, guarded partial
//! update, origin sync.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::QueueStore;
use crate::telemetry::metrics;

const SELECT_ITEM: &str = "
    SELECT
        q.id, q.origin_id, o.description, o.context, q.status, q.priority,
        q.model, q.max_attempts, q.attempts, q.output_file, q.started_at,
        q.completed_at, q.error, q.created_at
    FROM queue_items q
    JOIN origins o ON o.id = q.origin_id";

const QUEUE_ORDER: &str = "ORDER BY q.priority ASC, q.created_at ASC, q.id ASC";

impl super::Db {
    async fn fetch_items(&self, filter: &str, status: Option<Status>) -> Result<Vec<QueueItem>> {
        let sql = format!("{SELECT_ITEM} {filter} {QUEUE_ORDER}");
        let mut query = sqlx::query_as::<_, QueueItemRow>(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(QueueItemRow::try_into_item)
            .collect()
    }
}

#[async_trait]
impl QueueStore for super::Db {
    async fn next_queued(&self) -> Result<Option<QueueItem>> {
        let sql = format!("{SELECT_ITEM} WHERE q.status = 'queued' {QUEUE_ORDER} LIMIT 1");
        let row: Option<QueueItemRow> = sqlx::query_as(&sql).fetch_optional(self.pool()).await?;
        row.map(QueueItemRow::try_into_item).transpose()
    }

    async fn running(&self) -> Result<Vec<QueueItem>> {
        self.fetch_items("WHERE q.status = ?", Some(Status::Running))
            .await
    }

    async fn insert(&self, new: NewQueueItem) -> Result<InsertResult> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let context = OriginContext {
            topic: Some(new.topic.clone()),
            tags: new.tags.clone(),
        };

        // The description is the origin key: an existing origin is reused.
        sqlx::query(
            "INSERT INTO origins (category, description, status, context, created_at)
             VALUES (?, ?, 'pending', ?, ?)
             ON CONFLICT (category, description) DO NOTHING",
        )
        .bind(RESEARCH_CATEGORY)
        .bind(&new.description)
        .bind(context.to_json())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (origin_id,): (i64,) =
            sqlx::query_as("SELECT id FROM origins WHERE category = ? AND description = ?")
                .bind(RESEARCH_CATEGORY)
                .bind(&new.description)
                .fetch_one(&mut *tx)
                .await?;

        let created = sqlx::query(
            "INSERT INTO queue_items (origin_id, status, priority, model, max_attempts, attempts, created_at)
             VALUES (?, 'queued', ?, ?, ?, 0, ?)
             ON CONFLICT (origin_id) DO NOTHING",
        )
        .bind(origin_id)
        .bind(new.priority)
        .bind(new.model.as_str())
        .bind(i64::from(new.max_attempts))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let sql = format!("{SELECT_ITEM} WHERE q.origin_id = ?");
        let item = sqlx::query_as::<_, QueueItemRow>(&sql)
            .bind(origin_id)
            .fetch_one(&mut *tx)
            .await?
            .try_into_item()?;

        tx.commit().await?;

        metrics::items_enqueued().add(
            1,
            &[KeyValue::new(
                "result",
                if created { "created" } else { "existing" },
            )],
        );

        Ok(if created {
            InsertResult::Created(Box::new(item))
        } else {
            InsertResult::Existing(Box::new(item))
        })
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT status, attempts FROM queue_items WHERE id = ?")
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        let (status, attempts) =
            current.ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;
        let from: Status = status.parse()?;

        if let Some(to) = update.status
            && to != from
            && !from.can_transition_to(to)
        {
            return Err(Error::InvalidTransition { from, to });
        }
        if let Some(n) = update.attempts
            && i64::from(n) < attempts
        {
            return Err(Error::Other(format!(
                "attempts for {id} cannot decrease ({attempts} -> {n})"
            )));
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_items SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(to) = update.status {
                set.push("status = ").push_bind_unseparated(to.as_str());
            }
            if let Some(n) = update.attempts {
                set.push("attempts = ").push_bind_unseparated(i64::from(n));
            }
            if let Some(at) = update.started_at {
                set.push("started_at = ").push_bind_unseparated(at);
            }
            if let Some(at) = update.completed_at {
                set.push("completed_at = ").push_bind_unseparated(at);
            }
            if let Some(path) = update.output_file {
                set.push("output_file = ").push_bind_unseparated(path);
            }
            if let Some(error) = update.error {
                set.push("error = ").push_bind_unseparated(error);
            }
        }
        // Guard on the status we validated against.
        qb.push(" WHERE id = ")
            .push_bind(id.0)
            .push(" AND status = ")
            .push_bind(from.as_str());

        let rows_affected = qb.build().execute(self.pool()).await?.rows_affected();
        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from,
                to: update.status.unwrap_or(from),
            });
        }

        if let Some(to) = update.status
            && to != from
        {
            metrics::item_transitions().add(
                1,
                &[
                    KeyValue::new("from", from.as_str()),
                    KeyValue::new("to", to.as_str()),
                ],
            );
        }

        Ok(())
    }

    async fn sync(&self) -> Result<u64> {
        let promoted = sqlx::query(
            "INSERT OR IGNORE INTO queue_items (origin_id, status, priority, model, max_attempts, attempts, created_at)
             SELECT o.id, 'queued', ?, ?, ?, 0, ?
             FROM origins o
             WHERE o.category = ?
               AND o.status = 'processed'
               AND NOT EXISTS (SELECT 1 FROM queue_items q WHERE q.origin_id = o.id)
             ORDER BY o.created_at ASC, o.id ASC",
        )
        .bind(NewQueueItem::DEFAULT_PRIORITY)
        .bind(ModelSelector::default().as_str())
        .bind(i64::from(NewQueueItem::DEFAULT_MAX_ATTEMPTS))
        .bind(Utc::now())
        .bind(RESEARCH_CATEGORY)
        .execute(self.pool())
        .await?
        .rows_affected();

        if promoted > 0 {
            metrics::sync_promoted().add(promoted, &[]);
            metrics::items_enqueued().add(promoted, &[KeyValue::new("result", "synced")]);
        }
        Ok(promoted)
    }

    async fn mark_origin_processed(&self, origin: OriginId) -> Result<()> {
        self.set_origin_status(origin, OriginStatus::Processed).await
    }

    async fn get(&self, id: ItemId) -> Result<QueueItem> {
        let sql = format!("{SELECT_ITEM} WHERE q.id = ?");
        let row: Option<QueueItemRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("queue item {id}")))?
            .try_into_item()
    }

    async fn list(&self, status: Option<Status>) -> Result<Vec<QueueItem>> {
        match status {
            Some(status) => self.fetch_items("WHERE q.status = ?", Some(status)).await,
            None => self.fetch_items("", None).await,
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: i64,
    origin_id: i64,
    description: String,
    context: Option<String>,
    status: String,
    priority: i64,
    model: String,
    max_attempts: i64,
    attempts: i64,
    output_file: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl QueueItemRow {
    fn try_into_item(self) -> Result<QueueItem> {
        let id = ItemId(self.id);
        let context = OriginContext::parse(self.context.as_deref());
        let bad = |field: &str, n: i64| Error::Other(format!("bad {field} for {id}: {n}"));

        Ok(QueueItem {
            id,
            origin_id: OriginId(self.origin_id),
            topic: context.topic.unwrap_or_else(|| self.description.clone()),
            description: self.description,
            tags: context.tags,
            priority: i32::try_from(self.priority).map_err(|_| bad("priority", self.priority))?,
            status: self.status.parse()?,
            attempts: u32::try_from(self.attempts).map_err(|_| bad("attempts", self.attempts))?,
            max_attempts: u32::try_from(self.max_attempts)
                .map_err(|_| bad("max_attempts", self.max_attempts))?,
            model: self.model.parse()?,
            added: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            output_file: self.output_file,
            error: self.error,
        })
    }
}
