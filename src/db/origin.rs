//! Origin record operations.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Record a captured research topic. Returns the existing record's id if
    /// the description was already captured.
    pub async fn record_origin(&self, new: NewOrigin) -> Result<OriginId> {
        let created_at = new.created_at.unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO origins (category, description, status, context, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (category, description) DO NOTHING",
        )
        .bind(RESEARCH_CATEGORY)
        .bind(&new.description)
        .bind(new.status.as_str())
        .bind(new.context.to_json())
        .bind(created_at)
        .execute(self.pool())
        .await?;

        let (id,): (i64,) =
            sqlx::query_as("SELECT id FROM origins WHERE category = ? AND description = ?")
                .bind(RESEARCH_CATEGORY)
                .bind(&new.description)
                .fetch_one(self.pool())
                .await?;
        Ok(OriginId(id))
    }

    /// Get an origin record by ID.
    pub async fn get_origin(&self, id: OriginId) -> Result<OriginRecord> {
        let row: Option<OriginRow> = sqlx::query_as(
            "SELECT id, category, description, status, context, created_at, processed_at
             FROM origins WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("origin {id}")))?
            .try_into_origin()
    }

    pub(crate) async fn set_origin_status(&self, id: OriginId, status: OriginStatus) -> Result<()> {
        let processed_at = (status == OriginStatus::Processed).then(Utc::now);
        let rows_affected = sqlx::query(
            "UPDATE origins SET status = ?, processed_at = COALESCE(?, processed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(processed_at)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("origin {id}")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OriginRow {
    id: i64,
    category: String,
    description: String,
    status: String,
    context: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl OriginRow {
    fn try_into_origin(self) -> Result<OriginRecord> {
        Ok(OriginRecord {
            id: OriginId(self.id),
            category: self.category,
            description: self.description,
            status: self.status.parse()?,
            context: OriginContext::parse(self.context.as_deref()),
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}
