//! Postgres-backed [`Store`] via direct SQLx.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE`, so racing
//! consumers skip each other's candidate rows instead of blocking on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Document, Lease, MessageId};
use crate::store::{CountFilter, Store};

const COLUMNS: &str = "id, payload, priority, earliest_get, created, reset_timestamp, retries";

/// One named queue inside the shared `queue_messages` table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    queue: String,
}

impl PgStore {
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "UPDATE queue_messages SET reset_timestamp = $3
             WHERE id = (
                 SELECT id FROM queue_messages
                 WHERE queue = $1
                   AND earliest_get <= $2
                   AND (reset_timestamp IS NULL OR reset_timestamp <= $2)
                 ORDER BY priority DESC, created ASC, seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(&self.queue)
        .bind(now)
        .bind(reset_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MessageRow::into_document))
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, payload, priority, earliest_get, created, reset_timestamp, retries)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(doc.id.0)
        .bind(&self.queue)
        .bind(&doc.payload)
        .bind(doc.priority)
        .bind(doc.earliest_get)
        .bind(doc.created)
        .bind(doc.reset_timestamp)
        .bind(retries_column(doc.retries)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(&self, doc: Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, payload, priority, earliest_get, created, reset_timestamp, retries)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                 queue = EXCLUDED.queue,
                 payload = EXCLUDED.payload,
                 priority = EXCLUDED.priority,
                 earliest_get = EXCLUDED.earliest_get,
                 created = EXCLUDED.created,
                 reset_timestamp = EXCLUDED.reset_timestamp,
                 retries = EXCLUDED.retries,
                 seq = nextval('queue_messages_seq')",
        )
        .bind(doc.id.0)
        .bind(&self.queue)
        .bind(&doc.payload)
        .bind(doc.priority)
        .bind(doc.earliest_get)
        .bind(doc.created)
        .bind(doc.reset_timestamp)
        .bind(retries_column(doc.retries)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue(
        &self,
        doc: Document,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE queue_messages SET
                 payload = $3,
                 priority = $4,
                 earliest_get = $5,
                 created = $6,
                 reset_timestamp = $7,
                 retries = $8,
                 seq = nextval('queue_messages_seq')
             WHERE queue = $1 AND id = $2 AND reset_timestamp IS NOT DISTINCT FROM $9",
        )
        .bind(&self.queue)
        .bind(doc.id.0)
        .bind(&doc.payload)
        .bind(doc.priority)
        .bind(doc.earliest_get)
        .bind(doc.created)
        .bind(doc.reset_timestamp)
        .bind(retries_column(doc.retries)?)
        .bind(expected_reset)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND id = $2")
            .bind(&self.queue)
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn renew(
        &self,
        lease: Lease,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE queue_messages SET reset_timestamp = $4
             WHERE queue = $1 AND id = $2 AND reset_timestamp = $3 AND reset_timestamp > $5",
        )
        .bind(&self.queue)
        .bind(lease.id.0)
        .bind(lease.reset_timestamp)
        .bind(reset_until)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn count(&self, filter: CountFilter, now: DateTime<Utc>) -> Result<u64> {
        let row: (i64,) = match filter {
            CountFilter::All => {
                sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
                    .bind(&self.queue)
                    .fetch_one(&self.pool)
                    .await?
            }
            CountFilter::Running(true) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM queue_messages
                     WHERE queue = $1 AND reset_timestamp > $2",
                )
                .bind(&self.queue)
                .bind(now)
                .fetch_one(&self.pool)
                .await?
            }
            CountFilter::Running(false) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM queue_messages
                     WHERE queue = $1 AND (reset_timestamp IS NULL OR reset_timestamp <= $2)",
                )
                .bind(&self.queue)
                .bind(now)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(row.0.max(0) as u64)
    }
}

/// The `retries` column is a signed 32-bit integer.
fn retries_column(retries: u32) -> Result<i32> {
    i32::try_from(retries).map_err(|_| Error::InvalidRetries(retries))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    payload: serde_json::Value,
    priority: f64,
    earliest_get: DateTime<Utc>,
    created: DateTime<Utc>,
    reset_timestamp: Option<DateTime<Utc>>,
    retries: i32,
}

impl MessageRow {
    fn into_document(self) -> Document {
        Document {
            id: MessageId(self.id),
            payload: self.payload,
            priority: self.priority,
            earliest_get: self.earliest_get,
            created: self.created,
            reset_timestamp: self.reset_timestamp,
            retries: self.retries.max(0) as u32,
        }
    }
}
