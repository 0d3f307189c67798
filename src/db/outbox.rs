//! Outbox table: staging inside task transactions, draining by the relay.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::event::Envelope;
use crate::model::EventId;
use crate::outbox::{OutboxRecord, OutboxStore, require_event_ids};

/// Write envelopes into the outbox as part of an open transaction. An
/// envelope without an event id fails the whole batch.
pub(crate) async fn stage(tx: &mut Transaction<'_, Postgres>, events: &[Envelope]) -> Result<()> {
    require_event_ids(events)?;
    for envelope in events {
        let Some(event_id) = envelope.event_id else {
            continue;
        };
        let body = String::from_utf8_lossy(&envelope.payload);
        sqlx::query(
            "INSERT INTO outbox (event_id, event_type, schema_version, occurred_at, body)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event_id.0)
        .bind(envelope.event_type.as_str())
        .bind(envelope.schema_version as i32)
        .bind(envelope.occurred_at)
        .bind(body.as_ref())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl OutboxStore for super::Db {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT id, event_id, event_type, schema_version, occurred_at, body, attempts, last_error, created_at
             FROM outbox WHERE published_at IS NULL
             ORDER BY id LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxRow::try_into_record).collect()
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET published_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    event_id: Uuid,
    event_type: String,
    schema_version: i32,
    occurred_at: chrono::DateTime<chrono::Utc>,
    body: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl OutboxRow {
    fn try_into_record(self) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: self.id,
            envelope: Envelope {
                event_id: Some(EventId(self.event_id)),
                event_type: self.event_type.parse()?,
                schema_version: self.schema_version as u32,
                occurred_at: self.occurred_at,
                payload: self.body.into_bytes(),
            },
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}
