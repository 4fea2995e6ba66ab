//! One-off scheduled event queries.
//!
//! One-off rows are self-describing: webhook, payload, retry policy, and
//! headers travel in the row as jsonb instead of referencing the catalog.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use chime_core::types::{HeaderConf, OneOffEvent, RetryConf, WebhookConf};

use crate::{EventStore, StoreError, StoreResult};

/// Fields for creating a one-off event. `retry_conf` falls back to defaults
/// field-by-field, matching the catalog's behavior for cron triggers.
#[derive(Debug, Clone)]
pub struct OneOffEventInsert {
    pub scheduled_time: DateTime<Utc>,
    pub webhook_conf: WebhookConf,
    pub payload: Option<Value>,
    pub retry_conf: RetryConf,
    pub header_conf: Vec<HeaderConf>,
    pub comment: Option<String>,
}

impl EventStore {
    /// Create a one-off event; returns its generated id.
    pub async fn insert_oneoff_event(&self, insert: &OneOffEventInsert) -> StoreResult<String> {
        let webhook = serde_json::to_value(&insert.webhook_conf)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let retry = serde_json::to_value(&insert.retry_conf)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let headers = serde_json::to_value(&insert.header_conf)
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO hdb_scheduled_events
                (webhook_conf, scheduled_time, retry_conf, payload, header_conf, comment)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(webhook)
        .bind(insert.scheduled_time)
        .bind(retry)
        .bind(&insert.payload)
        .bind(headers)
        .bind(&insert.comment)
        .fetch_one(self.pool())
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Atomically claim due one-off events. Same locking protocol as the
    /// cron query, but returns the full self-describing payload.
    pub async fn lock_due_oneoff_events(&self, limit: i64) -> StoreResult<Vec<OneOffEvent>> {
        let rows = sqlx::query(
            r#"
            UPDATE hdb_scheduled_events
               SET status = 'locked'
             WHERE id IN (
                   SELECT id
                     FROM hdb_scheduled_events
                    WHERE status = 'scheduled'
                      AND (next_retry_at <= now()
                           OR (next_retry_at IS NULL AND scheduled_time <= now()))
                    ORDER BY scheduled_time
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                   )
            RETURNING id, scheduled_time, tries, created_at,
                      webhook_conf, payload, retry_conf, header_conf, comment
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(decode_oneoff_row).collect()
    }
}

fn decode_oneoff_row(row: &PgRow) -> StoreResult<OneOffEvent> {
    let id: String = row.try_get("id")?;

    let webhook_conf: Value = row.try_get("webhook_conf")?;
    let webhook_conf: WebhookConf = serde_json::from_value(webhook_conf)
        .map_err(|e| StoreError::Decode(format!("event {id}: webhook_conf: {e}")))?;

    let retry_conf: Value = row.try_get("retry_conf")?;
    let retry_conf: RetryConf = serde_json::from_value(retry_conf)
        .map_err(|e| StoreError::Decode(format!("event {id}: retry_conf: {e}")))?;

    let header_conf: Value = row.try_get("header_conf")?;
    let header_conf: Vec<HeaderConf> = serde_json::from_value(header_conf)
        .map_err(|e| StoreError::Decode(format!("event {id}: header_conf: {e}")))?;

    Ok(OneOffEvent {
        scheduled_time: row.try_get("scheduled_time")?,
        tries: row.try_get("tries")?,
        created_at: row.try_get("created_at")?,
        payload: row.try_get("payload")?,
        comment: row.try_get("comment")?,
        webhook_conf,
        retry_conf,
        header_conf,
        id,
    })
}
