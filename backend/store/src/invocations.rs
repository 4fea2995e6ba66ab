//! Invocation log writes, fused with the owning event's state transition.
//!
//! The log insert, the `tries` increment, and the status/retry mutation for
//! one delivery attempt land in a single transaction. An observer of the
//! `status` column never sees a terminal state without its invocation row,
//! and a crash between statements cannot double-count `tries`.

use chrono::{DateTime, Utc};

use chime_core::types::{EventClass, Invocation};

use crate::{events_table, invocations_table, EventStore, StoreResult};

/// How a delivery attempt resolves the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// HTTP success: the event is done.
    Delivered,
    /// Failure with the retry budget exhausted: terminal error.
    Exhausted,
    /// Failure with budget (or a `Retry-After` grant): back to the queue.
    RetryAt(DateTime<Utc>),
}

impl EventStore {
    /// Record one delivery attempt and apply its outcome atomically.
    pub async fn record_attempt(
        &self,
        invocation: &Invocation,
        class: EventClass,
        outcome: AttemptOutcome,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let insert_sql = format!(
            "INSERT INTO {} (event_id, status, request, response) VALUES ($1, $2, $3, $4)",
            invocations_table(class)
        );
        sqlx::query(&insert_sql)
            .bind(&invocation.event_id)
            .bind(invocation.status)
            .bind(&invocation.request)
            .bind(&invocation.response)
            .execute(&mut *tx)
            .await?;

        let bump_sql = format!(
            "UPDATE {} SET tries = tries + 1 WHERE id = $1",
            events_table(class)
        );
        sqlx::query(&bump_sql)
            .bind(&invocation.event_id)
            .execute(&mut *tx)
            .await?;

        match outcome {
            AttemptOutcome::Delivered => {
                let sql = format!(
                    "UPDATE {} SET status = 'delivered' WHERE id = $1",
                    events_table(class)
                );
                sqlx::query(&sql)
                    .bind(&invocation.event_id)
                    .execute(&mut *tx)
                    .await?;
            }
            AttemptOutcome::Exhausted => {
                let sql = format!(
                    "UPDATE {} SET status = 'error' WHERE id = $1",
                    events_table(class)
                );
                sqlx::query(&sql)
                    .bind(&invocation.event_id)
                    .execute(&mut *tx)
                    .await?;
            }
            AttemptOutcome::RetryAt(retry_at) => {
                let sql = format!(
                    "UPDATE {} SET next_retry_at = $2, status = 'scheduled' WHERE id = $1",
                    events_table(class)
                );
                sqlx::query(&sql)
                    .bind(&invocation.event_id)
                    .bind(retry_at)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
