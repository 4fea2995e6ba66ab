//! Cron event hydration and locking queries.

use chrono::{DateTime, Utc};
use sqlx::Row;

use chime_core::types::{CronEventPartial, CronSeed, TriggerStats};

use crate::{EventStore, StoreResult};

impl EventStore {
    /// Hydration stats for the given triggers: one row per trigger whose
    /// count of future `scheduled` events is below `threshold`.
    ///
    /// Triggers with no rows at all come back with a zero count and a NULL
    /// `max_scheduled_time`, so a freshly added trigger is immediately
    /// deprived and receives a full horizon.
    pub async fn fetch_deprived_stats(
        &self,
        trigger_names: &[String],
        threshold: i64,
    ) -> StoreResult<Vec<TriggerStats>> {
        if trigger_names.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT n.name,
                   coalesce(s.upcoming_events_count, 0) AS upcoming_events_count,
                   s.max_scheduled_time
              FROM unnest($1::text[]) AS n(name)
              LEFT JOIN hdb_cron_events_stats s ON s.name = n.name
             WHERE coalesce(s.upcoming_events_count, 0) < $2
            "#,
        )
        .bind(trigger_names)
        .bind(threshold)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TriggerStats {
                    trigger_name: row.try_get("name")?,
                    upcoming_events_count: row.try_get("upcoming_events_count")?,
                    max_scheduled_time: row.try_get("max_scheduled_time")?,
                })
            })
            .collect()
    }

    /// Bulk-insert future cron occurrences. Re-hydration is idempotent:
    /// a `(trigger_name, scheduled_time)` conflict is silently skipped.
    /// Returns the number of rows actually inserted.
    pub async fn insert_cron_seeds(&self, seeds: &[CronSeed]) -> StoreResult<u64> {
        if seeds.is_empty() {
            return Ok(0);
        }

        let (names, times): (Vec<String>, Vec<DateTime<Utc>>) = seeds
            .iter()
            .map(|s| (s.trigger_name.clone(), s.scheduled_time))
            .unzip();

        let result = sqlx::query(
            r#"
            INSERT INTO hdb_cron_events (trigger_name, scheduled_time)
            SELECT * FROM unnest($1::text[], $2::timestamptz[])
            ON CONFLICT (trigger_name, scheduled_time) DO NOTHING
            "#,
        )
        .bind(names)
        .bind(times)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Atomically claim due cron events for this replica.
    ///
    /// `next_retry_at`, when set, supersedes `scheduled_time` for the due
    /// decision. `FOR UPDATE SKIP LOCKED` makes concurrent calls from other
    /// replicas return disjoint row sets; the `locked` status they leave
    /// behind is the lease.
    pub async fn lock_due_cron_events(&self, limit: i64) -> StoreResult<Vec<CronEventPartial>> {
        let rows = sqlx::query(
            r#"
            UPDATE hdb_cron_events
               SET status = 'locked'
             WHERE id IN (
                   SELECT id
                     FROM hdb_cron_events
                    WHERE status = 'scheduled'
                      AND (next_retry_at <= now()
                           OR (next_retry_at IS NULL AND scheduled_time <= now()))
                    ORDER BY scheduled_time
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                   )
            RETURNING id, trigger_name, scheduled_time, tries, created_at
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CronEventPartial {
                    id: row.try_get("id")?,
                    trigger_name: row.try_get("trigger_name")?,
                    scheduled_time: row.try_get("scheduled_time")?,
                    tries: row.try_get("tries")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
