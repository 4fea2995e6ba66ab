//! `chime-store` — the Postgres event store gateway.
//!
//! All coordination between engine replicas goes through this crate: the
//! `locked` status acts as a lease, and `FOR UPDATE SKIP LOCKED` inside the
//! lock queries guarantees two replicas never claim the same row.

pub mod cron_events;
pub mod invocations;
pub mod oneoff_events;

pub use invocations::AttemptOutcome;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::info;

use chime_core::types::{EventClass, EventStatus};

/// Errors surfaced by the store. Loops treat these as internal errors:
/// log and continue polling.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed row: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Schema bootstrap, applied at connect time.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hdb_cron_events (
    id             text PRIMARY KEY DEFAULT gen_random_uuid()::text,
    trigger_name   text NOT NULL,
    scheduled_time timestamptz NOT NULL,
    next_retry_at  timestamptz,
    tries          int NOT NULL DEFAULT 0,
    status         text NOT NULL DEFAULT 'scheduled',
    created_at     timestamptz NOT NULL DEFAULT now(),
    UNIQUE (trigger_name, scheduled_time)
);

CREATE INDEX IF NOT EXISTS hdb_cron_events_due
    ON hdb_cron_events (status, scheduled_time);

CREATE TABLE IF NOT EXISTS hdb_scheduled_events (
    id             text PRIMARY KEY DEFAULT gen_random_uuid()::text,
    webhook_conf   jsonb NOT NULL,
    scheduled_time timestamptz NOT NULL,
    retry_conf     jsonb NOT NULL DEFAULT '{}'::jsonb,
    payload        jsonb,
    header_conf    jsonb NOT NULL DEFAULT '[]'::jsonb,
    status         text NOT NULL DEFAULT 'scheduled',
    next_retry_at  timestamptz,
    tries          int NOT NULL DEFAULT 0,
    comment        text,
    created_at     timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS hdb_scheduled_events_due
    ON hdb_scheduled_events (status, scheduled_time);

CREATE TABLE IF NOT EXISTS hdb_cron_event_invocation_logs (
    id         text PRIMARY KEY DEFAULT gen_random_uuid()::text,
    event_id   text NOT NULL REFERENCES hdb_cron_events (id) ON DELETE CASCADE,
    status     int,
    request    jsonb,
    response   jsonb,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS hdb_scheduled_event_invocation_logs (
    id         text PRIMARY KEY DEFAULT gen_random_uuid()::text,
    event_id   text NOT NULL REFERENCES hdb_scheduled_events (id) ON DELETE CASCADE,
    status     int,
    request    jsonb,
    response   jsonb,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE OR REPLACE VIEW hdb_cron_events_stats AS
SELECT trigger_name AS name,
       count(*) FILTER (WHERE status = 'scheduled' AND scheduled_time > now())
           AS upcoming_events_count,
       max(scheduled_time) AS max_scheduled_time
  FROM hdb_cron_events
 GROUP BY trigger_name;
"#;

/// Gateway over the Postgres pool. Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    /// Connect to Postgres and ensure the event schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        pool.execute(SCHEMA_SQL).await?;
        info!("Event store connected, schema ensured");

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Set an event's status unconditionally.
    pub async fn set_status(
        &self,
        event_id: &str,
        status: EventStatus,
        class: EventClass,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET status = $2 WHERE id = $1",
            events_table(class)
        );
        sqlx::query(&sql)
            .bind(event_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Schedule a retry: set `next_retry_at` and return the row to the queue.
    pub async fn set_retry(
        &self,
        event_id: &str,
        retry_at: chrono::DateTime<chrono::Utc>,
        class: EventClass,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET next_retry_at = $2, status = 'scheduled' WHERE id = $1",
            events_table(class)
        );
        sqlx::query(&sql)
            .bind(event_id)
            .bind(retry_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return the given `locked` events to `scheduled`. Rows that are not
    /// currently locked are left alone. Returns the number transitioned.
    pub async fn unlock_events(&self, ids: &[String], class: EventClass) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET status = 'scheduled' WHERE id = ANY($1) AND status = 'locked'",
            events_table(class)
        );
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Blanket `locked -> scheduled` reset across both event tables.
    ///
    /// There is no TTL on the lease, so stale locks from a crashed replica
    /// would pin events forever; every process start runs this before the
    /// loops. Returns `(cron, one_off)` counts.
    pub async fn unlock_all_locked_events(&self) -> StoreResult<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let cron = sqlx::query(
            "UPDATE hdb_cron_events SET status = 'scheduled' WHERE status = 'locked'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let oneoff = sqlx::query(
            "UPDATE hdb_scheduled_events SET status = 'scheduled' WHERE status = 'locked'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((cron, oneoff))
    }
}

pub(crate) fn events_table(class: EventClass) -> &'static str {
    match class {
        EventClass::Cron => "hdb_cron_events",
        EventClass::OneOff => "hdb_scheduled_events",
    }
}

pub(crate) fn invocations_table(class: EventClass) -> &'static str {
    match class {
        EventClass::Cron => "hdb_cron_event_invocation_logs",
        EventClass::OneOff => "hdb_scheduled_event_invocation_logs",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_core::types::{CronSeed, EventClass, Invocation, RetryConf, WebhookConf};
    use chrono::{DateTime, Duration, Utc};
    use sqlx::Row;

    use crate::oneoff_events::OneOffEventInsert;

    // These exercise the real locking and transaction semantics and need a
    // database. The lock queries claim whatever is due, so run serially:
    //   DATABASE_URL=postgres://... cargo test -- --ignored --test-threads=1

    async fn test_store() -> EventStore {
        let url = std::env::var("DATABASE_URL").expect("set DATABASE_URL for store tests");
        EventStore::connect(&url, 5).await.unwrap()
    }

    fn unique_name(prefix: &str) -> String {
        format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap())
    }

    async fn cron_row(store: &EventStore, id: &str) -> (String, Option<DateTime<Utc>>, i32) {
        let row = sqlx::query(
            "SELECT status, next_retry_at, tries FROM hdb_cron_events WHERE id = $1",
        )
        .bind(id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        (
            row.try_get("status").unwrap(),
            row.try_get("next_retry_at").unwrap(),
            row.try_get("tries").unwrap(),
        )
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn seed_insert_is_idempotent() {
        let store = test_store().await;
        let name = unique_name("idem");
        let seeds: Vec<CronSeed> = (1..=3)
            .map(|i| CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() + Duration::hours(i),
            })
            .collect();

        assert_eq!(store.insert_cron_seeds(&seeds).await.unwrap(), 3);
        // Re-hydrating the same horizon inserts nothing.
        assert_eq!(store.insert_cron_seeds(&seeds).await.unwrap(), 0);

        let stats = store.fetch_deprived_stats(&[name.clone()], 100).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].upcoming_events_count, 3);
        assert!(stats[0].max_scheduled_time.is_some());
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn fresh_trigger_appears_deprived_with_zero_count() {
        let store = test_store().await;
        let name = unique_name("fresh");
        let stats = store.fetch_deprived_stats(&[name.clone()], 100).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].upcoming_events_count, 0);
        assert!(stats[0].max_scheduled_time.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn concurrent_lock_calls_claim_disjoint_sets() {
        let store = test_store().await;
        let name = unique_name("race");
        store
            .insert_cron_seeds(&[CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() - Duration::seconds(5),
            }])
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.lock_due_cron_events(100),
            store.lock_due_cron_events(100)
        );
        let a: Vec<_> = a.unwrap().into_iter().filter(|e| e.trigger_name == name).collect();
        let b: Vec<_> = b.unwrap().into_iter().filter(|e| e.trigger_name == name).collect();

        // Exactly one session wins the row; the union is that single claim.
        assert_eq!(a.len() + b.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn record_attempt_bumps_tries_and_applies_outcome() {
        let store = test_store().await;
        let name = unique_name("attempt");
        store
            .insert_cron_seeds(&[CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() - Duration::seconds(5),
            }])
            .await
            .unwrap();

        let claimed = store.lock_due_cron_events(100).await.unwrap();
        let event = claimed.iter().find(|e| e.trigger_name == name).unwrap();

        let invocation = Invocation {
            event_id: event.id.clone(),
            status: 200,
            request: serde_json::json!({"payload": null}),
            response: serde_json::json!({"body": "ok"}),
        };
        store
            .record_attempt(&invocation, EventClass::Cron, AttemptOutcome::Delivered)
            .await
            .unwrap();

        let (status, _, tries) = cron_row(&store, &event.id).await;
        assert_eq!(status, "delivered");
        assert_eq!(tries, 1);

        let logs: i64 = sqlx::query(
            "SELECT count(*) AS n FROM hdb_cron_event_invocation_logs WHERE event_id = $1",
        )
        .bind(&event.id)
        .fetch_one(store.pool())
        .await
        .unwrap()
        .try_get("n")
        .unwrap();
        assert_eq!(logs, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn retry_outcome_requeues_with_next_retry_at() {
        let store = test_store().await;
        let name = unique_name("retry");
        store
            .insert_cron_seeds(&[CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() - Duration::seconds(5),
            }])
            .await
            .unwrap();

        let claimed = store.lock_due_cron_events(100).await.unwrap();
        let event = claimed.iter().find(|e| e.trigger_name == name).unwrap();

        let retry_at = Utc::now() + Duration::seconds(30);
        let invocation = Invocation {
            event_id: event.id.clone(),
            status: 503,
            request: serde_json::json!({}),
            response: serde_json::json!({"body": "unavailable"}),
        };
        store
            .record_attempt(&invocation, EventClass::Cron, AttemptOutcome::RetryAt(retry_at))
            .await
            .unwrap();

        let (status, next_retry_at, tries) = cron_row(&store, &event.id).await;
        assert_eq!(status, "scheduled");
        assert_eq!(tries, 1);
        let stored = next_retry_at.unwrap();
        assert!((stored - retry_at).num_milliseconds().abs() < 5);

        // Not due yet: the retry time supersedes the (past) scheduled time.
        let again = store.lock_due_cron_events(100).await.unwrap();
        assert!(!again.iter().any(|e| e.id == event.id));
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn set_retry_requeues_without_touching_tries() {
        let store = test_store().await;
        let name = unique_name("setretry");
        store
            .insert_cron_seeds(&[CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() - Duration::seconds(5),
            }])
            .await
            .unwrap();

        let claimed = store.lock_due_cron_events(100).await.unwrap();
        let event = claimed.iter().find(|e| e.trigger_name == name).unwrap();

        let retry_at = Utc::now() + Duration::seconds(45);
        store
            .set_retry(&event.id, retry_at, EventClass::Cron)
            .await
            .unwrap();

        let (status, next_retry_at, tries) = cron_row(&store, &event.id).await;
        assert_eq!(status, "scheduled");
        assert_eq!(tries, 0);
        assert!((next_retry_at.unwrap() - retry_at).num_milliseconds().abs() < 5);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn unlock_only_touches_locked_rows() {
        let store = test_store().await;
        let name = unique_name("unlock");
        store
            .insert_cron_seeds(&[CronSeed {
                trigger_name: name.clone(),
                scheduled_time: Utc::now() - Duration::seconds(5),
            }])
            .await
            .unwrap();

        let claimed = store.lock_due_cron_events(100).await.unwrap();
        let event = claimed.iter().find(|e| e.trigger_name == name).unwrap();
        let ids = vec![event.id.clone()];

        assert_eq!(store.unlock_events(&ids, EventClass::Cron).await.unwrap(), 1);
        let (status, _, _) = cron_row(&store, &event.id).await;
        assert_eq!(status, "scheduled");

        // Second unlock is a no-op: the row is no longer locked.
        assert_eq!(store.unlock_events(&ids, EventClass::Cron).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn oneoff_roundtrip_and_startup_reset() {
        let store = test_store().await;
        let comment = unique_name("oneoff");
        let id = store
            .insert_oneoff_event(&OneOffEventInsert {
                scheduled_time: Utc::now() - Duration::seconds(5),
                webhook_conf: WebhookConf::Url("https://example.com/hook".into()),
                payload: Some(serde_json::json!({"k": "v"})),
                retry_conf: RetryConf::default(),
                header_conf: vec![],
                comment: Some(comment.clone()),
            })
            .await
            .unwrap();

        let claimed = store.lock_due_oneoff_events(100).await.unwrap();
        let event = claimed.iter().find(|e| e.id == id).unwrap();
        assert_eq!(event.comment.as_deref(), Some(comment.as_str()));
        assert!(matches!(&event.webhook_conf, WebhookConf::Url(u) if u == "https://example.com/hook"));
        assert_eq!(event.retry_conf.timeout_seconds, 60);

        // Crash recovery: a blanket reset returns the lease.
        let (_, oneoff_reset) = store.unlock_all_locked_events().await.unwrap();
        assert!(oneoff_reset >= 1);
    }
}
