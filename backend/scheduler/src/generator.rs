//! The generator loop: materializes future cron occurrences into the store.
//!
//! Each pass tops deprived triggers back up to a full horizon. The generator
//! only writes future-dated rows and the processor only claims past-due
//! rows, so the two loops never contend on the same working set.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chime_core::types::{CronSeed, TriggerCatalog};
use chime_core::Component;
use chime_store::EventStore;

use crate::cron::{parse_cron, upcoming};

/// Target number of future `scheduled` rows per trigger; a trigger below
/// this count is deprived and gets re-hydrated with this many occurrences.
pub const CRON_EVENTS_BUFFER: i64 = 100;

const GENERATOR_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Generator {
    store: EventStore,
    catalog: Arc<RwLock<TriggerCatalog>>,
}

impl Generator {
    pub fn new(store: EventStore, catalog: Arc<RwLock<TriggerCatalog>>) -> Self {
        Self { store, catalog }
    }

    /// One hydration pass; returns the number of rows inserted.
    async fn hydrate_once(&self) -> Result<u64> {
        let catalog = self.catalog.read().await.clone();
        if catalog.is_empty() {
            return Ok(0);
        }

        let names = catalog.trigger_names();
        let stats = self
            .store
            .fetch_deprived_stats(&names, CRON_EVENTS_BUFFER)
            .await?;

        let mut seeds: Vec<CronSeed> = Vec::new();
        for stat in stats {
            let Some(definition) = catalog.get(&stat.trigger_name) else {
                error!(
                    trigger = %stat.trigger_name,
                    "Deprived trigger has no catalog definition; skipping"
                );
                continue;
            };

            let schedule = match parse_cron(&definition.schedule) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(
                        trigger = %stat.trigger_name,
                        error = %e,
                        "Trigger has an unparseable schedule; skipping"
                    );
                    continue;
                }
            };

            // A trigger with no rows starts its horizon from the wall clock;
            // otherwise we extend past what already exists.
            let start = stat.max_scheduled_time.unwrap_or_else(Utc::now);
            seeds.extend(
                upcoming(&schedule, start, CRON_EVENTS_BUFFER as usize)
                    .into_iter()
                    .map(|scheduled_time| CronSeed {
                        trigger_name: stat.trigger_name.clone(),
                        scheduled_time,
                    }),
            );
        }

        if seeds.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.insert_cron_seeds(&seeds).await?;
        Ok(inserted)
    }
}

#[async_trait]
impl Component for Generator {
    fn name(&self) -> &str {
        "generator"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Generator started");
        let mut ticker = time::interval(GENERATOR_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.hydrate_once().await {
                        Ok(0) => debug!("All triggers hydrated"),
                        Ok(inserted) => info!(inserted, "Materialized cron events"),
                        Err(e) => error!(error = %e, "Hydration pass failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Generator shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
