//! The processor loop: claims due events, delivers them, and drives the
//! lifecycle state machine.
//!
//! Claimed ids are registered in [`LockedEvents`] before any delivery
//! starts; an id leaves the registry only when its event reaches a terminal
//! outcome or is requeued. Whatever is still registered at shutdown gets
//! unlocked by the binary's shutdown hook. An event that fails before
//! delivery (missing trigger, unresolvable webhook, store error) stays
//! registered and its row stays `locked`: the startup reset reclaims it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chime_config::{resolve_headers, resolve_webhook};
use chime_core::types::{
    CronEventPartial, DeliverableEvent, EventClass, OneOffEvent, TriggerCatalog,
};
use chime_core::{Component, EngineError};
use chime_store::EventStore;

use crate::delivery::{deliver_event, DeliveryCtx, DeliveryResult};
use crate::registry::LockedEvents;

const PROCESSOR_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Processor {
    store: EventStore,
    http: reqwest::Client,
    catalog: Arc<RwLock<TriggerCatalog>>,
    locked: Arc<LockedEvents>,
    lock_batch_size: i64,
}

impl Processor {
    pub fn new(
        store: EventStore,
        http: reqwest::Client,
        catalog: Arc<RwLock<TriggerCatalog>>,
        locked: Arc<LockedEvents>,
        lock_batch_size: i64,
    ) -> Self {
        Self {
            store,
            http,
            catalog,
            locked,
            lock_batch_size,
        }
    }

    async fn process_cron_events(&self, cancel: &CancellationToken) {
        let catalog = self.catalog.read().await.clone();

        let events = match self.store.lock_due_cron_events(self.lock_batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to lock due cron events");
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        self.locked
            .insert_many(EventClass::Cron, events.iter().map(|e| e.id.clone()));
        info!(count = events.len(), "Claimed due cron events");

        for event in events {
            if cancel.is_cancelled() {
                // Remaining events stay registered; the shutdown hook
                // returns them to the queue.
                break;
            }

            match assemble_cron_event(&catalog, &event) {
                Ok(deliverable) => {
                    self.deliver(&deliverable, EventClass::Cron, cancel).await;
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        trigger = %event.trigger_name,
                        error = %e,
                        "Cannot assemble cron event; leaving locked for startup recovery"
                    );
                }
            }
        }
    }

    async fn process_oneoff_events(&self, cancel: &CancellationToken) {
        let events = match self.store.lock_due_oneoff_events(self.lock_batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to lock due one-off events");
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        self.locked
            .insert_many(EventClass::OneOff, events.iter().map(|e| e.id.clone()));
        info!(count = events.len(), "Claimed due one-off events");

        for event in events {
            if cancel.is_cancelled() {
                break;
            }

            match assemble_oneoff_event(&event) {
                Ok(deliverable) => {
                    self.deliver(&deliverable, EventClass::OneOff, cancel).await;
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        error = %e,
                        "Cannot assemble one-off event; leaving locked for startup recovery"
                    );
                }
            }
        }
    }

    /// Run the delivery subroutine and unregister the event on any terminal
    /// or requeue outcome. A store failure keeps the id registered and the
    /// row locked; an attempt cut short by shutdown stays registered so the
    /// shutdown hook requeues it.
    async fn deliver(&self, event: &DeliverableEvent, class: EventClass, cancel: &CancellationToken) {
        let ctx = DeliveryCtx {
            store: &self.store,
            http: &self.http,
            cancel,
        };
        match deliver_event(&ctx, event, class).await {
            Ok(DeliveryResult::Completed) => self.locked.remove(class, &event.id),
            Ok(DeliveryResult::ShutDown) => {}
            Err(e) => {
                error!(
                    event_id = %event.id,
                    class = class.label(),
                    error = %e,
                    "Delivery could not record its outcome; leaving locked"
                );
            }
        }
    }
}

#[async_trait]
impl Component for Processor {
    fn name(&self) -> &str {
        "processor"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Processor started");
        let mut ticker = time::interval(PROCESSOR_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_cron_events(&cancel).await;
                    if !cancel.is_cancelled() {
                        self.process_oneoff_events(&cancel).await;
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Processor shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Combine a partial cron row with its catalog definition into a
/// deliverable event. The payload defaults to JSON null.
fn assemble_cron_event(
    catalog: &TriggerCatalog,
    event: &CronEventPartial,
) -> Result<DeliverableEvent, EngineError> {
    let definition = catalog
        .get(&event.trigger_name)
        .ok_or_else(|| EngineError::MissingTrigger(event.trigger_name.clone()))?;

    let webhook_url = resolve_webhook(&definition.webhook)?;
    let headers = resolve_headers(&definition.headers)?;

    Ok(DeliverableEvent {
        id: event.id.clone(),
        name: Some(event.trigger_name.clone()),
        scheduled_time: event.scheduled_time,
        tries: event.tries,
        webhook_url,
        payload: definition.payload.clone().unwrap_or(Value::Null),
        retry_conf: definition.retry_conf.clone(),
        headers,
        comment: definition.comment.clone(),
        created_at: None,
    })
}

/// Resolve a self-describing one-off row into a deliverable event.
fn assemble_oneoff_event(event: &OneOffEvent) -> Result<DeliverableEvent, EngineError> {
    let webhook_url = resolve_webhook(&event.webhook_conf)?;
    let headers = resolve_headers(&event.header_conf)?;

    Ok(DeliverableEvent {
        id: event.id.clone(),
        name: None,
        scheduled_time: event.scheduled_time,
        tries: event.tries,
        webhook_url,
        payload: event.payload.clone().unwrap_or(Value::Null),
        retry_conf: event.retry_conf.clone(),
        headers,
        comment: event.comment.clone(),
        created_at: Some(event.created_at),
    })
}
