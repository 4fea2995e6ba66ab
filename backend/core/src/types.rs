use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Event lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a scheduled event row.
///
/// `Scheduled` rows are eligible for dispatch, `Locked` rows are leased to
/// exactly one running replica, and the remaining three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Locked,
    Delivered,
    Error,
    Dead,
}

impl EventStatus {
    /// The literal stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Locked => "locked",
            EventStatus::Delivered => "delivered",
            EventStatus::Error => "error",
            EventStatus::Dead => "dead",
        }
    }

    /// Whether no further transitions are allowed from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Delivered | EventStatus::Error | EventStatus::Dead
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(EventStatus::Scheduled),
            "locked" => Ok(EventStatus::Locked),
            "delivered" => Ok(EventStatus::Delivered),
            "error" => Ok(EventStatus::Error),
            "dead" => Ok(EventStatus::Dead),
            other => Err(EngineError::InvalidStatus(other.to_string())),
        }
    }
}

/// Which event table a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Cron,
    OneOff,
}

impl EventClass {
    pub fn label(&self) -> &'static str {
        match self {
            EventClass::Cron => "cron",
            EventClass::OneOff => "one_off",
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger configuration
// ---------------------------------------------------------------------------

/// A webhook target: either a literal URL or an env-var indirection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WebhookConf {
    Url(String),
    FromEnv { from_env: String },
}

/// A request header: literal value or env-var indirection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConf {
    pub name: String,
    #[serde(flatten)]
    pub value: HeaderValueSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HeaderValueSource {
    #[serde(rename = "value")]
    Value(String),
    #[serde(rename = "value_from_env")]
    FromEnv(String),
}

/// A resolved header, ready to be attached to a delivery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub name: String,
    pub value: String,
}

/// Retry and timing policy for a trigger or one-off event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConf {
    /// Attempts allowed after the first failure.
    pub num_retries: i32,
    /// Delay before a retry when the webhook gives no `Retry-After`.
    pub retry_interval_seconds: u64,
    /// Per-attempt HTTP timeout.
    pub timeout_seconds: u64,
    /// Maximum lateness before an event is declared dead without delivery.
    pub tolerance_seconds: u64,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            num_retries: 0,
            retry_interval_seconds: 10,
            timeout_seconds: 60,
            tolerance_seconds: 21_600,
        }
    }
}

/// One recurring trigger definition from the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTriggerDefinition {
    pub name: String,
    pub webhook: WebhookConf,
    /// 5-field cron expression (minute hour day-of-month month day-of-week).
    pub schedule: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub headers: Vec<HeaderConf>,
    #[serde(default)]
    pub retry_conf: RetryConf,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Snapshot of all known cron trigger definitions, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TriggerCatalog {
    pub cron_triggers: HashMap<String, CronTriggerDefinition>,
}

impl TriggerCatalog {
    pub fn new(definitions: Vec<CronTriggerDefinition>) -> Self {
        let cron_triggers = definitions
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self { cron_triggers }
    }

    pub fn get(&self, name: &str) -> Option<&CronTriggerDefinition> {
        self.cron_triggers.get(name)
    }

    pub fn trigger_names(&self) -> Vec<String> {
        self.cron_triggers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cron_triggers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Event rows
// ---------------------------------------------------------------------------

/// A not-yet-inserted cron event occurrence.
#[derive(Debug, Clone)]
pub struct CronSeed {
    pub trigger_name: String,
    pub scheduled_time: DateTime<Utc>,
}

/// The columns returned by the cron lock query. The rest of the event
/// (webhook, payload, retry policy) comes from the trigger catalog.
#[derive(Debug, Clone)]
pub struct CronEventPartial {
    pub id: String,
    pub trigger_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
}

/// A self-describing one-off event row. Created externally; carries its own
/// webhook, payload, and policy instead of referencing a trigger.
#[derive(Debug, Clone)]
pub struct OneOffEvent {
    pub id: String,
    pub scheduled_time: DateTime<Utc>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub webhook_conf: WebhookConf,
    pub payload: Option<Value>,
    pub retry_conf: RetryConf,
    pub header_conf: Vec<HeaderConf>,
    pub comment: Option<String>,
}

/// An event with everything resolved, ready for the delivery subroutine.
#[derive(Debug, Clone)]
pub struct DeliverableEvent {
    pub id: String,
    /// Trigger name; `None` for one-off events, which are anonymous.
    pub name: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub tries: i32,
    pub webhook_url: String,
    pub payload: Value,
    pub retry_conf: RetryConf,
    pub headers: Vec<EventHeader>,
    pub comment: Option<String>,
    /// Only carried (and delivered) for one-off events.
    pub created_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Generator inputs
// ---------------------------------------------------------------------------

/// Per-trigger hydration stats: how many future `scheduled` rows exist and
/// the latest scheduled time, `None` when the trigger has no rows yet.
#[derive(Debug, Clone)]
pub struct TriggerStats {
    pub trigger_name: String,
    pub upcoming_events_count: i64,
    pub max_scheduled_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Invocation record
// ---------------------------------------------------------------------------

/// One persisted HTTP delivery attempt. `status` is the observed HTTP status,
/// or a synthetic code for transport (1000) and decode (1001) failures.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub event_id: String,
    pub status: i32,
    pub request: Value,
    pub response: Value,
}
