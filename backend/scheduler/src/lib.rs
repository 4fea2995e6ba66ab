//! `chime-scheduler` — the two engine loops and their supporting pieces.
//!
//! The generator materializes future cron occurrences into the store; the
//! processor claims due rows, invokes webhooks, and drives each event to a
//! terminal status. The two share nothing in memory: the database is the
//! only coordination point, here and across replicas.

pub mod cron;
pub mod delivery;
pub mod generator;
pub mod processor;
pub mod registry;

pub use cron::{parse_cron, upcoming};
pub use generator::{Generator, CRON_EVENTS_BUFFER};
pub use processor::Processor;
pub use registry::LockedEvents;
