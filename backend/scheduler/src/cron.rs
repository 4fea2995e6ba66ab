/// Cron expression parsing and occurrence expansion.
///
/// Trigger schedules use the standard 5-field form
/// (minute hour day-of-month month day-of-week).
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

/// Parse a 5-field cron expression.
///
/// The underlying parser expects a seconds field; it is pinned to `0` so
/// every occurrence lands on a minute boundary.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.trim().split_whitespace().collect();
    if fields.len() != 5 {
        bail!(
            "cron expression must have exactly 5 fields, got {}: '{}'",
            fields.len(),
            expr
        );
    }
    let normalized = format!("0 {}", fields.join(" "));
    Schedule::from_str(&normalized).with_context(|| format!("invalid cron expression '{expr}'"))
}

/// The next `n` occurrences strictly after `start`, in ascending order.
pub fn upcoming(schedule: &Schedule, start: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
    schedule.after(&start).take(n).collect()
}
