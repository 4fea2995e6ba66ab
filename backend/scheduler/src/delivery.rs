//! Webhook invocation: the delivery subroutine and per-attempt outcome
//! handling.
//!
//! Every attempt produces exactly one invocation row, written in the same
//! transaction as the event's state transition. The only exception is the
//! dead path, which is decided before any HTTP is performed and leaves no
//! invocation row.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chime_core::types::{
    DeliverableEvent, EventClass, EventHeader, EventStatus, Invocation, RetryConf,
};
use chime_store::{AttemptOutcome, EventStore};

/// Synthetic invocation status for transport-level failures.
const STATUS_TRANSPORT_ERROR: i32 = 1000;
/// Synthetic invocation status for response-decoding failures.
const STATUS_PARSE_ERROR: i32 = 1001;

/// Capabilities threaded through the delivery path.
pub struct DeliveryCtx<'a> {
    pub store: &'a EventStore,
    pub http: &'a reqwest::Client,
    pub cancel: &'a CancellationToken,
}

/// Result of the HTTP exchange, before retry classification.
#[derive(Debug)]
enum HttpOutcome {
    /// 2xx/3xx with the response captured.
    Success {
        status: u16,
        headers: Vec<EventHeader>,
        body: String,
    },
    /// 4xx; stored with a distinguished response variant.
    ClientError {
        status: u16,
        headers: Vec<EventHeader>,
        body: String,
    },
    /// 5xx.
    ServerError {
        status: u16,
        headers: Vec<EventHeader>,
        body: String,
    },
    /// Connect/send/TLS/timeout failure; no response was received.
    Transport(String),
    /// A response arrived but its body could not be read.
    Parse(String),
}

/// How a delivery attempt ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The attempt ran to a recorded outcome (delivered, retry, error, or
    /// dead); the event is no longer this replica's responsibility.
    Completed,
    /// Shutdown cut the attempt short before any state transition; the
    /// event must stay in the registry so the shutdown hook requeues it.
    ShutDown,
}

/// Deliver one event and drive its state transition.
///
/// Returns `Ok` for every delivery outcome, including failures that were
/// recorded and classified; `Err` only when the store itself fails, in which
/// case the caller leaves the row locked for startup recovery.
pub async fn deliver_event(
    ctx: &DeliveryCtx<'_>,
    event: &DeliverableEvent,
    class: EventClass,
) -> Result<DeliveryResult> {
    let now = Utc::now();
    let lateness = (now - event.scheduled_time).num_seconds();
    if lateness > event.retry_conf.tolerance_seconds as i64 {
        warn!(
            event_id = %event.id,
            class = class.label(),
            lateness_seconds = lateness,
            tolerance_seconds = event.retry_conf.tolerance_seconds,
            "Event exceeded tolerance; marking dead without delivery"
        );
        if ctx.cancel.is_cancelled() {
            return Ok(DeliveryResult::ShutDown);
        }
        ctx.store.set_status(&event.id, EventStatus::Dead, class).await?;
        return Ok(DeliveryResult::Completed);
    }

    let request_body = build_request_body(event);

    // Racing the exchange against the token aborts an in-flight request on
    // shutdown. Either way, no state transition happens once cancelled.
    let outcome = tokio::select! {
        outcome = invoke_webhook(ctx.http, event, &request_body) => outcome,
        _ = ctx.cancel.cancelled() => return Ok(DeliveryResult::ShutDown),
    };
    if ctx.cancel.is_cancelled() {
        return Ok(DeliveryResult::ShutDown);
    }

    let request_record = json!({
        "body": request_body,
        "headers": event.headers,
    });

    match outcome {
        HttpOutcome::Success { status, headers, body } => {
            let invocation = Invocation {
                event_id: event.id.clone(),
                status: i32::from(status),
                request: request_record,
                response: response_record(status, &headers, &body),
            };
            ctx.store
                .record_attempt(&invocation, class, AttemptOutcome::Delivered)
                .await?;
            info!(
                event_id = %event.id,
                class = class.label(),
                status,
                "Webhook delivered"
            );
        }
        failure => {
            let (status, response, retry_after) = failure_details(&failure);
            let invocation = Invocation {
                event_id: event.id.clone(),
                status,
                request: request_record,
                response,
            };

            match decide_retry(event.tries, &event.retry_conf, retry_after) {
                Some(delay_seconds) => {
                    let retry_at = now + chrono::Duration::seconds(delay_seconds as i64);
                    ctx.store
                        .record_attempt(&invocation, class, AttemptOutcome::RetryAt(retry_at))
                        .await?;
                    warn!(
                        event_id = %event.id,
                        class = class.label(),
                        status,
                        retry_at = %retry_at,
                        "Webhook attempt failed; retry scheduled"
                    );
                }
                None => {
                    ctx.store
                        .record_attempt(&invocation, class, AttemptOutcome::Exhausted)
                        .await?;
                    error!(
                        event_id = %event.id,
                        class = class.label(),
                        status,
                        tries = event.tries + 1,
                        "Webhook attempt failed with retries exhausted"
                    );
                }
            }
        }
    }

    Ok(DeliveryResult::Completed)
}

/// Build the webhook request payload.
///
/// `name` is present only for cron events and `created_at` only for one-off
/// events; an absent comment is omitted rather than sent as null.
pub fn build_request_body(event: &DeliverableEvent) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("id".to_string(), json!(event.id));
    if let Some(name) = &event.name {
        body.insert("name".to_string(), json!(name));
    }
    body.insert(
        "scheduled_time".to_string(),
        json!(event.scheduled_time.to_rfc3339()),
    );
    body.insert("payload".to_string(), event.payload.clone());
    if let Some(comment) = &event.comment {
        body.insert("comment".to_string(), json!(comment));
    }
    if let Some(created_at) = event.created_at {
        body.insert("created_at".to_string(), json!(created_at.to_rfc3339()));
    }
    Value::Object(body)
}

async fn invoke_webhook(
    http: &reqwest::Client,
    event: &DeliverableEvent,
    body: &Value,
) -> HttpOutcome {
    let timeout = Duration::from_secs(event.retry_conf.timeout_seconds);

    let response = http
        .post(&event.webhook_url)
        .timeout(timeout)
        .headers(header_map(&event.headers))
        .json(body)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => return HttpOutcome::Transport(e.to_string()),
    };

    let status = response.status().as_u16();
    let headers: Vec<EventHeader> = response
        .headers()
        .iter()
        .map(|(name, value)| EventHeader {
            name: name.as_str().to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect();

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => return HttpOutcome::Parse(e.to_string()),
    };

    match status {
        s if s < 400 => HttpOutcome::Success { status, headers, body },
        s if s < 500 => HttpOutcome::ClientError { status, headers, body },
        _ => HttpOutcome::ServerError { status, headers, body },
    }
}

/// Resolved per-trigger headers as a reqwest header map. A header that is
/// not representable on the wire is dropped with a warning rather than
/// failing the whole attempt.
fn header_map(headers: &[EventHeader]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for header in headers {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                warn!(header = %header.name, "Skipping malformed request header");
            }
        }
    }
    map
}

/// Invocation status code, stored response variant, and any `Retry-After`
/// grant for a failed exchange.
fn failure_details(outcome: &HttpOutcome) -> (i32, Value, Option<u64>) {
    match outcome {
        HttpOutcome::ClientError { status, headers, body } => (
            i32::from(*status),
            json!({
                "type": "client_error",
                "status": status,
                "body": body,
                "headers": headers,
            }),
            parse_retry_after(headers),
        ),
        HttpOutcome::ServerError { status, headers, body } => (
            i32::from(*status),
            response_record(*status, headers, body),
            parse_retry_after(headers),
        ),
        HttpOutcome::Transport(message) => (
            STATUS_TRANSPORT_ERROR,
            json!({ "type": "transport_error", "message": message }),
            None,
        ),
        HttpOutcome::Parse(message) => (
            STATUS_PARSE_ERROR,
            json!({ "type": "parse_error", "message": message }),
            None,
        ),
        HttpOutcome::Success { .. } => unreachable!("success is not a failure"),
    }
}

fn response_record(status: u16, headers: &[EventHeader], body: &str) -> Value {
    json!({
        "type": "response",
        "status": status,
        "body": body,
        "headers": headers,
    })
}

/// `Retry-After` as non-negative integer seconds, if present and parseable.
fn parse_retry_after(headers: &[EventHeader]) -> Option<u64> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("retry-after"))
        .and_then(|h| h.value.trim().parse::<u64>().ok())
}

/// Delay in seconds before the next attempt, or `None` when the event is
/// out of budget.
///
/// A `Retry-After` grant always wins: the server may extend the attempt
/// budget past `num_retries`.
fn decide_retry(tries: i32, conf: &RetryConf, retry_after: Option<u64>) -> Option<u64> {
    if let Some(seconds) = retry_after {
        return Some(seconds);
    }
    if tries >= conf.num_retries {
        return None;
    }
    Some(conf.retry_interval_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_event() -> DeliverableEvent {
        DeliverableEvent {
            id: "evt-1".to_string(),
            name: Some("hourly-report".to_string()),
            scheduled_time: Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
            tries: 0,
            webhook_url: "https://example.com/hook".to_string(),
            payload: json!({"kind": "report"}),
            retry_conf: RetryConf::default(),
            headers: vec![],
            comment: None,
            created_at: None,
        }
    }

    #[test]
    fn cron_body_has_name_but_no_created_at() {
        let event = base_event();
        let body = build_request_body(&event);

        assert_eq!(body["id"], "evt-1");
        assert_eq!(body["name"], "hourly-report");
        assert_eq!(body["scheduled_time"], "2024-03-01T11:00:00+00:00");
        assert_eq!(body["payload"], json!({"kind": "report"}));
        assert!(body.get("comment").is_none());
        assert!(body.get("created_at").is_none());
    }

    #[test]
    fn oneoff_body_is_anonymous_and_carries_created_at() {
        let mut event = base_event();
        event.name = None;
        event.comment = Some("launch ping".to_string());
        event.created_at = Some(Utc.with_ymd_and_hms(2024, 2, 28, 9, 30, 0).unwrap());
        let body = build_request_body(&event);

        assert!(body.get("name").is_none());
        assert_eq!(body["comment"], "launch ping");
        assert_eq!(body["created_at"], "2024-02-28T09:30:00+00:00");
    }

    #[test]
    fn null_payload_is_sent_explicitly() {
        let mut event = base_event();
        event.payload = Value::Null;
        let body = build_request_body(&event);
        assert!(body.as_object().unwrap().contains_key("payload"));
        assert_eq!(body["payload"], Value::Null);
    }

    #[test]
    fn retry_after_overrides_exhausted_budget() {
        let conf = RetryConf {
            num_retries: 3,
            ..Default::default()
        };
        // tries >= num_retries, but the server granted more time.
        assert_eq!(decide_retry(5, &conf, Some(30)), Some(30));
    }

    #[test]
    fn exhausted_budget_without_grant_gives_up() {
        let conf = RetryConf {
            num_retries: 3,
            ..Default::default()
        };
        assert_eq!(decide_retry(3, &conf, None), None);
        assert_eq!(decide_retry(7, &conf, None), None);
    }

    #[test]
    fn within_budget_uses_the_configured_interval() {
        let conf = RetryConf {
            num_retries: 3,
            retry_interval_seconds: 60,
            ..Default::default()
        };
        assert_eq!(decide_retry(0, &conf, None), Some(60));
        assert_eq!(decide_retry(2, &conf, None), Some(60));
    }

    #[test]
    fn zero_retries_fails_on_first_failure() {
        let conf = RetryConf::default();
        assert_eq!(decide_retry(0, &conf, None), None);
    }

    #[test]
    fn retry_after_parsing() {
        let headers = |v: &str| {
            vec![EventHeader {
                name: "Retry-After".to_string(),
                value: v.to_string(),
            }]
        };
        assert_eq!(parse_retry_after(&headers("30")), Some(30));
        assert_eq!(parse_retry_after(&headers(" 0 ")), Some(0));
        assert_eq!(parse_retry_after(&headers("-5")), None);
        assert_eq!(parse_retry_after(&headers("soon")), None);
        assert_eq!(parse_retry_after(&[]), None);

        // Header lookup is case-insensitive.
        let mixed = vec![EventHeader {
            name: "retry-after".to_string(),
            value: "12".to_string(),
        }];
        assert_eq!(parse_retry_after(&mixed), Some(12));
    }

    #[test]
    fn client_error_gets_a_distinguished_response_variant() {
        let outcome = HttpOutcome::ClientError {
            status: 404,
            headers: vec![],
            body: "not found".to_string(),
        };
        let (status, response, retry_after) = failure_details(&outcome);
        assert_eq!(status, 404);
        assert_eq!(response["type"], "client_error");
        assert_eq!(retry_after, None);
    }

    #[test]
    fn transport_and_parse_failures_use_synthetic_codes() {
        let (status, response, _) =
            failure_details(&HttpOutcome::Transport("connection refused".to_string()));
        assert_eq!(status, 1000);
        assert_eq!(response["type"], "transport_error");

        let (status, response, _) =
            failure_details(&HttpOutcome::Parse("invalid body".to_string()));
        assert_eq!(status, 1001);
        assert_eq!(response["type"], "parse_error");
    }

    #[test]
    fn server_error_keeps_its_real_status_and_retry_after() {
        let outcome = HttpOutcome::ServerError {
            status: 503,
            headers: vec![EventHeader {
                name: "Retry-After".to_string(),
                value: "30".to_string(),
            }],
            body: "unavailable".to_string(),
        };
        let (status, response, retry_after) = failure_details(&outcome);
        assert_eq!(status, 503);
        assert_eq!(response["type"], "response");
        assert_eq!(retry_after, Some(30));
    }
}
