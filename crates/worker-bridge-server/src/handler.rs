//! Route handlers that deliver platform events to the guest.
//!
//! Every handler builds the event for one entry point of the [`Bridge`],
//! dispatches it with a fresh [`ExecutionContext`] and maps the outcome to
//! an HTTP response.
//!
//! [`Bridge`]: worker_bridge_core::Bridge

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use worker_bridge_core::{
    EmailEvent, ExecutionContext, MessageBatch, PageContext, QueueMessage, QueueOutcome,
    ScheduledEvent,
};

use crate::request;
use crate::response::{error, error_to_response, into_axum_response};
use crate::state::AppState;

/// Deliver an HTTP request to the guest.
///
/// In pages mode the request goes through the page-function entry point.
#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn handle_fetch(State(state): State<AppState>, req: Request) -> Response<Body> {
    let options = state.options();
    let request = match request::from_axum(req, options.max_body_bytes).await {
        Ok(request) => request,
        Err(e) => {
            warn!(limit = e.limit, "Request body too large");
            return into_axum_response(error(413, "Request body too large"));
        }
    };

    let env = state.env().clone();
    let exec = ExecutionContext::new();
    let result = if options.pages {
        state
            .bridge()
            .on_request(PageContext {
                request,
                env,
                ctx: exec,
            })
            .await
    } else {
        state.bridge().fetch(request, env, exec).await
    };

    match result {
        Ok(response) => into_axum_response(response),
        Err(e) => into_axum_response(error_to_response(&e)),
    }
}

/// Query of `POST /__scheduled`.
#[derive(Debug, Deserialize)]
pub struct ScheduledParams {
    /// Cron expression that fired.
    #[serde(default)]
    pub cron: String,
    /// Scheduled time in milliseconds since the Unix epoch; defaults to now.
    pub time: Option<u64>,
}

/// Deliver a scheduled trigger.
#[instrument(skip(state))]
pub async fn handle_scheduled(
    State(state): State<AppState>,
    Query(params): Query<ScheduledParams>,
) -> Response<Body> {
    let event = ScheduledEvent {
        cron: params.cron,
        scheduled_time: params.time.unwrap_or_else(now_millis),
    };

    match state
        .bridge()
        .scheduled(event, state.env().clone(), ExecutionContext::new())
        .await
    {
        Ok(()) => axum::Json(serde_json::json!({ "outcome": "ok" })).into_response(),
        Err(e) => into_axum_response(error_to_response(&e)),
    }
}

/// Deliver a queue batch.
///
/// The body is a JSON array of message bodies; each gets a fresh id. The
/// response reports the guest's acknowledgements.
#[instrument(skip(state, body), fields(queue = %queue))]
pub async fn handle_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: Bytes,
) -> Response<Body> {
    let bodies: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
        Ok(bodies) => bodies,
        Err(e) => {
            return into_axum_response(error(
                400,
                &format!("Expected a JSON array of message bodies: {e}"),
            ));
        }
    };

    let timestamp = now_millis();
    let batch = MessageBatch {
        queue,
        messages: bodies
            .into_iter()
            .map(|body| QueueMessage {
                id: Uuid::new_v4().to_string(),
                timestamp,
                body,
                attempts: 1,
            })
            .collect(),
    };
    let ids: Vec<String> = batch.messages.iter().map(|m| m.id.clone()).collect();

    match state
        .bridge()
        .queue(batch, state.env().clone(), ExecutionContext::new())
        .await
    {
        Ok(outcome) => {
            info!(
                messages = ids.len(),
                acked = outcome.acked.len(),
                retried = outcome.retried.len(),
                "Queue batch handled"
            );
            axum::Json(outcome_to_json(&ids, &outcome)).into_response()
        }
        Err(e) => into_axum_response(error_to_response(&e)),
    }
}

/// Report every message of the batch with its final decision.
fn outcome_to_json(ids: &[String], outcome: &QueueOutcome) -> serde_json::Value {
    serde_json::json!({
        "messages": ids,
        "ackAll": outcome.ack_all,
        "retryAll": outcome.retry_all,
        "acked": outcome.acked,
        "retried": outcome.retried,
    })
}

/// Query of `POST /__email`.
#[derive(Debug, Deserialize)]
pub struct EmailParams {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipient.
    pub to: String,
}

/// Deliver an incoming email; the body is the raw message.
#[instrument(skip(state, body), fields(from = %params.from, to = %params.to))]
pub async fn handle_email(
    State(state): State<AppState>,
    Query(params): Query<EmailParams>,
    body: Bytes,
) -> Response<Body> {
    let raw = String::from_utf8_lossy(&body);
    let event = EmailEvent::new(&params.from, &params.to, &raw);

    match state
        .bridge()
        .email(event, state.env().clone(), ExecutionContext::new())
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            axum::Json(serde_json::json!({ "outcome": "accepted" })),
        )
            .into_response(),
        Err(e) => into_axum_response(error_to_response(&e)),
    }
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Loads the module if it is not loaded yet; 503 while it cannot be.
pub async fn readiness_check(State(state): State<AppState>) -> Response<Body> {
    match state.bridge().preload().await {
        Ok(()) => axum::Json(serde_json::json!({
            "status": "ready",
            "strategy": state.bridge().strategy().as_str(),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Module not loadable");
            into_axum_response(error(503, &e.to_string()))
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_to_json() {
        let mut outcome = QueueOutcome::default();
        outcome.ack("m1".into());
        outcome.retry("m2".into());

        let json = outcome_to_json(&["m1".into(), "m2".into()], &outcome);

        assert_eq!(json["acked"], serde_json::json!(["m1"]));
        assert_eq!(json["retried"], serde_json::json!(["m2"]));
        assert_eq!(json["ackAll"], false);
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_now_millis() {
        assert!(now_millis() > 1_600_000_000_000);
    }
}
