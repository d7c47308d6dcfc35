//! HTTP response conversion.
//!
//! This module turns guest responses and dispatch failures into Axum
//! responses.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};

use worker_bridge_common::{BridgeError, HandlerError};
use worker_bridge_core::HttpResponse;

/// Convert a guest response to an Axum response.
///
/// Headers that are not valid HTTP are dropped; an out-of-range status
/// becomes 500.
pub fn into_axum_response(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder.body(Body::from(response.body)).unwrap_or_else(|_| {
        let mut fallback = Response::new(Body::from("Internal server error"));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

/// Create an error response with a JSON body.
pub fn error(status: u16, message: &str) -> HttpResponse {
    let body = serde_json::json!({
        "error": message
    })
    .to_string();
    HttpResponse::json(status, &body)
}

/// Status code for a failed dispatch.
///
/// Each stage gets its own status so callers can tell a missing handler
/// apart from a failing one.
pub fn status_for(error: &BridgeError) -> u16 {
    match error {
        BridgeError::Load(_) => 503,
        BridgeError::Start(_) => 502,
        BridgeError::Dispatch(_) => 501,
        BridgeError::Handler(HandlerError::Timeout { .. }) => 504,
        BridgeError::Handler(_) => 500,
    }
}

/// Convert a dispatch failure to a JSON error response.
pub fn error_to_response(err: &BridgeError) -> HttpResponse {
    let body = serde_json::json!({
        "error": err.to_string(),
        "stage": err.stage(),
        "retryable": err.is_retryable(),
    })
    .to_string();
    HttpResponse::json(status_for(err), &body)
}
