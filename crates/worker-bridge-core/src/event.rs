//! Platform event payloads.
//!
//! These are the host-side shapes of the events the bridge forwards. HTTP
//! requests reach the guest as a raw body plus `http.*` metadata imports; all
//! other events are serialized to JSON and copied into guest memory.

use serde::{Deserialize, Serialize};

use crate::context::{EnvBindings, ExecutionContext};

/// HTTP request delivered to the guest's request handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Full request URL
    pub url: String,
    /// Request headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP response produced by the guest's request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create a simple text response.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.as_bytes().to_vec(),
        }
    }

    /// Create a JSON response.
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    /// Create an empty response with just a status code.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::empty(200)
    }
}

/// Scheduled trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    /// Cron expression that fired.
    pub cron: String,
    /// Scheduled time in milliseconds since the Unix epoch.
    pub scheduled_time: u64,
}

/// One message of a queue batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Message identifier, used by `queue.ack` / `queue.retry`.
    pub id: String,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Message body.
    pub body: serde_json::Value,
    /// Delivery attempt, starting at 1.
    pub attempts: u32,
}

/// Batch of queue messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Queue name.
    pub queue: String,
    /// Messages in delivery order.
    pub messages: Vec<QueueMessage>,
}

/// Per-message acknowledgements reported by a queue handler.
///
/// Messages that are neither acked nor retried follow the batch result: a
/// successful handler acks them, a failed handler retries them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    /// `queue.ack_all` was called.
    pub ack_all: bool,
    /// `queue.retry_all` was called.
    pub retry_all: bool,
    /// Individually acked message ids.
    pub acked: Vec<String>,
    /// Individually retried message ids.
    pub retried: Vec<String>,
}

impl QueueOutcome {
    /// Record an explicit ack, superseding an earlier retry of the same message.
    pub fn ack(&mut self, id: String) {
        self.retried.retain(|r| *r != id);
        if !self.acked.contains(&id) {
            self.acked.push(id);
        }
    }

    /// Record an explicit retry, superseding an earlier ack of the same message.
    pub fn retry(&mut self, id: String) {
        self.acked.retain(|a| *a != id);
        if !self.retried.contains(&id) {
            self.retried.push(id);
        }
    }
}

/// Incoming email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailEvent {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipient.
    pub to: String,
    /// Raw RFC 5322 message.
    pub raw: String,
    /// Size of the raw message in bytes.
    pub raw_size: usize,
}

impl EmailEvent {
    /// Build an event, deriving `raw_size` from `raw`.
    pub fn new(from: &str, to: &str, raw: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            raw: raw.to_string(),
            raw_size: raw.len(),
        }
    }
}

/// Outgoing email built by the guest through `email.message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipient.
    pub to: String,
    /// Raw RFC 5322 message.
    pub raw: String,
}

/// Single-object context received by page-function platforms.
#[derive(Debug, Clone)]
pub struct PageContext {
    /// Incoming request.
    pub request: HttpRequest,
    /// Environment bindings.
    pub env: EnvBindings,
    /// Execution context of the page invocation.
    pub ctx: ExecutionContext,
}
