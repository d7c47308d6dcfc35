//! HTTP request conversion.
//!
//! Incoming Axum requests become [`HttpRequest`]s with an absolute URL, the
//! shape a fetch handler expects.

use axum::body::{Body, to_bytes};
use axum::http::Request;
use axum::http::header::HOST;

use worker_bridge_core::HttpRequest;

/// The request body exceeded the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyTooLarge {
    /// Configured limit in bytes.
    pub limit: usize,
}

/// Convert an Axum request, reading at most `max_body_bytes` of body.
///
/// # Errors
///
/// Returns [`BodyTooLarge`] if the body is longer than `max_body_bytes`.
pub async fn from_axum(
    request: Request<Body>,
    max_body_bytes: usize,
) -> Result<HttpRequest, BodyTooLarge> {
    let (parts, body) = request.into_parts();

    let url = absolute_url(&parts);
    let mut converted = HttpRequest::new(parts.method.as_str(), &url);
    converted.headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    converted.body = to_bytes(body, max_body_bytes)
        .await
        .map_err(|_| BodyTooLarge {
            limit: max_body_bytes,
        })?
        .to_vec();

    Ok(converted)
}

/// Rebuild the absolute URL from the request target and `Host` header.
fn absolute_url(parts: &axum::http::request::Parts) -> String {
    if parts.uri.scheme().is_some() {
        return parts.uri.to_string();
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.authority().map(axum::http::uri::Authority::as_str))
        .unwrap_or("localhost");
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", axum::http::uri::PathAndQuery::as_str);

    format!("http://{host}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    #[tokio::test]
    async fn test_from_axum() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/sum?x=1")
            .header("Host", "worker.example.com")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"a":1,"b":2}"#))
            .unwrap();

        let converted = from_axum(request, 1024).await.unwrap();

        assert_eq!(converted.method, "POST");
        assert_eq!(converted.url, "http://worker.example.com/api/sum?x=1");
        assert_eq!(converted.header("content-type"), Some("application/json"));
        assert_eq!(converted.body, br#"{"a":1,"b":2}"#);
    }

    #[tokio::test]
    async fn test_absolute_uri_kept() {
        let request = Request::builder()
            .uri("https://example.com/x")
            .body(Body::empty())
            .unwrap();

        let converted = from_axum(request, 1024).await.unwrap();
        assert_eq!(converted.url, "https://example.com/x");
        assert!(converted.body.is_empty());
    }

    #[tokio::test]
    async fn test_missing_host() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let converted = from_axum(request, 1024).await.unwrap();
        assert_eq!(converted.url, "http://localhost/");
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();

        let err = from_axum(request, 16).await.unwrap_err();
        assert_eq!(err, BodyTooLarge { limit: 16 });
    }
}
