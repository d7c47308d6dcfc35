//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{
    handle_email, handle_fetch, handle_queue, handle_scheduled, health_check, readiness_check,
};
use crate::state::AppState;

/// Build the main application router.
///
/// Routes:
/// - `GET /__health` - Health check
/// - `GET /__ready` - Readiness check (loads the module)
/// - `POST /__scheduled?cron=&time=` - Scheduled trigger
/// - `POST /__queue/:queue` - Queue batch (JSON array of bodies)
/// - `POST /__email?from=&to=` - Incoming email (raw body)
/// - anything else - Request handler
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let platform_routes = Router::new()
        .route("/__health", get(health_check))
        .route("/__ready", get(readiness_check))
        .route("/__scheduled", post(handle_scheduled))
        .route("/__queue/:queue", post(handle_queue))
        .route("/__email", post(handle_email));

    let max_body_bytes = state.options().max_body_bytes;

    platform_routes
        .fallback(handle_fetch)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use worker_bridge_common::{EngineConfig, RuntimeConfig};
    use worker_bridge_core::{CompiledModule, EnvBindings, HostCapabilities, PrecompiledSource};

    use crate::state::HostOptions;

    const GUEST: &str = r#"
        (module
          (import "workers" "ready" (func $ready))
          (import "workers" "register_handler" (func $register (param i32 i32 i32) (result i32)))
          (import "http" "set_status" (func $set_status (param i32) (result i32)))
          (import "http" "write_body" (func $write_body (param i32 i32) (result i32)))
          (import "queue" "ack_all" (func $ack_all (result i32)))
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 4096))
          (data (i32.const 0) "on_fetch")
          (data (i32.const 16) "on_queue")
          (data (i32.const 32) "hello")
          (func (export "bridge_alloc") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $len)))
            (local.get $ptr))
          (func (export "_start")
            (drop (call $register (i32.const 0) (i32.const 0) (i32.const 8)))
            (drop (call $register (i32.const 2) (i32.const 16) (i32.const 8)))
            (call $ready))
          (func (export "on_fetch") (param i32 i32) (result i32)
            (drop (call $set_status (i32.const 201)))
            (drop (call $write_body (i32.const 32) (i32.const 5)))
            (i32.const 0))
          (func (export "on_queue") (param i32 i32) (result i32)
            (call $ack_all))
        )
    "#;

    fn setup_router(options: HostOptions) -> Router {
        let runtime = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                epoch_interruption: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = worker_bridge_core::WasmEngine::new(&runtime.engine).unwrap();
        let module = CompiledModule::from_wat(engine.inner(), GUEST).unwrap();

        let state = AppState::with_engine(
            engine,
            &runtime,
            Arc::new(PrecompiledSource::new(module)),
            HostCapabilities::default(),
            EnvBindings::default(),
            options,
        )
        .unwrap();
        build_router(state, Duration::from_secs(30))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/__health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/__ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ready");
    }

    #[tokio::test]
    async fn test_fetch_fallback() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/any/path")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_pages_mode() {
        let app = setup_router(HostOptions {
            pages: true,
            ..Default::default()
        });

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let app = setup_router(HostOptions {
            pages: false,
            max_body_bytes: 4,
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("too long"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_queue_route() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/__queue/jobs")
                    .body(Body::from(r#"[{"n":1},{"n":2}]"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ackAll"], true);
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_rejects_non_array() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/__queue/jobs")
                    .body(Body::from(r#"{"n":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scheduled_without_handler() {
        let app = setup_router(HostOptions::default());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/__scheduled?cron=*/5%20*%20*%20*%20*")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body_json(response).await["stage"], "dispatch");
    }
}
