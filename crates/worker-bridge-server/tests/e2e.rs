//! End-to-end tests against a live server on an ephemeral port.

use std::sync::Arc;

use worker_bridge_common::{EngineConfig, RuntimeConfig};
use worker_bridge_core::{
    CompiledModule, EnvBindings, HostCapabilities, PrecompiledSource, WasmEngine,
};
use worker_bridge_server::{AppState, BridgeServer, HostOptions};

/// Echoes the `GREETING` binding, or fails when it is unset.
const GUEST: &str = r#"
    (module
      (import "workers" "ready" (func $ready))
      (import "workers" "register_handler" (func $register (param i32 i32 i32) (result i32)))
      (import "workers" "fail" (func $fail (param i32 i32) (result i32)))
      (import "env" "get" (func $env_get (param i32 i32 i32 i32) (result i32)))
      (import "http" "set_header" (func $set_header (param i32 i32 i32 i32) (result i32)))
      (import "http" "write_body" (func $write_body (param i32 i32) (result i32)))
      (memory (export "memory") 1)
      (global $heap (mut i32) (i32.const 4096))
      (data (i32.const 0) "on_fetch")
      (data (i32.const 16) "GREETING")
      (data (i32.const 32) "x-guest")
      (data (i32.const 48) "wat")
      (data (i32.const 64) "GREETING is not set")
      (func (export "bridge_alloc") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $len)))
        (local.get $ptr))
      (func (export "_start")
        (drop (call $register (i32.const 0) (i32.const 0) (i32.const 8)))
        (call $ready))
      (func (export "on_fetch") (param i32 i32) (result i32)
        (local $n i32)
        (local.set $n (call $env_get (i32.const 16) (i32.const 8) (i32.const 1024) (i32.const 256)))
        (if (i32.lt_s (local.get $n) (i32.const 0))
          (then
            (drop (call $fail (i32.const 64) (i32.const 19)))
            (return (i32.const 1))))
        (drop (call $set_header (i32.const 32) (i32.const 7) (i32.const 48) (i32.const 3)))
        (drop (call $write_body (i32.const 1024) (local.get $n)))
        (i32.const 0))
    )
"#;

fn state(env: EnvBindings) -> AppState {
    let runtime = RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = WasmEngine::new(&runtime.engine).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), GUEST).unwrap();

    AppState::with_engine(
        engine,
        &runtime,
        Arc::new(PrecompiledSource::new(module)),
        HostCapabilities::default(),
        env,
        HostOptions::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fetch_over_http() {
    let env: EnvBindings = [("GREETING", "hello from the guest")].into_iter().collect();
    let server = BridgeServer::start_test(state(env)).await.unwrap();

    let response = reqwest::get(format!("{}/greet", server.url())).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-guest"], "wat");
    assert_eq!(response.text().await.unwrap(), "hello from the guest");

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_over_http() {
    let server = BridgeServer::start_test(state(EnvBindings::default()))
        .await
        .unwrap();

    let response = reqwest::get(server.url()).await.unwrap();

    assert_eq!(response.status(), 500);
    let body = response.text().await.unwrap();
    assert!(body.contains("GREETING is not set"));
    assert!(body.contains(r#""stage":"handler""#));

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_over_http() {
    let server = BridgeServer::start_test(state(EnvBindings::default()))
        .await
        .unwrap();

    let response = reqwest::get(format!("{}/__health", server.url()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}
