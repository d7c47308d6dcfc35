//! Shared application state.
//!
//! This module provides [`AppState`], which holds the [`Bridge`] and the
//! per-deployment settings every route handler needs.

use std::sync::Arc;
use std::time::Duration;

use worker_bridge_common::{ConfigFile, RuntimeConfig, RuntimeError, ServerConfigFile};
use worker_bridge_core::{
    Bridge, ContextBuilder, EnvBindings, HostCapabilities, ModuleLoader, ModuleSource,
    WasmEngine, source_from_config,
};
use worker_bridge_host::{LogMailTransport, capabilities, create_instance_runner};

/// Settings of the HTTP host itself.
#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    /// Route requests through the page-function entry point.
    pub pages: bool,
    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from(&ServerConfigFile::default())
    }
}

impl From<&ServerConfigFile> for HostOptions {
    fn from(config: &ServerConfigFile) -> Self {
        Self {
            pages: config.pages,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Event dispatcher (shared across all requests).
    bridge: Arc<Bridge>,

    /// Engine, kept for the epoch ticker.
    engine: WasmEngine,

    /// Environment bindings handed to every event.
    env: EnvBindings,

    options: HostOptions,
}

impl AppState {
    /// Create application state from a configuration file.
    ///
    /// Outgoing email is logged through [`LogMailTransport`].
    ///
    /// # Errors
    ///
    /// Returns an error if no module source is configured, or if engine or
    /// runner creation fails.
    pub fn new(config: &ConfigFile) -> Result<Self, RuntimeError> {
        let fetch_timeout = Duration::from_secs(config.server.request_timeout_secs);
        let source = source_from_config(&config.module, fetch_timeout)
            .map_err(|e| RuntimeError::invalid_config(e.to_string()))?;
        let capabilities = capabilities(&config.connect, Some(Arc::new(LogMailTransport::new())));

        Self::with_source(
            &config.runtime,
            source,
            capabilities,
            EnvBindings::new(config.vars.clone()),
            HostOptions::from(&config.server),
        )
    }

    /// Create application state around an explicit module source.
    ///
    /// # Errors
    ///
    /// Returns an error if engine or runner creation fails.
    pub fn with_source(
        runtime: &RuntimeConfig,
        source: Arc<dyn ModuleSource>,
        capabilities: HostCapabilities,
        env: EnvBindings,
        options: HostOptions,
    ) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&runtime.engine)?;
        Self::with_engine(engine, runtime, source, capabilities, env, options)
    }

    /// Create application state on an existing engine.
    ///
    /// Modules handed over through a precompiled source must come from the
    /// same engine.
    ///
    /// # Errors
    ///
    /// Returns an error if runner creation fails.
    pub fn with_engine(
        engine: WasmEngine,
        runtime: &RuntimeConfig,
        source: Arc<dyn ModuleSource>,
        capabilities: HostCapabilities,
        env: EnvBindings,
        options: HostOptions,
    ) -> Result<Self, RuntimeError> {
        let loader = ModuleLoader::new(engine.clone(), source);
        let runner = create_instance_runner(
            engine.clone(),
            runtime.execution.clone(),
            runtime.bridge.clone(),
        )?;
        let contexts = ContextBuilder::new(runtime.bridge.target, capabilities);
        let bridge = Bridge::new(loader, runner, contexts, runtime.bridge.instance_strategy);

        Ok(Self {
            bridge: Arc::new(bridge),
            engine,
            env,
            options,
        })
    }

    /// Get the event dispatcher.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Get the Wasmtime engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get the environment bindings.
    pub fn env(&self) -> &EnvBindings {
        &self.env
    }

    /// Get the host options.
    pub fn options(&self) -> HostOptions {
        self.options
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bridge", &self.bridge)
            .field("vars", &self.env.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_bridge_common::EngineConfig;
    use worker_bridge_core::BytesSource;

    #[test]
    fn test_app_state_requires_module() {
        let config = ConfigFile::default();
        let err = AppState::new(&config).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_app_state_from_config() {
        let mut config = ConfigFile::default();
        config.runtime.engine = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        config.module.path = Some("app.wasm".into());
        config.vars.insert("GREETING".into(), "hello".into());
        config.server.pages = true;

        let state = AppState::new(&config).unwrap();

        assert_eq!(state.env().get("GREETING"), Some("hello"));
        assert!(state.options().pages);
        assert!(!state.bridge().loader().is_loaded());
    }

    #[test]
    fn test_with_source() {
        let runtime = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let state = AppState::with_source(
            &runtime,
            Arc::new(BytesSource::new(Vec::new())),
            HostCapabilities::default(),
            EnvBindings::default(),
            HostOptions::default(),
        )
        .unwrap();

        assert!(state.env().is_empty());
        assert!(!state.options().pages);
    }
}
