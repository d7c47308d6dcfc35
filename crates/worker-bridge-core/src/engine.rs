//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the bridge. It is:
//! - Thread-safe and shared by every module load and instance start
//! - Configured with pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for resource limiting

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use worker_bridge_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] configured for serverless event
/// handling. The engine is shared across all events and contains no
/// per-event state.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Pooling Allocator**: Pre-allocates memory for instances
/// - **Fuel Metering**: Enables deterministic CPU limiting
/// - **Epoch Interruption**: Bounds wall-clock time of guest calls
/// - **Async Support**: Allows host imports to await network and mail I/O
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - Cache configuration fails
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Host imports (connect, mail) are async
        wasmtime_config.async_support(true);

        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        if config.cache_compiled_modules {
            match wasmtime_config.cache_config_load_default() {
                Ok(_) => debug!("Compilation cache enabled"),
                Err(e) => warn!(error = %e, "Compilation cache unavailable, continuing without it"),
            }
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Spawn a task that advances the epoch every `epoch_tick_ms`.
    ///
    /// Returns `None` when epoch interruption is disabled. Must be called
    /// from within a Tokio runtime; abort the handle to stop ticking.
    pub fn spawn_epoch_ticker(&self) -> Option<JoinHandle<()>> {
        if !self.config.epoch_interruption {
            return None;
        }

        let engine = Arc::clone(&self.engine);
        let mut interval = tokio::time::interval(self.config.epoch_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!(tick_ms = self.config.epoch_tick_ms, "Epoch ticker started");

        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        }))
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Check if epoch deadlines apply to guest calls.
    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config);

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(engine.is_pooling_enabled());
        assert!(engine.is_epoch_enabled());
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_epoch_increment() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config).unwrap();

        // Should not panic
        engine.increment_epoch();
        engine.increment_epoch();
    }

    #[tokio::test]
    async fn test_epoch_ticker_disabled() {
        let config = EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        assert!(engine.spawn_epoch_ticker().is_none());
    }

    #[tokio::test]
    async fn test_epoch_ticker_runs() {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        let ticker = engine.spawn_epoch_ticker().unwrap();
        assert!(!ticker.is_finished());
        ticker.abort();
    }

    #[test]
    fn test_engine_debug() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}
