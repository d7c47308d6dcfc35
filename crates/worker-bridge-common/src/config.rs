//! Configuration structures for the worker bridge.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, caching)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, memory, timeout)
//! - [`BridgeConfig`]: Deployment target, instance strategy and guest ABI names

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the bridge.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Host/guest bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and compilation caching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instances,
    /// reducing instantiation time from ~1ms to ~10µs.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable Wasmtime's on-disk compilation cache.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,

    /// Enable epoch-based interruption.
    ///
    /// This allows interrupting long-running WebAssembly execution
    /// based on time rather than fuel consumption.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    ///
    /// Epoch deadlines are expressed in ticks, so with the default of 1ms a
    /// deadline of N ticks is roughly N milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cache_compiled_modules: defaults::cache_compiled_modules(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-call execution configuration.
///
/// These settings control resource limits for every guest call: the entry
/// point during startup, each handler invocation and each deferred task.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per guest call.
    ///
    /// Fuel metering provides deterministic CPU limiting.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Wall-clock budget of a handler call in milliseconds.
    ///
    /// Also applied as the epoch deadline when epoch interruption is enabled.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    ///
    /// When disabled the store is given unlimited fuel.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Fuel to put in the store before each guest call.
    pub fn fuel_budget(&self) -> u64 {
        if self.fuel_metering {
            self.max_fuel
        } else {
            u64::MAX
        }
    }
}

/// Platform flavour the bridge is deployed as.
///
/// The target decides which optional capabilities are handed to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTarget {
    /// Full serverless platform: raw sockets and email are available.
    #[default]
    Cloudflare,
    /// Browser-like sandbox: only environment bindings and execution context.
    Browser,
}

impl DeploymentTarget {
    /// Returns `true` if the raw network-connect primitive is exposed.
    pub fn supports_connect(self) -> bool {
        matches!(self, Self::Cloudflare)
    }

    /// Returns `true` if email constructors are exposed.
    pub fn supports_email(self) -> bool {
        matches!(self, Self::Cloudflare)
    }

    /// Lowercase name used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
            Self::Browser => "browser",
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cloudflare" => Ok(Self::Cloudflare),
            "browser" => Ok(Self::Browser),
            other => Err(format!("unknown deployment target '{other}'")),
        }
    }
}

/// Whether guest instances are created per event or kept alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStrategy {
    /// A new instance per dispatched event.
    #[default]
    Fresh,
    /// One long-lived instance shared by all events, restarted if it traps.
    Reuse,
}

impl InstanceStrategy {
    /// Lowercase name used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Reuse => "reuse",
        }
    }
}

impl fmt::Display for InstanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fresh" => Ok(Self::Fresh),
            "reuse" => Ok(Self::Reuse),
            other => Err(format!("unknown instance strategy '{other}'")),
        }
    }
}

/// Host/guest bridge configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Deployment target.
    #[serde(default)]
    pub target: DeploymentTarget,

    /// Instance reuse policy.
    #[serde(default)]
    pub instance_strategy: InstanceStrategy,

    /// Bound on the wait for the readiness handshake, in milliseconds.
    #[serde(default = "defaults::ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Export run to start the guest program.
    #[serde(default = "defaults::entry_point")]
    pub entry_point: String,

    /// Export used to reserve guest memory for event payloads.
    #[serde(default = "defaults::alloc_export")]
    pub alloc_export: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target: DeploymentTarget::default(),
            instance_strategy: InstanceStrategy::default(),
            ready_timeout_ms: defaults::ready_timeout_ms(),
            entry_point: defaults::entry_point(),
            alloc_export: defaults::alloc_export(),
        }
    }
}

impl BridgeConfig {
    /// Get the readiness bound as a `Duration`.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn cache_compiled_modules() -> bool {
        false
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn ready_timeout_ms() -> u64 {
        5_000
    }

    pub fn entry_point() -> String {
        "_start".to_string()
    }

    pub fn alloc_export() -> String {
        "bridge_alloc".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert_eq!(config.engine.instance_memory_mb, 64);
        assert!(config.engine.epoch_interruption);

        assert_eq!(config.execution.max_fuel, 10_000_000);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert!(config.execution.fuel_metering);

        assert_eq!(config.bridge.target, DeploymentTarget::Cloudflare);
        assert_eq!(config.bridge.instance_strategy, InstanceStrategy::Fresh);
        assert_eq!(config.bridge.entry_point, "_start");
        assert_eq!(config.bridge.alloc_export, "bridge_alloc");
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"bridge": {"target": "browser", "instance_strategy": "reuse"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.bridge.target, DeploymentTarget::Browser);
        assert_eq!(config.bridge.instance_strategy, InstanceStrategy::Reuse);
        // Default values for unspecified fields
        assert_eq!(config.bridge.ready_timeout_ms, 5_000);
        assert!(config.engine.pooling_allocator);
    }

    #[test]
    fn test_target_capabilities() {
        assert!(DeploymentTarget::Cloudflare.supports_connect());
        assert!(DeploymentTarget::Cloudflare.supports_email());
        assert!(!DeploymentTarget::Browser.supports_connect());
        assert!(!DeploymentTarget::Browser.supports_email());
    }

    #[test]
    fn test_parse_target_and_strategy() {
        assert_eq!("Browser".parse(), Ok(DeploymentTarget::Browser));
        assert!("lambda".parse::<DeploymentTarget>().is_err());
        assert_eq!("reuse".parse(), Ok(InstanceStrategy::Reuse));
        assert!("pooled".parse::<InstanceStrategy>().is_err());
    }

    #[test]
    fn test_fuel_budget() {
        let metered = ExecutionConfig {
            max_fuel: 500,
            ..Default::default()
        };
        assert_eq!(metered.fuel_budget(), 500);

        let unmetered = ExecutionConfig {
            fuel_metering: false,
            ..Default::default()
        };
        assert_eq!(unmetered.fuel_budget(), u64::MAX);
    }

    #[test]
    fn test_durations() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Duration::from_millis(500));

        let engine = EngineConfig {
            epoch_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(engine.epoch_tick(), Duration::from_millis(1));
    }
}
