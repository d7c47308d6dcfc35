//! Common errors and configuration for the worker bridge.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror`, one per dispatch stage
//! - Configuration structures for the engine, execution limits and bridge
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    BridgeConfig, DeploymentTarget, EngineConfig, ExecutionConfig, InstanceStrategy,
    RuntimeConfig,
};
pub use config_file::{
    ConfigFile, ConfigFileError, ConnectConfig, ModuleConfig, ServerConfigFile,
};
pub use error::{
    BridgeError, DispatchError, HandlerError, HostFunctionError, LoadError, RuntimeError,
    StartError,
};
