//! Configuration file structures for the worker bridge.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP host settings
//! - [`ModuleConfig`]: Where the guest module comes from
//! - [`ConnectConfig`]: Raw socket permissions

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.bridge]
/// target = "cloudflare"
/// instance_strategy = "fresh"
///
/// [runtime.execution]
/// max_fuel = 10_000_000
///
/// [server]
/// bind_addr = "0.0.0.0:8787"
///
/// [module]
/// path = "./build/app.wasm"
///
/// [vars]
/// GREETING = "hello"
///
/// [connect]
/// allowed_hosts = ["*.example.com"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and bridge settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP host configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Guest module source.
    #[serde(default)]
    pub module: ModuleConfig,

    /// Environment bindings handed to the guest on every event.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Raw socket permissions.
    #[serde(default)]
    pub connect: ConnectConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML, or if the
    /// module section names more than one source.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.module.validate()?;
        Ok(config)
    }
}

/// HTTP host configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8787").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Route requests through the page-function entry point instead of `fetch`.
    #[serde(default)]
    pub pages: bool,

    /// Largest request body accepted, in bytes.
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            pages: false,
            max_body_bytes: defaults::max_body_bytes(),
        }
    }
}

/// Guest module source.
///
/// Exactly one of the fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleConfig {
    /// Bundled `.wasm` file on disk.
    pub path: Option<String>,

    /// Remote `.wasm` file fetched on first use.
    pub url: Option<String>,

    /// Precompiled `.cwasm` artifact produced by the same Wasmtime version.
    pub precompiled: Option<String>,
}

impl ModuleConfig {
    /// Check that at most one source is configured.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let configured = [&self.path, &self.url, &self.precompiled]
            .iter()
            .filter(|s| s.is_some())
            .count();

        if configured > 1 {
            return Err(ConfigFileError::Invalid {
                message: "module section must set only one of 'path', 'url' or 'precompiled'"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Returns `true` if no source is configured.
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.url.is_none() && self.precompiled.is_none()
    }
}

/// Raw socket permissions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    /// Allowed host patterns (`api.example.com`, `*.example.com`, `*`).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Maximum sockets a guest may open per invocation.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,

    /// Connect timeout in milliseconds.
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Allow connections to loopback, private and link-local addresses.
    #[serde(default)]
    pub allow_private: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            max_connections: defaults::max_connections(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
            allow_private: false,
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The file parsed but is inconsistent.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8787".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub const fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub const fn max_connections() -> u32 {
        6
    }

    pub const fn connect_timeout_ms() -> u64 {
        5_000
    }
}
