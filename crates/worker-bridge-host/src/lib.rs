//! Host capabilities for worker-bridge guests.
//!
//! This crate implements the imports a guest module links against, beyond
//! the `workers` lifecycle imports the core crate registers itself.
//!
//! # Interfaces
//!
//! - [`linker`]: Registers `env`, `http`, `ctx`, `net`, `email` and `queue`
//! - [`logging`]: Guest log lines
//! - [`net`]: Permission-checked TCP connector
//! - [`mail`]: Outgoing email transport
//! - [`permissions`]: Connect allow-list
//!
//! # Security Model
//!
//! Optional capabilities are only present in a guest's context when the
//! deployment target supports them. Raw sockets are further restricted to
//! allow-listed hosts, never reach private addresses unless configured to,
//! and are capped per invocation.

pub mod linker;
pub mod logging;
pub mod mail;
pub mod net;
pub mod permissions;

use std::sync::Arc;

use worker_bridge_common::{BridgeConfig, ConnectConfig, ExecutionConfig, RuntimeError};
use worker_bridge_core::{HostCapabilities, InstanceRunner, MailTransport, WasmEngine};

pub use linker::register_all;
pub use logging::LoggingHost;
pub use mail::LogMailTransport;
pub use net::TcpConnector;
pub use permissions::Permissions;

/// Create an [`InstanceRunner`] whose linker carries every host import.
///
/// # Errors
///
/// Returns an error if linking fails.
pub fn create_instance_runner(
    engine: WasmEngine,
    execution: ExecutionConfig,
    bridge: BridgeConfig,
) -> Result<InstanceRunner, RuntimeError> {
    let mut runner = InstanceRunner::new(engine, execution, bridge)?;
    register_all(runner.linker_mut())?;
    Ok(runner)
}

/// Build the host capabilities from the `[connect]` section and a mail transport.
pub fn capabilities(
    connect: &ConnectConfig,
    mail: Option<Arc<dyn MailTransport>>,
) -> HostCapabilities {
    HostCapabilities {
        connector: Some(Arc::new(TcpConnector::new(Permissions::from_config(connect)))),
        mail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_bridge_common::EngineConfig;

    #[test]
    fn test_create_instance_runner() {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        let runner =
            create_instance_runner(engine, ExecutionConfig::default(), BridgeConfig::default());
        assert!(runner.is_ok());
    }

    #[test]
    fn test_capabilities() {
        let caps = capabilities(&ConnectConfig::default(), None);
        assert!(caps.connector.is_some());
        assert!(caps.mail.is_none());
    }
}
