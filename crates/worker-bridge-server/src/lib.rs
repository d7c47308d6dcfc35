//! HTTP host for worker-bridge.
//!
//! This crate delivers platform events to a guest over HTTP. It handles:
//!
//! - Request routing to the event entry points
//! - Request/response transformation
//! - Error mapping per dispatch stage
//! - Health and readiness checks
//!
//! # Quick Start
//!
//! ```ignore
//! use worker_bridge_common::ConfigFile;
//! use worker_bridge_server::BridgeServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigFile::from_file("worker-bridge.toml")?;
//!
//!     let server = BridgeServer::new(&config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use server::{BridgeServer, ServerConfig, TestHandle};
pub use state::{AppState, HostOptions};
