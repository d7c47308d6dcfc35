//! HTTP server implementation.
//!
//! This module provides the main [`BridgeServer`] struct for running the
//! HTTP host in front of a worker-bridge guest.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use worker_bridge_common::{ConfigFile, RuntimeError, ServerConfigFile};

use crate::router::build_router;
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8787)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Build the server config from the `[server]` section.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not parse.
    pub fn from_file(config: &ServerConfigFile) -> Result<Self, RuntimeError> {
        let bind_addr = config.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Invalid bind address '{}': {e}",
                config.bind_addr
            ))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: config.request_timeout_secs,
            graceful_shutdown: config.graceful_shutdown,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP host for a worker-bridge guest.
///
/// This is the main entry point for running the HTTP server.
///
/// # Example
///
/// ```ignore
/// use worker_bridge_common::ConfigFile;
/// use worker_bridge_server::BridgeServer;
///
/// let config = ConfigFile::from_file("worker-bridge.toml")?;
/// let server = BridgeServer::new(&config)?;
/// server.run().await?;
/// ```
pub struct BridgeServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
}

impl BridgeServer {
    /// Create a new server from a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the runtime cannot
    /// be initialized.
    pub fn new(config: &ConfigFile) -> Result<Self, RuntimeError> {
        let server_config = ServerConfig::from_file(&config.server)?;
        let state = AppState::new(config)?;
        Ok(Self::from_state(state, server_config))
    }

    /// Create a server around existing state.
    pub fn from_state(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// The module is loaded before the listener opens. A failed load is
    /// logged and retried on the first event.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        if let Err(e) = self.state.bridge().preload().await {
            warn!(error = %e, "Module preload failed, will retry on first event");
        }
        let ticker = self.state.engine().spawn_epoch_ticker();

        let app = build_router(self.state, self.config.request_timeout());

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        let served = if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, app).await
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        served.map_err(|e| RuntimeError::invalid_config(format!("Server error: {e}")))?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    pub async fn start_test(state: AppState) -> Result<TestHandle, RuntimeError> {
        let ticker = state.engine().spawn_epoch_ticker();
        let app = build_router(state.clone(), Duration::from_secs(30));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Some(ticker) = ticker {
                ticker.abort();
            }
            served
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for loading modules).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// A signal that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
