//! Raw TCP connect capability.
//!
//! [`TcpConnector`] is the host side of `net.connect`: it checks the
//! destination against [`Permissions`], resolves it, rejects private
//! addresses a public hostname resolves to, and connects with a timeout.

use async_trait::async_trait;
use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, warn};

use worker_bridge_common::HostFunctionError;
use worker_bridge_core::SocketConnector;

use crate::Permissions;

/// Permission-checked TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    permissions: Permissions,
}

impl TcpConnector {
    /// Create a connector enforcing `permissions`.
    pub fn new(permissions: Permissions) -> Self {
        Self { permissions }
    }

    /// The permissions in effect.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

#[async_trait]
impl SocketConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, HostFunctionError> {
        if !self.permissions.is_connect_allowed(host) {
            warn!(host, port, "Connect denied by permissions");
            return Err(HostFunctionError::PermissionDenied {
                resource: format!("{host}:{port}"),
            });
        }

        let timeout = self.permissions.connect_timeout;
        let addrs: Vec<_> = tokio::time::timeout(timeout, lookup_host((host, port)))
            .await
            .map_err(|_| HostFunctionError::io("resolve", format!("{host} timed out")))?
            .map_err(|e| HostFunctionError::io("resolve", e.to_string()))?
            .collect();

        if !self.permissions.allow_private
            && addrs.iter().any(|a| Permissions::is_private_ip(a.ip()))
        {
            warn!(host, "Host resolves to a private address");
            return Err(HostFunctionError::PermissionDenied {
                resource: format!("{host}:{port}"),
            });
        }

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addrs.as_slice()))
            .await
            .map_err(|_| HostFunctionError::io("connect", format!("{host}:{port} timed out")))?
            .map_err(|e| HostFunctionError::io("connect", e.to_string()))?;

        debug!(host, port, "Socket connected");
        Ok(stream)
    }

    fn max_connections(&self) -> u32 {
        self.permissions.max_connections
    }
}
