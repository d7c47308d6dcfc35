//! Capability-based security for raw socket access.
//!
//! This module provides the [`Permissions`] struct, which defines which
//! hosts a guest may open TCP connections to.

use std::collections::HashSet;
use std::time::Duration;

use worker_bridge_common::ConnectConfig;

/// Connect permissions for guest code.
///
/// Checked by the connector before every `net.connect`.
///
/// # Security Philosophy
///
/// We follow the principle of least privilege:
/// - By default, no host is reachable
/// - Each host pattern must be explicitly granted
/// - Permissions are immutable once the server runs
#[derive(Debug, Clone)]
pub struct Permissions {
    /// Allowed hosts (domain patterns).
    ///
    /// Patterns can be:
    /// - Exact match: `db.example.com`
    /// - Wildcard subdomain: `*.example.com` (matches `db.example.com`, `example.com`)
    /// - All hosts: `*`
    pub allowed_hosts: HashSet<String>,

    /// Maximum sockets per invocation.
    pub max_connections: u32,

    /// Connect timeout.
    pub connect_timeout: Duration,

    /// Allow loopback, private and link-local destinations.
    pub allow_private: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::from_config(&ConnectConfig::default())
    }
}

impl Permissions {
    /// Create a permission set that allows nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a permission set from the `[connect]` config section.
    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            max_connections: config.max_connections,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            allow_private: config.allow_private,
        }
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Check if connecting to `host` is allowed.
    ///
    /// The host must match an allowed pattern and, unless private
    /// destinations are allowed, must not be a private/internal address.
    pub fn is_connect_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        if host.is_empty() {
            return false;
        }

        if !self.allow_private && Self::is_private_address(&host) {
            return false;
        }

        self.allowed_hosts.contains("*")
            || self
                .allowed_hosts
                .iter()
                .any(|pattern| Self::matches_pattern(pattern, &host))
    }

    /// Check if a host matches a permission pattern.
    fn matches_pattern(pattern: &str, host: &str) -> bool {
        match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
            None => pattern == host,
        }
    }

    /// Check if the given host is a loopback, private or link-local address.
    ///
    /// Hostnames are checked by name only; use the resolved address for
    /// [`is_private_ip`](Self::is_private_ip).
    pub fn is_private_address(host: &str) -> bool {
        let host = host.to_lowercase();
        if host == "localhost" || host.ends_with(".localhost") {
            return true;
        }
        if host == "metadata.google.internal" {
            return true;
        }

        // Bracketed IPv6 literals are accepted too
        let literal = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host
        };

        match url::Host::parse(&literal) {
            Ok(url::Host::Ipv4(v4)) => Self::is_private_ip(std::net::IpAddr::V4(v4)),
            Ok(url::Host::Ipv6(v6)) => Self::is_private_ip(std::net::IpAddr::V6(v6)),
            Ok(url::Host::Domain(_)) | Err(_) => false,
        }
    }

    /// Check if a resolved address is loopback, private or link-local.
    pub fn is_private_ip(ip: std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
            }
            std::net::IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6
                        .to_ipv4_mapped()
                        .is_some_and(|v4| Self::is_private_ip(std::net::IpAddr::V4(v4)))
            }
        }
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Allow connections to specific hosts.
    #[must_use]
    pub fn allow_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.allowed_hosts = hosts
            .into_iter()
            .map(|h| h.into().to_lowercase())
            .collect();
        self
    }

    /// Set the maximum number of sockets per invocation.
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.inner.max_connections = max;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.inner.connect_timeout = timeout;
        self
    }

    /// Allow loopback, private and link-local destinations.
    #[must_use]
    pub fn allow_private(mut self) -> Self {
        self.inner.allow_private = true;
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}
