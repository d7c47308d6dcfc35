//! Per-invocation runtime context.
//!
//! A [`RuntimeContext`] bundles the host capabilities one dispatched event
//! hands to the guest: environment bindings, the execution-context handle,
//! the optional raw-connect and email capabilities, and the binding channel.
//! [`ContextBuilder`] produces one per event and drops the optional
//! capabilities the deployment target does not offer.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use worker_bridge_common::{DeploymentTarget, HostFunctionError};

use crate::binding::BindingChannel;
use crate::event::EmailMessage;

/// Opaque key → value environment bindings.
///
/// Cheap to clone; the map itself is shared and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBindings(Arc<BTreeMap<String, String>>);

impl EnvBindings {
    /// Create bindings from a map.
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self(Arc::new(vars))
    }

    /// Look up one binding.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate over all bindings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvBindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Host execution-context handle for work that outlives the event result.
///
/// Clones share the same set of background tasks.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    inner: Arc<ExecutionInner>,
}

#[derive(Debug)]
struct ExecutionInner {
    id: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Create a context with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create a context with the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ExecutionInner {
                id: id.into(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identifier used to correlate logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run `task` in the background, beyond the lifetime of the event result.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.inner.tasks.lock().push(handle);
        debug!(execution_id = %self.inner.id, "Background task registered");
    }

    /// Number of background tasks not yet awaited through [`wait_all`](Self::wait_all).
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Wait for every background task registered so far, including tasks
    /// registered while waiting.
    pub async fn wait_all(&self) {
        loop {
            let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                // A panicking task is already reported by the runtime
                let _ = task.await;
            }
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw network-connect primitive.
#[async_trait]
pub trait SocketConnector: Send + Sync + std::fmt::Debug {
    /// Open a TCP connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, HostFunctionError>;

    /// Maximum sockets a guest may open within one invocation.
    fn max_connections(&self) -> u32;
}

/// Delivery of outgoing email built by the guest.
#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Send one message.
    async fn send(&self, message: EmailMessage) -> Result<(), HostFunctionError>;
}

/// Capabilities the host is able to offer, before target filtering.
#[derive(Debug, Clone, Default)]
pub struct HostCapabilities {
    /// Raw network-connect primitive.
    pub connector: Option<Arc<dyn SocketConnector>>,
    /// Outgoing email delivery.
    pub mail: Option<Arc<dyn MailTransport>>,
}

/// Immutable bundle of host capabilities for one invocation.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    env: EnvBindings,
    exec: ExecutionContext,
    connector: Option<Arc<dyn SocketConnector>>,
    mail: Option<Arc<dyn MailTransport>>,
    binding: BindingChannel,
    target: DeploymentTarget,
}

impl RuntimeContext {
    /// Environment bindings.
    pub fn env(&self) -> &EnvBindings {
        &self.env
    }

    /// Execution-context handle.
    pub fn execution(&self) -> &ExecutionContext {
        &self.exec
    }

    /// Raw network-connect primitive, if the target offers one.
    pub fn connector(&self) -> Option<&Arc<dyn SocketConnector>> {
        self.connector.as_ref()
    }

    /// Email delivery, if the target offers it.
    pub fn mail(&self) -> Option<&Arc<dyn MailTransport>> {
        self.mail.as_ref()
    }

    /// Channel the guest registers its handlers in.
    pub fn binding(&self) -> &BindingChannel {
        &self.binding
    }

    /// Deployment target the context was built for.
    pub fn target(&self) -> DeploymentTarget {
        self.target
    }
}

/// Builds [`RuntimeContext`]s for one deployment target.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    target: DeploymentTarget,
    capabilities: HostCapabilities,
}

impl ContextBuilder {
    /// Create a builder offering `capabilities` as far as `target` allows.
    pub fn new(target: DeploymentTarget, capabilities: HostCapabilities) -> Self {
        Self {
            target,
            capabilities,
        }
    }

    /// Deployment target of the contexts this builder produces.
    pub fn target(&self) -> DeploymentTarget {
        self.target
    }

    /// Assemble the context for one invocation.
    ///
    /// Pure construction: bindings are not validated here, a bad binding only
    /// surfaces when the guest uses it.
    pub fn build(
        &self,
        env: EnvBindings,
        exec: ExecutionContext,
        binding: BindingChannel,
    ) -> RuntimeContext {
        let connector = self
            .capabilities
            .connector
            .clone()
            .filter(|_| self.target.supports_connect());
        let mail = self
            .capabilities
            .mail
            .clone()
            .filter(|_| self.target.supports_email());

        RuntimeContext {
            env,
            exec,
            connector,
            mail,
            binding,
            target: self.target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NoopMail;

    #[async_trait]
    impl MailTransport for NoopMail {
        async fn send(&self, _message: EmailMessage) -> Result<(), HostFunctionError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct RefusingConnector;

    #[async_trait]
    impl SocketConnector for RefusingConnector {
        async fn connect(&self, host: &str, _port: u16) -> Result<TcpStream, HostFunctionError> {
            Err(HostFunctionError::PermissionDenied {
                resource: host.to_string(),
            })
        }

        fn max_connections(&self) -> u32 {
            0
        }
    }

    fn capabilities() -> HostCapabilities {
        HostCapabilities {
            connector: Some(Arc::new(RefusingConnector)),
            mail: Some(Arc::new(NoopMail)),
        }
    }

    #[test]
    fn test_env_bindings_lookup() {
        let env: EnvBindings = [("API_KEY", "secret"), ("MODE", "dev")].into_iter().collect();

        assert_eq!(env.get("API_KEY"), Some("secret"));
        assert!(env.get("missing").is_none());
        assert_eq!(env.len(), 2);
        assert_eq!(env.iter().next(), Some(("API_KEY", "secret")));
    }

    #[test]
    fn test_build_cloudflare_context() {
        let builder = ContextBuilder::new(DeploymentTarget::Cloudflare, capabilities());
        let ctx = builder.build(
            EnvBindings::default(),
            ExecutionContext::new(),
            BindingChannel::new(),
        );

        assert!(ctx.connector().is_some());
        assert!(ctx.mail().is_some());
        assert_eq!(ctx.target(), DeploymentTarget::Cloudflare);
    }

    #[test]
    fn test_build_browser_context_drops_capabilities() {
        let builder = ContextBuilder::new(DeploymentTarget::Browser, capabilities());
        let ctx = builder.build(
            EnvBindings::default(),
            ExecutionContext::new(),
            BindingChannel::new(),
        );

        assert!(ctx.connector().is_none());
        assert!(ctx.mail().is_none());
    }

    #[test]
    fn test_build_keeps_binding_channel() {
        let builder = ContextBuilder::new(DeploymentTarget::Browser, HostCapabilities::default());
        let channel = BindingChannel::new();
        let ctx = builder.build(EnvBindings::default(), ExecutionContext::new(), channel.clone());

        ctx.binding()
            .register(crate::EventKind::Fetch, "handle")
            .unwrap();
        assert!(channel.seal().handler(crate::EventKind::Fetch).is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_runs_in_background() {
        let exec = ExecutionContext::with_id("exec-1");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            exec.wait_until(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(exec.pending(), 3);

        exec.wait_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(exec.pending(), 0);
        assert_eq!(exec.id(), "exec-1");
    }

    #[tokio::test]
    async fn test_wait_all_includes_nested_tasks() {
        let exec = ExecutionContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let nested_exec = exec.clone();
        let nested_counter = Arc::clone(&counter);
        exec.wait_until(async move {
            let counter = Arc::clone(&nested_counter);
            nested_exec.wait_until(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        exec.wait_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
