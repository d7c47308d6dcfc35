//! Host-facing event entry points.
//!
//! [`Bridge`] exposes one entry point per event kind. Every entry point runs
//! the same sequence, parameterized by [`EventKind`]:
//!
//! ```text
//! received → context-built → instance-starting → instance-ready → handler-invoked → completed
//!     └──────────────┴──────────────┴──────────────────┴─────────────────┴──────→ failed
//! ```
//!
//! With [`InstanceStrategy::Fresh`] every event starts its own instance. With
//! [`InstanceStrategy::Reuse`] the first event starts a shared instance under
//! a lock and later events reuse it. An instance that trapped, or whose call
//! was abandoned mid-way by a dropped dispatch, is replaced on the next event.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use worker_bridge_common::{BridgeError, DispatchError, InstanceStrategy, LoadError};

use crate::binding::{BindingChannel, EventKind};
use crate::context::{ContextBuilder, EnvBindings, ExecutionContext};
use crate::event::{
    EmailEvent, HttpRequest, HttpResponse, MessageBatch, PageContext, QueueOutcome,
    ScheduledEvent,
};
use crate::instance::{InstanceRunner, LiveInstance};
use crate::loader::ModuleLoader;
use crate::store::Invocation;

/// Stages of one dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    /// Event accepted from the host.
    Received,
    /// Runtime context assembled.
    ContextBuilt,
    /// Module loaded, instance being started.
    InstanceStarting,
    /// Readiness signaled, handlers sealed.
    InstanceReady,
    /// Guest handler called.
    HandlerInvoked,
    /// Handler returned successfully.
    Completed,
    /// Some stage failed.
    Failed,
}

impl DispatchStage {
    /// Kebab-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ContextBuilt => "context-built",
            Self::InstanceStarting => "instance-starting",
            Self::InstanceReady => "instance-ready",
            Self::HandlerInvoked => "handler-invoked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(stage: DispatchStage) {
    debug!(stage = %stage, "Dispatch stage");
}

/// Shared instance of the reuse strategy.
type Lease = Arc<Mutex<LiveInstance>>;

/// Event dispatcher.
///
/// Shared by every event the host delivers; all methods take `&self`.
pub struct Bridge {
    loader: ModuleLoader,
    runner: InstanceRunner,
    contexts: ContextBuilder,
    strategy: InstanceStrategy,
    shared: Mutex<Option<Lease>>,
}

impl Bridge {
    /// Create a dispatcher.
    pub fn new(
        loader: ModuleLoader,
        runner: InstanceRunner,
        contexts: ContextBuilder,
        strategy: InstanceStrategy,
    ) -> Self {
        info!(
            strategy = %strategy,
            target = %contexts.target(),
            "Bridge created"
        );
        Self {
            loader,
            runner,
            contexts,
            strategy,
            shared: Mutex::new(None),
        }
    }

    /// Instance strategy in effect.
    pub fn strategy(&self) -> InstanceStrategy {
        self.strategy
    }

    /// The module loader.
    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// Load the module ahead of the first event.
    pub async fn preload(&self) -> Result<(), LoadError> {
        self.loader.load().await.map(|_| ())
    }

    /// Handle an HTTP request.
    pub async fn fetch(
        &self,
        mut request: HttpRequest,
        env: EnvBindings,
        exec: ExecutionContext,
    ) -> Result<HttpResponse, BridgeError> {
        let body = std::mem::take(&mut request.body);
        let invocation = self
            .dispatch(EventKind::Fetch, env, exec, Some(request), body)
            .await?;
        Ok(invocation.response)
    }

    /// Handle a scheduled trigger.
    pub async fn scheduled(
        &self,
        event: ScheduledEvent,
        env: EnvBindings,
        exec: ExecutionContext,
    ) -> Result<(), BridgeError> {
        let payload = to_payload(&event)?;
        self.dispatch(EventKind::Scheduled, env, exec, None, payload)
            .await
            .map(|_| ())
    }

    /// Handle a queue batch and report the guest's per-message decisions.
    pub async fn queue(
        &self,
        batch: MessageBatch,
        env: EnvBindings,
        exec: ExecutionContext,
    ) -> Result<QueueOutcome, BridgeError> {
        let payload = to_payload(&batch)?;
        let invocation = self
            .dispatch(EventKind::Queue, env, exec, None, payload)
            .await?;
        Ok(invocation.queue)
    }

    /// Handle an incoming email.
    pub async fn email(
        &self,
        event: EmailEvent,
        env: EnvBindings,
        exec: ExecutionContext,
    ) -> Result<(), BridgeError> {
        let payload = to_payload(&event)?;
        self.dispatch(EventKind::Email, env, exec, None, payload)
            .await
            .map(|_| ())
    }

    /// Handle a page-function request.
    ///
    /// Runs the request handler with the request and bindings taken from
    /// the single context object.
    pub async fn on_request(&self, context: PageContext) -> Result<HttpResponse, BridgeError> {
        let PageContext { request, env, ctx } = context;
        self.fetch(request, env, ctx).await
    }

    /// Shared sequence behind every entry point.
    #[instrument(skip_all, fields(kind = %kind, invocation_id = tracing::field::Empty))]
    async fn dispatch(
        &self,
        kind: EventKind,
        env: EnvBindings,
        exec: ExecutionContext,
        request: Option<HttpRequest>,
        payload: Vec<u8>,
    ) -> Result<Invocation, BridgeError> {
        let invocation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("invocation_id", invocation_id.as_str());
        let started = Instant::now();
        enter(DispatchStage::Received);

        let result = match self.strategy {
            InstanceStrategy::Fresh => {
                self.dispatch_fresh(kind, env, exec, &invocation_id, request, &payload)
                    .await
            }
            InstanceStrategy::Reuse => {
                self.dispatch_reused(kind, env, exec, &invocation_id, request, &payload)
                    .await
            }
        };

        match &result {
            Ok(_) => {
                enter(DispatchStage::Completed);
                debug!(duration_ms = started.elapsed().as_millis(), "Event handled");
            }
            Err(e) => {
                error!(
                    stage = %DispatchStage::Failed,
                    failed_in = e.stage(),
                    error = %e,
                    duration_ms = started.elapsed().as_millis(),
                    "Dispatch failed"
                );
            }
        }

        result
    }

    async fn dispatch_fresh(
        &self,
        kind: EventKind,
        env: EnvBindings,
        exec: ExecutionContext,
        invocation_id: &str,
        request: Option<HttpRequest>,
        payload: &[u8],
    ) -> Result<Invocation, BridgeError> {
        let context = self.contexts.build(env, exec.clone(), BindingChannel::new());
        enter(DispatchStage::ContextBuilt);

        let module = self.loader.load().await?;
        enter(DispatchStage::InstanceStarting);

        let mut instance = self
            .runner
            .start(&module, context.clone(), invocation_id)
            .await?;
        enter(DispatchStage::InstanceReady);

        enter(DispatchStage::HandlerInvoked);
        let invocation = instance
            .invoke(kind, context.clone(), invocation_id, request, payload)
            .await?;

        if !invocation.deferred.is_empty() {
            let deferred = invocation.deferred.clone();
            let invocation_id = invocation_id.to_string();
            exec.wait_until(async move {
                instance
                    .run_deferred(context, &invocation_id, &deferred)
                    .await;
            });
        }

        Ok(invocation)
    }

    async fn dispatch_reused(
        &self,
        kind: EventKind,
        env: EnvBindings,
        exec: ExecutionContext,
        invocation_id: &str,
        request: Option<HttpRequest>,
        payload: &[u8],
    ) -> Result<Invocation, BridgeError> {
        // The shared instance is past readiness: its handlers are sealed
        let context = self
            .contexts
            .build(env.clone(), exec.clone(), BindingChannel::sealed());
        enter(DispatchStage::ContextBuilt);

        let (lease, mut instance) = self.lease(&env, &exec, invocation_id).await?;
        enter(DispatchStage::HandlerInvoked);
        let result = instance
            .invoke(kind, context.clone(), invocation_id, request, payload)
            .await;

        let usable = instance.is_ready();
        drop(instance);
        if !usable {
            self.retire(&lease).await;
        }

        let invocation = result?;
        if !invocation.deferred.is_empty() {
            let deferred = invocation.deferred.clone();
            let invocation_id = invocation_id.to_string();
            exec.wait_until(async move {
                lease
                    .lock()
                    .await
                    .run_deferred(context, &invocation_id, &deferred)
                    .await;
            });
        }

        Ok(invocation)
    }

    /// Lock the shared instance, starting a new one if there is none or the
    /// current one is not ready.
    ///
    /// The instance is checked and locked under the slot lock, so no other
    /// event can leave it half-run in between. The slot lock also serializes
    /// startup: concurrent first events wait for a single readiness handshake.
    async fn lease(
        &self,
        env: &EnvBindings,
        exec: &ExecutionContext,
        invocation_id: &str,
    ) -> Result<(Lease, OwnedMutexGuard<LiveInstance>), BridgeError> {
        let mut slot = self.shared.lock().await;
        if let Some(lease) = slot.clone() {
            let instance = Arc::clone(&lease).lock_owned().await;
            if instance.is_ready() {
                enter(DispatchStage::InstanceReady);
                return Ok((lease, instance));
            }
            warn!(state = ?instance.state(), "Shared instance unusable, replacing it");
            *slot = None;
        }

        let module = self.loader.load().await?;
        let startup = self
            .contexts
            .build(env.clone(), exec.clone(), BindingChannel::new());
        enter(DispatchStage::InstanceStarting);

        let instance = self.runner.start(&module, startup, invocation_id).await?;
        enter(DispatchStage::InstanceReady);
        info!("Shared instance started");

        let lease = Arc::new(Mutex::new(instance));
        let instance = Arc::clone(&lease).lock_owned().await;
        *slot = Some(Arc::clone(&lease));
        Ok((lease, instance))
    }

    /// Drop the shared instance if it is still `lease`.
    async fn retire(&self, lease: &Lease) {
        let mut slot = self.shared.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, lease))
        {
            info!("Shared instance unusable, will restart on next event");
            *slot = None;
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("strategy", &self.strategy)
            .field("target", &self.contexts.target())
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

fn to_payload<T: Serialize>(event: &T) -> Result<Vec<u8>, DispatchError> {
    serde_json::to_vec(event).map_err(|e| DispatchError::payload(e.to_string()))
}
