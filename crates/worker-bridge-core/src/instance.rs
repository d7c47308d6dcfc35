//! Guest instance lifecycle management.
//!
//! This module provides [`InstanceRunner`], which starts guest instances, and
//! [`LiveInstance`], a started instance that handlers can be invoked on.
//!
//! Starting an instance:
//!
//! 1. Create a fresh readiness pair and a store holding the runtime context
//! 2. Instantiate the module against the import table
//! 3. Run the entry point within the readiness bound
//! 4. Await the readiness signal and take the sealed handlers
//!
//! The guest signals readiness through `workers.ready` and registers its
//! handlers through `workers.register_handler` before doing so.

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Caller, Instance, Linker, Store, Trap};
use wasmtime_wasi::I32Exit;

use worker_bridge_common::{
    BridgeConfig, BridgeError, DispatchError, ExecutionConfig, HandlerError, RuntimeError,
    StartError,
};

use crate::abi;
use crate::binding::{EventKind, ReadyBindings, RegisterError};
use crate::context::RuntimeContext;
use crate::event::HttpRequest;
use crate::readiness::readiness;
use crate::store::{
    GuestState, Invocation, calculate_fuel_consumed, create_store, get_remaining_fuel, refill,
};
use crate::{CompiledModule, WasmEngine};

/// Execution state of a guest instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Instantiated, entry point not run yet.
    NotStarted,
    /// Guest code running: the entry point, a handler or deferred work.
    ///
    /// An instance left in this state had a call dropped mid-way and must
    /// not be invoked again.
    Running,
    /// Readiness signaled and no call in progress; handlers can be invoked.
    Ready,
    /// Trapped or timed out mid-call; must not be invoked again.
    Terminated,
}

/// Starts guest instances from compiled modules.
///
/// `InstanceRunner` is shared by every dispatch. Each start uses its own
/// [`Store`], so instances never share state.
pub struct InstanceRunner {
    engine: WasmEngine,
    linker: Linker<GuestState>,
    execution: ExecutionConfig,
    bridge: BridgeConfig,
}

impl InstanceRunner {
    /// Create a runner with WASI and the `workers` imports linked.
    ///
    /// # Errors
    ///
    /// Returns an error if an import cannot be registered.
    pub fn new(
        engine: WasmEngine,
        execution: ExecutionConfig,
        bridge: BridgeConfig,
    ) -> Result<Self, RuntimeError> {
        let mut linker = Linker::new(engine.inner());

        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, GuestState::wasi_mut)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to link WASI: {e}")))?;
        register_workers(&mut linker)?;

        Ok(Self {
            engine,
            linker,
            execution,
            bridge,
        })
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host capability imports.
    pub fn linker_mut(&mut self) -> &mut Linker<GuestState> {
        &mut self.linker
    }

    /// Get the engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Per-call execution limits.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Start a guest instance and wait for its readiness signal.
    ///
    /// The entry point must return. Readiness is evaluated once it does, so a
    /// guest that signals readiness and then keeps running (blocking forever
    /// to keep its handlers alive) fails with [`StartError::ReadyTimeout`].
    ///
    /// # Errors
    ///
    /// Returns a [`StartError`] if instantiation fails, the guest traps or
    /// exits before signaling readiness, the readiness bound elapses, or the
    /// guest signals readiness without registering a handler.
    #[instrument(skip(self, module, context), fields(module = %module.content_hash()))]
    pub async fn start(
        &self,
        module: &CompiledModule,
        context: RuntimeContext,
        invocation_id: &str,
    ) -> Result<LiveInstance, StartError> {
        let start = Instant::now();
        let (signal, waiter) = readiness();
        let max_memory_bytes = (self.execution.max_memory_mb as usize) * 1024 * 1024;
        let state = GuestState::new(context, signal, invocation_id.to_string(), max_memory_bytes);

        let mut store = create_store(&self.engine, &self.execution, state)
            .map_err(|e| StartError::instantiate(e.to_string()))?;
        refill(
            &mut store,
            &self.engine,
            self.execution.fuel_budget(),
            self.bridge.ready_timeout(),
        )
        .map_err(|e| StartError::instantiate(e.to_string()))?;

        let mut lifecycle = InstanceState::NotStarted;
        debug!(state = ?lifecycle, "Instantiating guest module");

        let instance = self
            .linker
            .instantiate_async(&mut store, module.as_core_module())
            .await
            .map_err(|e| startup_failure(&e, self.bridge.ready_timeout_ms))?;

        let exit_code = match instance.get_typed_func::<(), ()>(&mut store, &self.bridge.entry_point)
        {
            Ok(entry) => {
                lifecycle = InstanceState::Running;
                debug!(state = ?lifecycle, entry_point = %self.bridge.entry_point, "Running entry point");

                let outcome =
                    tokio::time::timeout(self.bridge.ready_timeout(), entry.call_async(&mut store, ()))
                        .await;

                match outcome {
                    Err(_) => {
                        warn!(
                            timeout_ms = self.bridge.ready_timeout_ms,
                            "Guest did not become ready in time"
                        );
                        return Err(StartError::ReadyTimeout {
                            duration_ms: self.bridge.ready_timeout_ms,
                        });
                    }
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => match e.downcast_ref::<I32Exit>() {
                        Some(I32Exit(code)) => Some(*code),
                        None => return Err(startup_failure(&e, self.bridge.ready_timeout_ms)),
                    },
                }
            }
            // A start section may have signaled already
            Err(_) if store.data().is_ready() => None,
            Err(_) => {
                return Err(StartError::MissingEntryPoint {
                    name: self.bridge.entry_point.clone(),
                });
            }
        };

        // The entry point has returned: a signal that has not arrived by now never will
        store.data_mut().abandon_readiness();
        if waiter.wait().await.is_err() {
            warn!(exit_code = ?exit_code, "Guest exited before signaling readiness");
            return Err(StartError::ExitedBeforeReady { exit_code });
        }

        let bindings = store
            .data_mut()
            .take_bindings()
            .ok_or(StartError::ExitedBeforeReady { exit_code })?;
        if bindings.is_empty() {
            return Err(StartError::NoHandlers);
        }

        lifecycle = InstanceState::Ready;
        info!(
            state = ?lifecycle,
            handlers = ?bindings.kinds(),
            duration_ms = start.elapsed().as_millis(),
            "Guest ready"
        );

        Ok(LiveInstance {
            store,
            instance,
            bindings,
            state: lifecycle,
            engine: self.engine.clone(),
            execution: self.execution.clone(),
            alloc_export: self.bridge.alloc_export.clone(),
        })
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner")
            .field("entry_point", &self.bridge.entry_point)
            .finish_non_exhaustive()
    }
}

/// A started guest instance with its sealed handlers.
pub struct LiveInstance {
    store: Store<GuestState>,
    instance: Instance,
    bindings: ReadyBindings,
    state: InstanceState,
    engine: WasmEngine,
    execution: ExecutionConfig,
    alloc_export: String,
}

impl LiveInstance {
    /// Current execution state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Returns `true` if a handler can be invoked.
    pub fn is_ready(&self) -> bool {
        self.state == InstanceState::Ready
    }

    /// Handlers the guest registered before signaling readiness.
    pub fn bindings(&self) -> &ReadyBindings {
        &self.bindings
    }

    /// Guest state, for inspection after a call.
    pub fn guest(&self) -> &GuestState {
        self.store.data()
    }

    /// Invoke the handler registered for `kind` with `payload`.
    ///
    /// The payload is copied into memory reserved through the alloc export;
    /// an empty payload is passed as `(0, 0)`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Dispatch`] if the guest has no usable handler for
    /// `kind`, and [`BridgeError::Handler`] if the handler fails.
    #[instrument(skip(self, context, request, payload), fields(kind = %kind, payload_len = payload.len()))]
    pub async fn invoke(
        &mut self,
        kind: EventKind,
        context: RuntimeContext,
        invocation_id: &str,
        request: Option<HttpRequest>,
        payload: &[u8],
    ) -> Result<Invocation, BridgeError> {
        if !self.is_ready() {
            return Err(HandlerError::Trap {
                kind: kind.to_string(),
                message: format!("instance not ready ({:?})", self.state),
            }
            .into());
        }

        let export = self.bindings.handler(kind)?.export().to_string();
        let func = self
            .instance
            .get_typed_func::<(i32, i32), i32>(&mut self.store, &export)
            .map_err(|e| DispatchError::InvalidHandler {
                kind: kind.to_string(),
                export: export.clone(),
                reason: e.to_string(),
            })?;

        self.store
            .data_mut()
            .begin_invocation(context, invocation_id.to_string(), kind, request);
        self.reset_limits()?;

        let (ptr, len) = self.pass_payload(payload).await?;

        let initial_fuel = get_remaining_fuel(&self.store).unwrap_or(0);
        let timeout = self.execution.timeout();
        // Stays `Running` if this future is dropped before the call returns
        self.state = InstanceState::Running;
        let outcome = tokio::time::timeout(timeout, func.call_async(&mut self.store, (ptr, len))).await;
        self.record_metrics(initial_fuel);

        let kind_name = kind.to_string();
        let result = match outcome {
            Err(_) => {
                self.state = InstanceState::Terminated;
                Err(HandlerError::Timeout {
                    kind: kind_name,
                    duration_ms: self.execution.timeout_ms,
                })
            }
            Ok(Ok(0)) => {
                self.state = InstanceState::Ready;
                Ok(())
            }
            Ok(Ok(code)) => {
                self.state = InstanceState::Ready;
                Err(HandlerError::Failed {
                    kind: kind_name,
                    code,
                    message: self.store.data_mut().invocation.failure.take(),
                })
            }
            Ok(Err(e)) => {
                self.state = InstanceState::Terminated;
                Err(handler_trap(&e, kind_name, self.execution.timeout_ms))
            }
        };

        let invocation = self.store.data_mut().finish_invocation();
        let metrics = &self.store.data().metrics;

        match result {
            Ok(()) => {
                debug!(
                    fuel_consumed = metrics.fuel_consumed,
                    memory_bytes = metrics.memory_used_bytes,
                    deferred = invocation.deferred.len(),
                    "Handler completed"
                );
                Ok(invocation)
            }
            Err(e) => {
                error!(error = %e, fuel_consumed = metrics.fuel_consumed, "Handler failed");
                Err(e.into())
            }
        }
    }

    /// Run the exports a handler scheduled through `ctx.wait_until`.
    ///
    /// Failures are logged; there is nobody left to report them to.
    #[instrument(skip(self, context, exports))]
    pub async fn run_deferred(
        &mut self,
        context: RuntimeContext,
        invocation_id: &str,
        exports: &[String],
    ) {
        for export in exports {
            if !self.is_ready() {
                warn!(export = %export, state = ?self.state, "Skipping deferred work on an unusable instance");
                return;
            }

            let func = match self.instance.get_typed_func::<(), ()>(&mut self.store, export) {
                Ok(func) => func,
                Err(e) => {
                    warn!(export = %export, error = %e, "Deferred export unusable");
                    continue;
                }
            };

            self.store
                .data_mut()
                .resume(context.clone(), invocation_id.to_string());
            if let Err(e) = self.reset_limits() {
                warn!(error = %e, "Failed to reset limits for deferred work");
                return;
            }

            self.state = InstanceState::Running;
            let outcome =
                tokio::time::timeout(self.execution.timeout(), func.call_async(&mut self.store, ()))
                    .await;
            self.store.data_mut().finish_invocation();

            match outcome {
                Ok(Ok(())) => {
                    self.state = InstanceState::Ready;
                    debug!(export = %export, "Deferred work completed");
                }
                Ok(Err(e)) => {
                    self.state = InstanceState::Terminated;
                    warn!(export = %export, error = %e, "Deferred work trapped");
                }
                Err(_) => {
                    self.state = InstanceState::Terminated;
                    warn!(export = %export, "Deferred work timed out");
                }
            }
        }
    }

    fn reset_limits(&mut self) -> Result<(), HandlerError> {
        refill(
            &mut self.store,
            &self.engine,
            self.execution.fuel_budget(),
            self.execution.timeout(),
        )
        .map_err(|e| HandlerError::Trap {
            kind: self
                .store
                .data()
                .invocation
                .kind
                .map_or("deferred", EventKind::as_str)
                .to_string(),
            message: e.to_string(),
        })
    }

    /// Copy the payload into guest memory.
    ///
    /// The instance is `Running` from the allocator call on; an error after
    /// that point leaves it unusable.
    async fn pass_payload(&mut self, payload: &[u8]) -> Result<(i32, i32), DispatchError> {
        if payload.is_empty() {
            return Ok((0, 0));
        }

        let len = i32::try_from(payload.len())
            .map_err(|_| DispatchError::payload("payload larger than guest memory"))?;
        let alloc = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, &self.alloc_export)
            .map_err(|_| {
                DispatchError::payload(format!("guest does not export '{}'", self.alloc_export))
            })?;
        self.state = InstanceState::Running;
        let ptr = alloc
            .call_async(&mut self.store, len)
            .await
            .map_err(|e| DispatchError::payload(format!("'{}' failed: {e}", self.alloc_export)))?;

        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| DispatchError::payload("guest does not export 'memory'"))?;
        let offset =
            usize::try_from(ptr).map_err(|_| DispatchError::payload("negative payload pointer"))?;
        memory
            .write(&mut self.store, offset, payload)
            .map_err(|e| DispatchError::payload(e.to_string()))?;

        Ok((ptr, len))
    }

    fn record_metrics(&mut self, initial_fuel: u64) {
        let fuel_consumed = calculate_fuel_consumed(initial_fuel, &self.store);
        let memory_used_bytes = self
            .instance
            .get_memory(&mut self.store, "memory")
            .map_or(0, |m| m.data_size(&self.store));

        let metrics = &mut self.store.data_mut().metrics;
        metrics.fuel_consumed = fuel_consumed;
        metrics.memory_used_bytes = memory_used_bytes;
    }
}

impl std::fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveInstance")
            .field("state", &self.state)
            .field("bindings", &self.bindings.kinds())
            .finish_non_exhaustive()
    }
}

/// Register the `workers` imports: readiness, handler registration and failure reporting.
fn register_workers(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "workers",
            "ready",
            |mut caller: Caller<'_, GuestState>| {
                if caller.data_mut().signal_ready() {
                    debug!("Guest signaled ready");
                } else {
                    debug!("Repeated ready signal ignored");
                }
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register ready: {e}")))?;

    linker
        .func_wrap(
            "workers",
            "register_handler",
            |mut caller: Caller<'_, GuestState>, kind: i32, ptr: i32, len: i32| -> i32 {
                let Some(kind) = EventKind::from_abi(kind) else {
                    warn!(kind, "Unknown event kind");
                    return abi::INVALID;
                };
                let name = match abi::read_str(&mut caller, ptr, len) {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(error = %e, "Invalid handler name");
                        return abi::status_of(&e);
                    }
                };

                match caller.data().context().binding().register(kind, name) {
                    Ok(()) => abi::OK,
                    Err(RegisterError::EmptyName) => abi::INVALID,
                    Err(e) => {
                        warn!(error = %e, "Handler registration rejected");
                        abi::REJECTED
                    }
                }
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register register_handler: {e}"))
        })?;

    linker
        .func_wrap(
            "workers",
            "fail",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                match abi::read_str(&mut caller, ptr, len) {
                    Ok(message) => {
                        caller.data_mut().invocation.failure = Some(message);
                        abi::OK
                    }
                    Err(e) => abi::status_of(&e),
                }
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register fail: {e}")))?;

    Ok(())
}

/// Classify a failure during instantiation or the entry point.
fn startup_failure(error: &wasmtime::Error, ready_timeout_ms: u64) -> StartError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => StartError::FuelExhausted,
        Some(Trap::Interrupt) => StartError::ReadyTimeout {
            duration_ms: ready_timeout_ms,
        },
        Some(_) => StartError::Trap {
            message: error.to_string(),
        },
        None => StartError::instantiate(error.to_string()),
    }
}

/// Classify a failure of a handler call.
fn handler_trap(error: &wasmtime::Error, kind: String, timeout_ms: u64) -> HandlerError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => HandlerError::FuelExhausted { kind },
        Some(Trap::Interrupt) => HandlerError::Timeout {
            kind,
            duration_ms: timeout_ms,
        },
        _ => HandlerError::Trap {
            kind,
            message: error.to_string(),
        },
    }
}
