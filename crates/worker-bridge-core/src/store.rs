//! Guest instance state and store management.
//!
//! This module provides:
//! - [`GuestState`]: State held by one instance's store, reachable from every import
//! - [`Invocation`]: Scratch space for the handler call in progress
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Performance metrics for each guest call
//! - [`HandleTable`]: Integer handles for host resources owned by the guest

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use worker_bridge_common::{ExecutionConfig, RuntimeError};

use crate::WasmEngine;
use crate::binding::{EventKind, ReadyBindings};
use crate::context::RuntimeContext;
use crate::event::{EmailMessage, HttpRequest, HttpResponse, QueueOutcome};
use crate::readiness::ReadinessSignal;

/// Most log entries kept per guest call; later lines are counted, not stored.
pub const MAX_LOG_ENTRIES: usize = 256;

/// Longest log message kept, in bytes.
pub const MAX_LOG_MESSAGE_BYTES: usize = 4096;

/// State owned by one guest instance.
///
/// Created at instance start and dropped with the instance. Imports reach it
/// through [`wasmtime::Caller::data_mut`].
pub struct GuestState {
    /// WASI preview1 context.
    wasi: WasiP1Ctx,

    /// Memory limits applied to the store.
    limits: StoreLimits,

    /// Capabilities of the current invocation.
    context: RuntimeContext,

    /// Guest half of the readiness handshake.
    readiness: ReadinessSignal,

    /// Handlers sealed by the readiness signal, until the lifecycle manager takes them.
    bindings: Option<ReadyBindings>,

    /// Identifier of the current invocation, for tracing.
    pub invocation_id: String,

    /// Scratch space of the handler call in progress.
    pub invocation: Invocation,

    /// Logs collected from guest code during the current call.
    pub logs: Vec<LogEntry>,

    /// Log lines dropped during the current call once [`MAX_LOG_ENTRIES`] was reached.
    pub dropped_logs: usize,

    /// Metrics of the last guest call.
    pub metrics: ExecutionMetrics,

    /// Open sockets.
    pub sockets: HandleTable<TcpStream>,

    /// Outgoing mail built with `email.message` and not yet sent.
    pub outbox: HandleTable<EmailMessage>,

    /// Start of the current guest call.
    start_time: Instant,
}

/// Per-call scratch space.
///
/// Reset before each handler call; the lifecycle manager takes it back once
/// the call returns.
#[derive(Debug, Default)]
pub struct Invocation {
    /// Event kind being handled; `None` for startup and deferred work.
    pub kind: Option<EventKind>,

    /// Request being handled, for `fetch`.
    pub request: Option<HttpRequest>,

    /// Response built through `http.*`.
    pub response: HttpResponse,

    /// Acknowledgements recorded through `queue.*`.
    pub queue: QueueOutcome,

    /// Exports scheduled through `ctx.wait_until`.
    pub deferred: Vec<String>,

    /// Message attached through `workers.fail`.
    pub failure: Option<String>,

    /// Sockets opened so far.
    pub connections_opened: u32,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during the call.
    pub fuel_consumed: u64,

    /// Linear memory size in bytes after the call.
    pub memory_used_bytes: usize,

    /// Duration of the call.
    pub duration: Option<Duration>,
}

/// Table of guest-visible handles to host resources.
///
/// Handles start at 1 and are never reused within one table.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: i32,
    entries: HashMap<i32, T>,
}

impl<T> HandleTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    /// Store `value` and return its handle, or `None` once handles run out.
    pub fn insert(&mut self, value: T) -> Option<i32> {
        let handle = self.next;
        self.next = self.next.checked_add(1)?;
        self.entries.insert(handle, value);
        Some(handle)
    }

    /// Borrow the resource behind `handle`.
    pub fn get_mut(&mut self, handle: i32) -> Option<&mut T> {
        self.entries.get_mut(&handle)
    }

    /// Take the resource behind `handle` out of the table.
    pub fn remove(&mut self, handle: i32) -> Option<T> {
        self.entries.remove(&handle)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no handle is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every resource.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestState {
    /// Create the state of a new instance.
    pub fn new(
        context: RuntimeContext,
        readiness: ReadinessSignal,
        invocation_id: String,
        max_memory_bytes: usize,
    ) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_bytes)
            .build();

        Self {
            wasi: wasi_for(&context),
            limits,
            context,
            readiness,
            bindings: None,
            invocation_id,
            invocation: Invocation::default(),
            logs: Vec::new(),
            dropped_logs: 0,
            metrics: ExecutionMetrics::default(),
            sockets: HandleTable::new(),
            outbox: HandleTable::new(),
            start_time: Instant::now(),
        }
    }

    /// WASI preview1 context, for the linker.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Capabilities of the current invocation.
    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    /// Handle the guest's `ready` call.
    ///
    /// The first call seals the binding channel; later calls return `false`
    /// and change nothing.
    pub fn signal_ready(&mut self) -> bool {
        if !self.readiness.signal() {
            return false;
        }
        self.bindings = Some(self.context.binding().seal());
        true
    }

    /// Returns `true` once the guest has signaled readiness.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_signaled()
    }

    /// Stop waiting for a readiness signal that has not arrived.
    pub(crate) fn abandon_readiness(&mut self) {
        self.readiness.abandon();
    }

    /// Take the handlers sealed by the readiness signal.
    pub(crate) fn take_bindings(&mut self) -> Option<ReadyBindings> {
        self.bindings.take()
    }

    /// Prepare the state for a handler call.
    ///
    /// Resources left over from an earlier invocation on the same instance are
    /// dropped so they are never visible to this one.
    pub fn begin_invocation(
        &mut self,
        context: RuntimeContext,
        invocation_id: String,
        kind: EventKind,
        request: Option<HttpRequest>,
    ) {
        self.set_context(context);
        self.invocation_id = invocation_id;
        self.invocation = Invocation {
            kind: Some(kind),
            request,
            ..Invocation::default()
        };
        self.sockets.clear();
        self.outbox.clear();
        self.start_time = Instant::now();
    }

    /// Prepare the state for deferred work of an earlier handler call.
    ///
    /// Unlike [`begin_invocation`](Self::begin_invocation), resources opened
    /// by the handler stay available.
    pub fn resume(&mut self, context: RuntimeContext, invocation_id: String) {
        self.set_context(context);
        self.invocation_id = invocation_id;
        self.invocation = Invocation::default();
        self.start_time = Instant::now();
    }

    /// Switch to the capabilities of another invocation.
    ///
    /// The WASI environment is rebuilt so it always mirrors the bindings of
    /// the current context.
    fn set_context(&mut self, context: RuntimeContext) {
        self.wasi = wasi_for(&context);
        self.context = context;
        self.logs.clear();
        self.dropped_logs = 0;
    }

    /// Take the scratch space of the call that just returned.
    pub fn finish_invocation(&mut self) -> Invocation {
        self.metrics.duration = Some(self.start_time.elapsed());
        std::mem::take(&mut self.invocation)
    }

    /// Add a log entry.
    ///
    /// Returns `false` if the entry was dropped because the call already
    /// logged [`MAX_LOG_ENTRIES`] lines.
    pub fn log(&mut self, level: LogLevel, mut message: String) -> bool {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.dropped_logs += 1;
            return false;
        }

        truncate_message(&mut message);
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
        true
    }

    /// Get elapsed time since the current call started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl std::fmt::Debug for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestState")
            .field("invocation_id", &self.invocation_id)
            .field("ready", &self.is_ready())
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

/// WASI preview1 context exposing the environment bindings of `context`.
///
/// Toolchain-produced guests read the bindings through their standard
/// library.
fn wasi_for(context: &RuntimeContext) -> WasiP1Ctx {
    let mut wasi = WasiCtxBuilder::new();
    wasi.inherit_stdout().inherit_stderr();
    for (key, value) in context.env().iter() {
        wasi.env(key, value);
    }
    wasi.build_p1()
}

/// Cut `message` to at most [`MAX_LOG_MESSAGE_BYTES`] on a character boundary.
pub fn truncate_message(message: &mut String) {
    if message.len() <= MAX_LOG_MESSAGE_BYTES {
        return;
    }
    let mut end = MAX_LOG_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

/// Create a new Wasmtime store for one guest instance.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    state: GuestState,
) -> Result<Store<GuestState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);
    refill(&mut store, engine, config.fuel_budget(), config.timeout())?;
    Ok(store)
}

/// Reset fuel and the epoch deadline before a guest call.
///
/// Fuel is always consumed by the engine, so a store without metering gets
/// an unlimited budget rather than none.
pub fn refill(
    store: &mut Store<GuestState>,
    engine: &WasmEngine,
    fuel: u64,
    deadline: Duration,
) -> Result<(), RuntimeError> {
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if engine.is_epoch_enabled() {
        store.set_epoch_deadline(deadline_ticks(deadline, engine.config().epoch_tick()));
    }

    Ok(())
}

/// Number of epoch ticks covering `deadline`.
pub fn deadline_ticks(deadline: Duration, tick: Duration) -> u64 {
    let ticks = deadline.as_millis() / tick.as_millis().max(1);
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<GuestState>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingChannel;
    use crate::context::{ContextBuilder, EnvBindings, ExecutionContext, HostCapabilities};
    use crate::readiness::readiness;
    use worker_bridge_common::{DeploymentTarget, EngineConfig};

    fn context(channel: BindingChannel) -> RuntimeContext {
        ContextBuilder::new(DeploymentTarget::Cloudflare, HostCapabilities::default()).build(
            [("GREETING", "hello")].into_iter().collect::<EnvBindings>(),
            ExecutionContext::new(),
            channel,
        )
    }

    fn state(channel: BindingChannel) -> GuestState {
        let (signal, _waiter) = readiness();
        GuestState::new(context(channel), signal, "inv-1".into(), 64 << 20)
    }

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_guest_state_creation() {
        let state = state(BindingChannel::new());

        assert_eq!(state.invocation_id, "inv-1");
        assert!(state.logs.is_empty());
        assert!(!state.is_ready());
        assert_eq!(state.context().env().get("GREETING"), Some("hello"));
    }

    #[test]
    fn test_signal_ready_seals_once() {
        let channel = BindingChannel::new();
        channel.register(EventKind::Fetch, "on_fetch").unwrap();
        let mut state = state(channel.clone());

        assert!(state.signal_ready());
        assert!(!state.signal_ready());
        assert!(channel.is_sealed());

        let bindings = state.take_bindings().unwrap();
        assert_eq!(bindings.handler(EventKind::Fetch).unwrap().export(), "on_fetch");
        assert!(state.take_bindings().is_none());
    }

    #[test]
    fn test_begin_invocation_resets_scratch() {
        let mut state = state(BindingChannel::new());
        state.invocation.failure = Some("old".into());
        state.invocation.deferred.push("flush".into());
        state.log(LogLevel::Info, "old log".into());
        state.outbox.insert(EmailMessage {
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            raw: String::new(),
        });

        state.begin_invocation(
            context(BindingChannel::new()),
            "inv-2".into(),
            EventKind::Scheduled,
            None,
        );

        assert_eq!(state.invocation_id, "inv-2");
        assert_eq!(state.invocation.kind, Some(EventKind::Scheduled));
        assert!(state.invocation.failure.is_none());
        assert!(state.invocation.deferred.is_empty());
        assert!(state.logs.is_empty());
        assert!(state.outbox.is_empty());
    }

    #[test]
    fn test_resume_switches_context() {
        let mut state = state(BindingChannel::new());
        state.log(LogLevel::Info, "handler log".into());

        let next = ContextBuilder::new(DeploymentTarget::Cloudflare, HostCapabilities::default())
            .build(
                [("GREETING", "bye")].into_iter().collect::<EnvBindings>(),
                ExecutionContext::new(),
                BindingChannel::new(),
            );
        state.resume(next, "inv-2".into());

        assert_eq!(state.context().env().get("GREETING"), Some("bye"));
        assert!(state.logs.is_empty());
        assert!(state.invocation.kind.is_none());
    }

    #[test]
    fn test_log_entries_capped() {
        let mut state = state(BindingChannel::new());

        for i in 0..MAX_LOG_ENTRIES {
            assert!(state.log(LogLevel::Debug, format!("line {i}")));
        }
        assert!(!state.log(LogLevel::Error, "one too many".into()));
        assert!(!state.log(LogLevel::Error, "and another".into()));

        assert_eq!(state.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(state.dropped_logs, 2);

        state.begin_invocation(
            context(BindingChannel::new()),
            "inv-2".into(),
            EventKind::Fetch,
            None,
        );
        assert!(state.logs.is_empty());
        assert_eq!(state.dropped_logs, 0);
    }

    #[test]
    fn test_log_message_truncated() {
        let mut state = state(BindingChannel::new());

        state.log(LogLevel::Info, "x".repeat(MAX_LOG_MESSAGE_BYTES + 100));
        assert_eq!(state.logs[0].message.len(), MAX_LOG_MESSAGE_BYTES);

        // A multi-byte character straddling the limit is dropped whole
        let mut message = "a".repeat(MAX_LOG_MESSAGE_BYTES - 1);
        message.push('é');
        truncate_message(&mut message);
        assert_eq!(message.len(), MAX_LOG_MESSAGE_BYTES - 1);
    }

    #[test]
    fn test_finish_invocation_takes_scratch() {
        let mut state = state(BindingChannel::new());
        state.invocation.response.status = 201;

        let done = state.finish_invocation();
        assert_eq!(done.response.status, 201);
        assert_eq!(state.invocation.response.status, 200);
        assert!(state.metrics.duration.is_some());
    }

    #[test]
    fn test_handle_table() {
        let mut table = HandleTable::new();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.remove(a), Some("a"));
        assert!(table.get_mut(a).is_none());
        assert_eq!(table.insert("c"), Some(3));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_deadline_ticks() {
        let tick = Duration::from_millis(1);
        assert_eq!(deadline_ticks(Duration::from_secs(5), tick), 5_000);
        assert_eq!(deadline_ticks(Duration::from_millis(10), Duration::from_millis(4)), 2);
        assert_eq!(deadline_ticks(Duration::ZERO, tick), 1);
    }

    #[test]
    fn test_store_fuel() {
        let engine = engine();
        let exec_config = ExecutionConfig {
            max_fuel: 1000,
            fuel_metering: true,
            ..Default::default()
        };

        let store = create_store(&engine, &exec_config, state(BindingChannel::new())).unwrap();
        assert_eq!(get_remaining_fuel(&store), Some(1000));
    }

    #[test]
    fn test_store_unmetered_fuel() {
        let engine = engine();
        let exec_config = ExecutionConfig {
            fuel_metering: false,
            ..Default::default()
        };

        let store = create_store(&engine, &exec_config, state(BindingChannel::new())).unwrap();
        assert_eq!(get_remaining_fuel(&store), Some(u64::MAX));
        assert_eq!(calculate_fuel_consumed(u64::MAX, &store), 0);
    }
}
