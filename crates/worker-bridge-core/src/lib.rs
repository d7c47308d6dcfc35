//! Core host/guest bridge for worker-bridge.
//!
//! This crate runs a WebAssembly guest behind serverless event entry points:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator
//! - [`ModuleLoader`]: Process-wide, single-flight module cache
//! - [`ContextBuilder`]: Per-event [`RuntimeContext`] filtered by deployment target
//! - [`InstanceRunner`]: Instance start and the readiness handshake
//! - [`BindingChannel`]: Slot the guest registers its handlers in
//! - [`Bridge`]: One entry point per event kind
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Bridge (event entry points)             │
//! │  fetch / scheduled / queue / email / on_request         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ModuleLoader                        │
//! │  (Loaded once, shared by every instance)                │
//! │  - File, URL, precompiled artifact or handle, bytes     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         Store<GuestState> + Instance (per event)        │
//! │  - RuntimeContext and BindingChannel                    │
//! │  - ReadinessSignal, awaited before any handler lookup   │
//! │  - Fuel metering and epoch deadlines                    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod binding;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod instance;
pub mod loader;
pub mod module;
pub mod readiness;
pub mod store;

pub use binding::{BindingChannel, EventKind, HandlerRef, ReadyBindings, RegisterError};
pub use context::{
    ContextBuilder, EnvBindings, ExecutionContext, HostCapabilities, MailTransport,
    RuntimeContext, SocketConnector,
};
pub use dispatch::{Bridge, DispatchStage};
pub use engine::WasmEngine;
pub use event::{
    EmailEvent, EmailMessage, HttpRequest, HttpResponse, MessageBatch, PageContext, QueueMessage,
    QueueOutcome, ScheduledEvent,
};
pub use instance::{InstanceRunner, InstanceState, LiveInstance};
pub use loader::{
    BytesSource, FileSource, ModuleLoader, ModuleSource, PrecompiledFileSource, PrecompiledSource,
    UrlSource, source_from_config,
};
pub use module::CompiledModule;
pub use readiness::{NeverReady, ReadinessSignal, ReadinessWaiter, readiness};
pub use store::{
    ExecutionMetrics, GuestState, HandleTable, Invocation, LogEntry, LogLevel, MAX_LOG_ENTRIES,
    MAX_LOG_MESSAGE_BYTES, truncate_message,
};
