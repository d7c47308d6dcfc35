//! Error types for the worker bridge.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`BridgeError`]: Top-level error for one dispatched event
//! - [`LoadError`], [`StartError`], [`DispatchError`], [`HandlerError`]:
//!   one enum per stage that can fail a dispatch
//! - [`RuntimeError`]: Engine and linker configuration errors
//! - [`HostFunctionError`]: Errors from host capability implementations

use std::io;

use thiserror::Error;

/// Failure of a single dispatched event.
///
/// Every stage of a dispatch maps to exactly one variant, so hosts can tell
/// "handler threw" apart from "handler never ran".
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The module could not be acquired or compiled.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The guest instance could not be started.
    #[error(transparent)]
    Start(#[from] StartError),

    /// The guest never registered a usable handler for the event.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The guest handler ran and failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl BridgeError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Start(_) => "start",
            Self::Dispatch(_) => "dispatch",
            Self::Handler(_) => "handler",
        }
    }

    /// Returns `true` if a later event may succeed without any change to the guest.
    ///
    /// Only module acquisition is worth retrying: the cache is never poisoned
    /// by a failed load.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Load(_))
    }
}

/// Module acquisition or compilation failed.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The module could not be fetched over the network.
    #[error("Failed to fetch module from {url}: {reason}")]
    Fetch {
        /// Source URL.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// The module file could not be read.
    #[error("Failed to read module from '{path}': {source}")]
    Io {
        /// Path of the module file.
        path: String,
        #[source]
        source: io::Error,
    },

    /// The bytes are not a valid module.
    #[error("Invalid module: {reason}")]
    Invalid {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module cannot run on this deployment target.
    #[error("Unsupported module: {reason}")]
    Unsupported {
        /// Why the module was rejected.
        reason: String,
    },
}

impl LoadError {
    /// Create a new `Invalid` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Create a new `Fetch` error.
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Instantiation failed, or the guest never became ready.
#[derive(Error, Debug)]
pub enum StartError {
    /// The import table could not satisfy the module, or instantiation trapped.
    #[error("Instantiation failed: {reason}")]
    Instantiate {
        /// Description of the failure.
        reason: String,
    },

    /// The entry point export is missing and the guest did not signal readiness.
    #[error("Entry point '{name}' not found")]
    MissingEntryPoint {
        /// Name of the expected export.
        name: String,
    },

    /// The guest returned or exited without calling `ready`.
    #[error("Guest exited before ready{}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    ExitedBeforeReady {
        /// WASI exit code, if the guest exited through `proc_exit`.
        exit_code: Option<i32>,
    },

    /// The guest trapped during startup.
    #[error("Guest trapped during startup: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The guest ran out of fuel during startup.
    #[error("Fuel exhausted during startup")]
    FuelExhausted,

    /// The guest did not become ready within the configured bound.
    #[error("Guest not ready after {duration_ms}ms")]
    ReadyTimeout {
        /// The bound in milliseconds.
        duration_ms: u64,
    },

    /// The guest signaled readiness without registering a single handler.
    #[error("Guest signaled ready without registering any handler")]
    NoHandlers,
}

impl StartError {
    /// Create a new `Instantiate` error.
    pub fn instantiate(reason: impl Into<String>) -> Self {
        Self::Instantiate {
            reason: reason.into(),
        }
    }
}

/// The binding channel cannot serve the requested event kind.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The guest did not register a handler for this event kind.
    #[error("Handler not registered: {kind}")]
    HandlerNotRegistered {
        /// Event kind that was dispatched.
        kind: String,
    },

    /// The registered export does not exist or has the wrong signature.
    #[error("Handler '{export}' for {kind} is unusable: {reason}")]
    InvalidHandler {
        /// Event kind that was dispatched.
        kind: String,
        /// Export name the guest registered.
        export: String,
        /// Why the export could not be used.
        reason: String,
    },

    /// The event payload could not be handed to the guest.
    #[error("Failed to pass payload to guest: {reason}")]
    Payload {
        /// Description of the failure.
        reason: String,
    },
}

impl DispatchError {
    /// Create a new `HandlerNotRegistered` error.
    pub fn not_registered(kind: impl Into<String>) -> Self {
        Self::HandlerNotRegistered { kind: kind.into() }
    }

    /// Create a new `Payload` error.
    pub fn payload(reason: impl Into<String>) -> Self {
        Self::Payload {
            reason: reason.into(),
        }
    }
}

/// The guest handler ran and reported failure.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned a non-zero status.
    #[error("{kind} handler failed with status {code}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Failed {
        /// Event kind that was dispatched.
        kind: String,
        /// Status returned by the handler.
        code: i32,
        /// Message attached through `workers.fail`, if any.
        message: Option<String>,
    },

    /// The handler trapped.
    #[error("{kind} handler trapped: {message}")]
    Trap {
        /// Event kind that was dispatched.
        kind: String,
        /// Description of the trap.
        message: String,
    },

    /// The handler ran out of fuel.
    #[error("{kind} handler exhausted its fuel")]
    FuelExhausted {
        /// Event kind that was dispatched.
        kind: String,
    },

    /// The handler exceeded its wall-clock budget.
    #[error("{kind} handler timed out after {duration_ms}ms")]
    Timeout {
        /// Event kind that was dispatched.
        kind: String,
        /// Budget in milliseconds.
        duration_ms: u64,
    },
}

/// Engine and linker configuration errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Errors from host capability implementations.
///
/// These never cross the ABI as-is: the import that hit them logs the error
/// and returns the matching negative status to the guest.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// The capability is not offered on the current deployment target.
    #[error("Capability unsupported on this target: {capability}")]
    Unsupported {
        /// Name of the missing capability.
        capability: &'static str,
    },

    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// Too many operations of one kind within a single invocation.
    #[error("Rate limit exceeded: {operation}")]
    RateLimitExceeded {
        /// The operation that was rate-limited.
        operation: String,
    },

    /// A network or mail operation failed.
    #[error("I/O failure during {operation}: {reason}")]
    Io {
        /// The operation that failed.
        operation: String,
        /// Description of the failure.
        reason: String,
    },
}

impl HostFunctionError {
    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `Io` error.
    pub fn io(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StartError::ExitedBeforeReady { exit_code: None };
        assert_eq!(err.to_string(), "Guest exited before ready");

        let err = StartError::ExitedBeforeReady { exit_code: Some(2) };
        assert_eq!(err.to_string(), "Guest exited before ready (exit code 2)");

        let err = DispatchError::not_registered("queue");
        assert_eq!(err.to_string(), "Handler not registered: queue");
    }

    #[test]
    fn test_handler_failure_display() {
        let err = HandlerError::Failed {
            kind: "fetch".into(),
            code: 1,
            message: Some("bad input".into()),
        };
        assert_eq!(err.to_string(), "fetch handler failed with status 1: bad input");

        let err = HandlerError::Failed {
            kind: "email".into(),
            code: 7,
            message: None,
        };
        assert_eq!(err.to_string(), "email handler failed with status 7");
    }

    #[test]
    fn test_bridge_error_from_stages() {
        let err: BridgeError = LoadError::invalid("bad magic").into();
        assert_eq!(err.stage(), "load");
        assert!(err.is_retryable());

        let err: BridgeError = StartError::NoHandlers.into();
        assert_eq!(err.stage(), "start");
        assert!(!err.is_retryable());

        let err: BridgeError = DispatchError::not_registered("email").into();
        assert_eq!(err.stage(), "dispatch");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_bridge_error_is_transparent() {
        let err: BridgeError = LoadError::fetch("https://example.com/app.wasm", "404").into();
        assert_eq!(
            err.to_string(),
            "Failed to fetch module from https://example.com/app.wasm: 404"
        );
    }
}
