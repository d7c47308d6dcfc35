//! Binding channel between guest and host.
//!
//! The guest populates a [`BindingChannel`] with one export name per event
//! kind while it starts. Signaling readiness seals the channel, and sealing
//! is the only way for the host to obtain the populated record
//! ([`ReadyBindings`]). The host cannot look up a handler before the guest
//! is ready.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use worker_bridge_common::DispatchError;

/// Event kinds a guest can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// HTTP request (also used by page functions).
    Fetch,
    /// Scheduled trigger.
    Scheduled,
    /// Queue message batch.
    Queue,
    /// Incoming email.
    Email,
}

impl EventKind {
    /// All kinds, in ABI order.
    pub const ALL: [EventKind; 4] = [Self::Fetch, Self::Scheduled, Self::Queue, Self::Email];

    /// Decode the `kind` argument of `workers.register_handler`.
    pub fn from_abi(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Fetch),
            1 => Some(Self::Scheduled),
            2 => Some(Self::Queue),
            3 => Some(Self::Email),
            _ => None,
        }
    }

    /// Encode for the guest ABI.
    pub fn to_abi(self) -> i32 {
        match self {
            Self::Fetch => 0,
            Self::Scheduled => 1,
            Self::Queue => 2,
            Self::Email => 3,
        }
    }

    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Scheduled => "scheduled",
            Self::Queue => "queue",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler registered by the guest: the name of an export with the
/// signature `(ptr: i32, len: i32) -> i32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRef {
    export: String,
}

impl HandlerRef {
    /// Name of the guest export.
    pub fn export(&self) -> &str {
        &self.export
    }
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Readiness was already signaled.
    Sealed,
    /// A handler for this kind is already registered.
    Duplicate(EventKind),
    /// The export name is empty.
    EmptyName,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sealed => f.write_str("binding channel is sealed"),
            Self::Duplicate(kind) => write!(f, "{kind} handler already registered"),
            Self::EmptyName => f.write_str("handler export name is empty"),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    fetch: Option<HandlerRef>,
    scheduled: Option<HandlerRef>,
    queue: Option<HandlerRef>,
    email: Option<HandlerRef>,
    sealed: bool,
}

impl Slot {
    fn field(&mut self, kind: EventKind) -> &mut Option<HandlerRef> {
        match kind {
            EventKind::Fetch => &mut self.fetch,
            EventKind::Scheduled => &mut self.scheduled,
            EventKind::Queue => &mut self.queue,
            EventKind::Email => &mut self.email,
        }
    }
}

/// Shared, initially empty slot the guest writes its handlers into.
///
/// Cloning yields another handle to the same slot.
#[derive(Debug, Clone, Default)]
pub struct BindingChannel {
    slot: Arc<Mutex<Slot>>,
}

impl BindingChannel {
    /// Create an empty, unsealed channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel that is sealed from the start.
    ///
    /// Handed to invocations on an instance that is already ready, so late
    /// registrations are rejected.
    pub fn sealed() -> Self {
        let channel = Self::new();
        channel.slot.lock().sealed = true;
        channel
    }

    /// Record the export handling `kind`.
    ///
    /// Each kind may be written once, and only before the channel is sealed.
    pub fn register(&self, kind: EventKind, export: impl Into<String>) -> Result<(), RegisterError> {
        let export = export.into();
        if export.is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let mut slot = self.slot.lock();
        if slot.sealed {
            return Err(RegisterError::Sealed);
        }

        let field = slot.field(kind);
        if field.is_some() {
            return Err(RegisterError::Duplicate(kind));
        }
        *field = Some(HandlerRef { export });
        Ok(())
    }

    /// Returns `true` once the channel has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.slot.lock().sealed
    }

    /// Seal the channel and take a snapshot of its contents.
    ///
    /// Called by the readiness handshake. Sealing twice returns the same snapshot.
    pub(crate) fn seal(&self) -> ReadyBindings {
        let mut slot = self.slot.lock();
        slot.sealed = true;
        ReadyBindings {
            fetch: slot.fetch.clone(),
            scheduled: slot.scheduled.clone(),
            queue: slot.queue.clone(),
            email: slot.email.clone(),
        }
    }
}

/// Sealed contents of a [`BindingChannel`], available only after readiness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyBindings {
    fetch: Option<HandlerRef>,
    scheduled: Option<HandlerRef>,
    queue: Option<HandlerRef>,
    email: Option<HandlerRef>,
}

impl ReadyBindings {
    /// Look up the handler for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::HandlerNotRegistered`] if the guest did not
    /// register one.
    pub fn handler(&self, kind: EventKind) -> Result<&HandlerRef, DispatchError> {
        let field = match kind {
            EventKind::Fetch => &self.fetch,
            EventKind::Scheduled => &self.scheduled,
            EventKind::Queue => &self.queue,
            EventKind::Email => &self.email,
        };
        field
            .as_ref()
            .ok_or_else(|| DispatchError::not_registered(kind.as_str()))
    }

    /// Event kinds the guest can handle.
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.handler(*kind).is_ok())
            .collect()
    }

    /// Returns `true` if no handler was registered at all.
    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_abi_codes() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_abi(kind.to_abi()), Some(kind));
        }
        assert_eq!(EventKind::from_abi(4), None);
        assert_eq!(EventKind::from_abi(-1), None);
    }

    #[test]
    fn test_register_and_seal() {
        let channel = BindingChannel::new();
        channel.register(EventKind::Fetch, "handle_request").unwrap();
        channel.register(EventKind::Queue, "handle_batch").unwrap();

        let bindings = channel.seal();
        assert!(channel.is_sealed());
        assert_eq!(
            bindings.handler(EventKind::Fetch).unwrap().export(),
            "handle_request"
        );
        assert_eq!(bindings.kinds(), vec![EventKind::Fetch, EventKind::Queue]);
    }

    #[test]
    fn test_missing_handler() {
        let channel = BindingChannel::new();
        channel.register(EventKind::Fetch, "handle_request").unwrap();
        let bindings = channel.seal();

        let err = bindings.handler(EventKind::Email).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotRegistered { kind } if kind == "email"));
    }

    #[test]
    fn test_register_after_seal_rejected() {
        let channel = BindingChannel::new();
        channel.register(EventKind::Fetch, "a").unwrap();
        let before = channel.seal();

        assert_eq!(
            channel.register(EventKind::Scheduled, "late"),
            Err(RegisterError::Sealed)
        );
        assert_eq!(channel.seal(), before);
    }

    #[test]
    fn test_sealed_channel_rejects_everything() {
        let channel = BindingChannel::sealed();

        assert!(channel.is_sealed());
        assert_eq!(
            channel.register(EventKind::Fetch, "on_fetch"),
            Err(RegisterError::Sealed)
        );
        assert!(channel.seal().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let channel = BindingChannel::new();
        channel.register(EventKind::Fetch, "first").unwrap();

        assert_eq!(
            channel.register(EventKind::Fetch, "second"),
            Err(RegisterError::Duplicate(EventKind::Fetch))
        );
        assert_eq!(
            channel.seal().handler(EventKind::Fetch).unwrap().export(),
            "first"
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let channel = BindingChannel::new();
        assert_eq!(
            channel.register(EventKind::Email, ""),
            Err(RegisterError::EmptyName)
        );
        assert!(channel.seal().is_empty());
    }

    #[test]
    fn test_clones_share_slot() {
        let channel = BindingChannel::new();
        let guest_side = channel.clone();
        guest_side.register(EventKind::Scheduled, "cron").unwrap();

        assert!(channel.seal().handler(EventKind::Scheduled).is_ok());
        assert!(guest_side.is_sealed());
    }
}
