//! One-shot readiness handshake.
//!
//! [`readiness`] creates a linked pair: the [`ReadinessSignal`] lives in the
//! guest's store and is triggered by the `workers.ready` import, the
//! [`ReadinessWaiter`] is held by the instance lifecycle manager while the
//! guest starts. The pair is single-use; every instance start creates a new one.

use tokio::sync::oneshot;

/// Guest-side half of the handshake.
#[derive(Debug)]
pub struct ReadinessSignal {
    tx: Option<oneshot::Sender<()>>,
    signaled: bool,
}

/// Host-side half of the handshake.
#[derive(Debug)]
pub struct ReadinessWaiter {
    rx: oneshot::Receiver<()>,
}

/// The guest stopped without signaling readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeverReady;

/// Create a fresh pending signal and its waiter.
pub fn readiness() -> (ReadinessSignal, ReadinessWaiter) {
    let (tx, rx) = oneshot::channel();
    (
        ReadinessSignal {
            tx: Some(tx),
            signaled: false,
        },
        ReadinessWaiter { rx },
    )
}

impl ReadinessSignal {
    /// Transition pending → signaled.
    ///
    /// Returns `true` on the first call only; later calls have no effect.
    pub fn signal(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The waiter may already be gone if the dispatch was abandoned
                let _ = tx.send(());
                self.signaled = true;
                true
            }
            None => false,
        }
    }

    /// Returns `true` once [`signal`](Self::signal) has succeeded.
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    /// Give up on a signal that was never sent.
    ///
    /// The waiter resolves with [`NeverReady`]. No effect after a successful signal.
    pub fn abandon(&mut self) {
        self.tx.take();
    }
}

impl ReadinessWaiter {
    /// Suspend until the guest signals, or until the signal is abandoned or dropped.
    pub async fn wait(self) -> Result<(), NeverReady> {
        self.rx.await.map_err(|_| NeverReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[test]
    fn test_wait_pends_until_signaled() {
        let (mut signal, waiter) = readiness();
        let mut wait = task::spawn(waiter.wait());

        assert_pending!(wait.poll());
        assert!(!signal.is_signaled());

        assert!(signal.signal());
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    fn test_second_signal_is_noop() {
        let (mut signal, waiter) = readiness();

        assert!(signal.signal());
        assert!(!signal.signal());
        assert!(!signal.signal());
        assert!(signal.is_signaled());

        let mut wait = task::spawn(waiter.wait());
        assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    fn test_abandon_resolves_never_ready() {
        let (mut signal, waiter) = readiness();
        let mut wait = task::spawn(waiter.wait());
        assert_pending!(wait.poll());

        signal.abandon();
        assert_ready_eq!(wait.poll(), Err(NeverReady));
        assert!(!signal.is_signaled());
    }

    #[test]
    fn test_abandon_after_signal_keeps_ready() {
        let (mut signal, waiter) = readiness();
        signal.signal();
        signal.abandon();

        let mut wait = task::spawn(waiter.wait());
        assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    fn test_dropped_signal_resolves_never_ready() {
        let (signal, waiter) = readiness();
        drop(signal);

        let mut wait = task::spawn(waiter.wait());
        let result = assert_ready!(wait.poll());
        assert_eq!(result, Err(NeverReady));
    }

    #[test]
    fn test_signal_without_waiter() {
        let (mut signal, waiter) = readiness();
        drop(waiter);
        assert!(signal.signal());
    }
}
