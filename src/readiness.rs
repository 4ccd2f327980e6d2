//! One-shot readiness signals
//!
//! A service owns the [`ReadinessNotifier`] and fires it exactly once: either ready,
//! or failed with the reason it could not get there. The orchestrator and any
//! observer hold a [`ReadinessWaiter`]. The first transition out of `Pending` is
//! final; later calls are ignored.

use std::fmt;

use tokio::sync::watch;

use crate::{Error, Result};

/// Current state of a readiness signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// Not fired yet
    Pending,
    /// The service is serving and safe to depend on
    Ready,
    /// The service stopped before becoming ready
    Failed(String),
}

impl ReadinessState {
    fn is_pending(&self) -> bool {
        matches!(self, ReadinessState::Pending)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Pending => f.write_str("pending"),
            ReadinessState::Ready => f.write_str("ready"),
            ReadinessState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Create a linked notifier/waiter pair in the `Pending` state
pub fn signal() -> (ReadinessNotifier, ReadinessWaiter) {
    let (tx, rx) = watch::channel(ReadinessState::Pending);
    (ReadinessNotifier { tx }, ReadinessWaiter { rx })
}

/// Write side of a readiness signal
#[derive(Debug, Clone)]
pub struct ReadinessNotifier {
    tx: watch::Sender<ReadinessState>,
}

impl ReadinessNotifier {
    fn fire(&self, next: ReadinessState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Mark the service ready; returns `false` if the signal had already fired
    pub fn ready(&self) -> bool {
        self.fire(ReadinessState::Ready)
    }

    /// Mark the service failed; returns `false` if the signal had already fired
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.fire(ReadinessState::Failed(reason.into()))
    }

    /// Whether the signal has fired either way
    pub fn has_fired(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    /// A new waiter on this signal
    pub fn subscribe(&self) -> ReadinessWaiter {
        ReadinessWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a readiness signal
#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    rx: watch::Receiver<ReadinessState>,
}

impl ReadinessWaiter {
    /// Current state without waiting
    pub fn state(&self) -> ReadinessState {
        self.rx.borrow().clone()
    }

    /// Wait until the signal fires
    ///
    /// Resolves `Ok` when ready. A failed signal, or every notifier being dropped
    /// while still pending, resolves to [`Error::Readiness`].
    pub async fn wait(&mut self) -> Result<()> {
        let state = self
            .rx
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| Error::readiness("service exited without signalling readiness"))?
            .clone();

        match state {
            ReadinessState::Ready => Ok(()),
            ReadinessState::Failed(reason) => Err(Error::readiness(reason)),
            ReadinessState::Pending => Err(Error::readiness("signal still pending")),
        }
    }
}
