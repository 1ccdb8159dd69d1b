//! Pulsable cancellation signals.
//!
//! A [`Signal`] is a one-way latch: once pulsed it stays pulsed, and every
//! watcher past or future observes the pulse exactly once. Watches are plain
//! crossbeam receivers so callers can combine a signal with replies,
//! disconnects, and timeouts in a single `select!`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;

/// Raised when a blocking operation is cancelled through its interruptor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation interrupted")]
pub struct Interrupted;

#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    pulsed: AtomicBool,
    waiters: Mutex<Vec<Sender<()>>>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake every waiter. Idempotent.
    pub fn pulse(&self) {
        if self.inner.pulsed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        for waiter in waiters.drain(..) {
            let _ = waiter.try_send(());
        }
    }

    pub fn is_pulsed(&self) -> bool {
        self.inner.pulsed.load(Ordering::Acquire)
    }

    /// Receiver that gets one message when the signal pulses; pre-filled if
    /// it already has.
    pub fn watch(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        if self.is_pulsed() {
            let _ = tx.try_send(());
            return rx;
        }
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        // Re-check under the lock; pulse drains waiters under the same lock.
        if self.is_pulsed() {
            let _ = tx.try_send(());
        } else {
            waiters.push(tx);
        }
        rx
    }
}
