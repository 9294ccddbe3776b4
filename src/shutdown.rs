//! Cancellation shared by the initial load, the refresh thread and the embedding application.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// A cloneable, one-shot shutdown signal.
///
/// Cancelling wakes every thread blocked in [`ShutdownSignal::wait_timeout`]. Once cancelled, the
/// signal stays cancelled.
///
/// ```
/// # use decider::ShutdownSignal;
/// # use std::time::Duration;
/// let signal = ShutdownSignal::new();
/// let remote = signal.clone();
/// std::thread::spawn(move || remote.cancel());
/// while !signal.wait_timeout(Duration::from_millis(10)) {}
/// assert!(signal.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    /// Create a new, not yet cancelled signal.
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    /// Cancel the signal, waking up all waiters.
    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.inner;
        *cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        condvar.notify_all();
    }

    /// Return `true` if the signal has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block for up to `timeout` or until the signal is cancelled.
    ///
    /// Returns `true` if the signal is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, condvar) = &*self.inner;
        let guard = cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}
