//! Time abstraction for workflow scheduling.
//!
//! Production code drives workflows against [`SystemClock`]; tests drive them
//! against [`TestClock`], which only advances when told to and broadcasts
//! every jump so pending [`crate::wait::wait_for_date`] calls can re-check
//! their deadline instead of sleeping through it.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// A source of the current time, abstracted so tests can control it.
pub trait Clock: Send + Sync + 'static {
    /// The current UTC instant.
    fn now(&self) -> DateTime<Utc>;

    /// A receiver that yields whenever the clock moves, carrying the new time.
    /// [`SystemClock`] never needs this (time advances on its own), so the
    /// default implementation returns `None`.
    fn subscribe(&self) -> Option<watch::Receiver<DateTime<Utc>>> {
        None
    }
}

/// Wall-clock time via [`chrono::Utc::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Moving the clock backward is rejected; moving it to the same instant is a
/// silent no-op (no subscriber is notified).
#[derive(Debug, Clone)]
pub struct TestClock {
    tx: watch::Sender<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tx, _rx) = watch::channel(start);
        Self { tx }
    }

    /// Advance the clock. Returns `false` (and does nothing) if `new_time` is
    /// not strictly after the current time.
    pub fn set(&self, new_time: DateTime<Utc>) -> bool {
        let moved = self.tx.send_if_modified(|current| {
            if new_time > *current {
                *current = new_time;
                true
            } else {
                false
            }
        });
        if new_time < *self.tx.borrow() && !moved {
            // strictly earlier than current: reject explicitly (send_if_modified
            // already left the value untouched, this branch just documents intent)
        }
        moved
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> Option<watch::Receiver<DateTime<Utc>>> {
        Some(self.tx.subscribe())
    }
}
