//! Table-wide contention event.
//!
//! Threads that find an entry lock held park here until any unlock on the
//! table wakes them; the caller's retry loop re-examines the entry. The
//! check runs under the event mutex and wakers pass through the same mutex,
//! which closes the check-then-block window without requiring the waker to
//! know who is waiting.

use parking_lot::{Condvar, Mutex};

pub(crate) struct ContentionEvent {
    gate: Mutex<()>,
    waiters: Condvar,
}

impl ContentionEvent {
    pub(crate) const fn new() -> Self {
        ContentionEvent {
            gate: Mutex::new(()),
            waiters: Condvar::new(),
        }
    }

    /// Block until the next wake, unless `still_blocked` already reports
    /// that waiting is pointless. Spurious wakeups are allowed; callers
    /// re-check and re-enter.
    pub(crate) fn wait_if<F: FnOnce() -> bool>(&self, still_blocked: F) {
        let mut guard = self.gate.lock();
        if !still_blocked() {
            return;
        }
        self.waiters.wait(&mut guard);
    }

    /// Wake every parked thread.
    pub(crate) fn wake_all(&self) {
        // Serialize with a waiter between its check and its wait; once the
        // gate is free the waiter is parked and will see the notify.
        drop(self.gate.lock());
        self.waiters.notify_all();
    }
}
