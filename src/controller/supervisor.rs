//! First-invocation guard for background tasks
//!
//! Each controller starts its garbage collector lazily from the first
//! reconcile. After that the guard is only ever read.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct StartOnce {
    started: AtomicBool,
}

impl StartOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Run `start` if nothing has been started yet.
    ///
    /// Exactly one caller wins, even under concurrent invocation; the winner
    /// gets `true`. Later callers return on the read-only fast path.
    pub fn start_once<F: FnOnce()>(&self, start: F) -> bool {
        if self.is_started() {
            return false;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        start();
        true
    }
}
