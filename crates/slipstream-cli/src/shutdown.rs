use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Ctrl-C signal with interruptible waits.
///
/// The poll loop sleeps between reads; a plain `thread::sleep` would
/// delay patch removal by up to a full interval after Ctrl-C, and the
/// target should never stay instrumented longer than it has to.
pub struct StopSignal {
    stopped: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    /// Wake every waiting thread and latch the stop state.
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless stopped first. Returns true when the
    /// wait ended because of a stop.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let guard = match self.mutex.lock() {
            Ok(guard) => guard,
            // Poisoned lock: treat as stopped so the loop unwinds.
            Err(_) => return true,
        };
        match self
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.is_stopped())
        {
            Ok((_, timeout)) => !timeout.timed_out(),
            Err(_) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
