//! Process-wide stop signal.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    changed: Condvar,
}

/// Cloneable flag that ends every ingestion loop sharing it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake everything waiting on it.
    pub fn stop(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.changed.notify_all();
    }

    /// Whether the signal fired.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`, returning early once the signal fires.
    ///
    /// Returns whether the signal has fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if !self.is_stopped() {
            self.inner.changed.wait_for(&mut guard, timeout);
        }
        self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_stop_wakes_waiter() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(1)));

        let waiter = {
            let stop = stop.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let fired = stop.wait_timeout(Duration::from_secs(10));
                (fired, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        stop.stop();

        let (fired, waited) = waiter.join().unwrap();
        assert!(fired);
        assert!(waited < Duration::from_secs(5));
        assert!(stop.is_stopped());
    }
}
