//! Global tick source.
//!
//! A single shared 64-bit counter advanced from two places: a background
//! timer thread at a short cadence, and every executed instruction (one tick
//! per instruction). The timer keeps timeouts moving while all cores are
//! idle; instruction execution accounts for busy time. No wall-clock time
//! enters scheduling decisions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Cheaply cloneable handle to the global tick counter.
#[derive(Debug, Clone, Default)]
pub struct TickSource {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ticks: AtomicU64,
    running: AtomicBool,
    started: AtomicBool,
}

impl TickSource {
    /// Create a tick source at tick 0 with no timer thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the background timer thread. Idempotent.
    ///
    /// The thread is detached; [`TickSource::stop`] asks it to exit at the
    /// next iteration but never joins it.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            while inner.running.load(Ordering::Relaxed) {
                inner.ticks.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_micros(1));
            }
        });
    }

    /// Ask the timer thread to exit.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Current tick.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Advance the counter by `n` ticks (one per executed instruction).
    pub fn advance(&self, n: u64) {
        self.inner.ticks.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_visible() {
        let clock = TickSource::new();
        assert_eq!(clock.now(), 0);
        clock.advance(3);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn test_timer_thread_advances() {
        let clock = TickSource::new();
        clock.start();
        let before = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > before);
        clock.stop();
    }
}
