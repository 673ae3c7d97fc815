//! Thread-safe FIFO used as the scheduler's ready queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Blocking FIFO. `push` wakes one waiting `pop`.
#[derive(Debug, Default)]
pub struct ReadyQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> ReadyQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append an item to the tail.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        self.available.notify_one();
    }

    /// Block until an item is available, then take the head.
    #[must_use]
    pub fn pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .available
                .wait(items)
                .expect("ready queue lock poisoned");
        }
    }

    /// Take the head without blocking.
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().expect("ready queue lock poisoned")
    }
}
