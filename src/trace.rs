//! Observable event trace.
//!
//! Every externally meaningful transition — submission, dispatch, sleep,
//! wake, completion, paging activity, violations — is appended here with the
//! global tick at which it happened. Tests assert ordering against this
//! trace; it can also be dumped as JSON for inspection.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::Pid;

/// One observable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObsEvent {
    /// A process entered the ready queue for the first time.
    Submitted {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
        /// Process name.
        name: String,
    },
    /// A core picked the process off the ready queue.
    Dispatched {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
        /// Core it was assigned to.
        core: usize,
    },
    /// The process used up its time slice and was requeued.
    QuantumExpired {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
        /// Core it ran on.
        core: usize,
    },
    /// The process blocked on `SLEEP`.
    Slept {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
        /// Tick at which it becomes runnable again.
        until: u64,
    },
    /// The dispatcher moved the process back to ready.
    Woken {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
    },
    /// The process reached a terminal state.
    Finished {
        /// Global tick.
        tick: u64,
        /// Process id.
        pid: Pid,
    },
    /// A translation missed and the page was brought in.
    PageFault {
        /// Global tick.
        tick: u64,
        /// Faulting process.
        pid: Pid,
        /// Faulting page number.
        page: usize,
        /// Frame the page landed in.
        frame: usize,
    },
    /// A resident page was written back and its frame reused.
    Evicted {
        /// Global tick.
        tick: u64,
        /// Owner of the evicted page.
        pid: Pid,
        /// Evicted page number.
        page: usize,
        /// Frame it was evicted from.
        frame: usize,
    },
    /// A translation failed and terminated the process.
    Violation {
        /// Global tick.
        tick: u64,
        /// Offending process.
        pid: Pid,
        /// Offending address, as shown to the user.
        addr: String,
    },
}

/// Append-only, thread-safe event log.
#[derive(Debug, Default)]
pub struct EventTrace {
    events: Mutex<Vec<ObsEvent>>,
}

impl EventTrace {
    /// Create an empty trace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn record(&self, event: ObsEvent) {
        self.lock().push(event);
    }

    /// Copy of all events so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ObsEvent> {
        self.lock().clone()
    }

    /// Number of events recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no events have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Render the trace as pretty JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&*self.lock()).unwrap_or_else(|_| "[]".to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ObsEvent>> {
        self.events.lock().expect("event trace lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_preserves_order() {
        let trace = EventTrace::new();
        trace.record(ObsEvent::Submitted {
            tick: 1,
            pid: 1,
            name: "a".to_string(),
        });
        trace.record(ObsEvent::Dispatched {
            tick: 2,
            pid: 1,
            core: 0,
        });
        let events = trace.snapshot();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ObsEvent::Submitted { pid: 1, .. }));
        assert!(matches!(events[1], ObsEvent::Dispatched { core: 0, .. }));
    }

    #[test]
    fn test_json_round_trip() {
        let trace = EventTrace::new();
        trace.record(ObsEvent::Woken { tick: 9, pid: 4 });
        let parsed: Vec<ObsEvent> = serde_json::from_str(&trace.to_json()).unwrap();
        assert_eq!(parsed, trace.snapshot());
    }
}
