//! A CPU core: runs one assigned process on a worker thread for up to a
//! quantum of instructions, then hands it back to the scheduler.
//!
//! The first-ever assignment of a process is the lazy-admission point: memory
//! is allocated and, if the process arrived without a program, one is
//! generated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::clock::TickSource;
use crate::instr::generate_program;
use crate::manager::MemoryManager;
use crate::process::Process;
use crate::rng::SimRng;
use crate::scheduler::Scheduler;
use crate::trace::{EventTrace, ObsEvent};

/// Shared handles every core worker needs.
#[derive(Debug)]
pub(crate) struct CoreContext {
    pub clock: TickSource,
    pub manager: Arc<MemoryManager>,
    pub rng: Arc<Mutex<SimRng>>,
    pub trace: Arc<EventTrace>,
    pub min_ins: u64,
    pub max_ins: u64,
    pub delay_per_exec: u64,
}

/// One emulated CPU core.
#[derive(Debug)]
pub struct Core {
    id: usize,
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<Arc<Process>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<CoreContext>,
    scheduler: Weak<Scheduler>,
}

impl Core {
    pub(crate) fn new(id: usize, ctx: Arc<CoreContext>, scheduler: Weak<Scheduler>) -> Self {
        Self {
            id,
            busy: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            ctx,
            scheduler,
        }
    }

    /// Core index.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether a process is currently assigned.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// The process running here, if the core is busy.
    #[must_use]
    pub fn running_process(&self) -> Option<Arc<Process>> {
        if !self.is_busy() {
            return None;
        }
        self.current.lock().expect("core slot lock poisoned").clone()
    }

    /// Assign `process` for up to `quantum` instructions. Returns false if
    /// the core was already busy.
    pub fn try_assign(&self, process: Arc<Process>, quantum: u64) -> bool {
        if self.busy.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The previous worker has exited (busy was false); reclaim it.
        if let Some(handle) = self.worker.lock().expect("core worker lock poisoned").take() {
            let _ = handle.join();
        }

        process.set_last_core(self.id);
        *self.current.lock().expect("core slot lock poisoned") = Some(Arc::clone(&process));

        let id = self.id;
        let busy = Arc::clone(&self.busy);
        let current = Arc::clone(&self.current);
        let ctx = Arc::clone(&self.ctx);
        let scheduler = self.scheduler.clone();
        let handle = thread::spawn(move || {
            run_quantum(id, &process, quantum, &busy, &ctx, &scheduler);
            *current.lock().expect("core slot lock poisoned") = None;
            busy.store(false, Ordering::SeqCst);
        });
        *self.worker.lock().expect("core worker lock poisoned") = Some(handle);
        true
    }

    /// Ask the worker to stop at the next step boundary.
    pub fn stop(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Join the worker thread, if one ever ran.
    pub fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().expect("core worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn run_quantum(
    id: usize,
    process: &Arc<Process>,
    quantum: u64,
    busy: &Arc<AtomicBool>,
    ctx: &Arc<CoreContext>,
    scheduler: &Weak<Scheduler>,
) {
    let Some(sched) = scheduler.upgrade() else {
        return;
    };

    if process.first_schedule() {
        ctx.manager
            .allocate_memory(process, process.allocated_bytes());
        if process.instruction_count() == 0 {
            let program = {
                let mut rng = ctx.rng.lock().expect("rng lock poisoned");
                generate_program(&mut rng, ctx.min_ins, ctx.max_ins, process.name())
            };
            process.install_program(program);
        }
    }

    let mut executed = 0u64;
    while busy.load(Ordering::SeqCst)
        && sched.is_running()
        && !process.is_finished()
        && !process.is_sleeping()
        && executed < quantum
    {
        match process.run_one(id) {
            Ok(true) => {
                ctx.clock.advance(1);
                sched.record_busy_tick(id);
                executed += 1;
                apply_delay(ctx, busy);
            }
            Ok(false) => break,
            Err(err) => {
                warn!(pid = process.pid(), core = id, %err, "quantum aborted");
                break;
            }
        }
    }

    // Exactly one hand-back per quantum: terminal beats sleeping beats
    // quantum expiry.
    if process.is_finished() {
        sched.reap_finished(process);
    } else if process.is_sleeping() {
        sched.park_sleeping(Arc::clone(process));
    } else if executed >= quantum {
        ctx.trace.record(ObsEvent::QuantumExpired {
            tick: ctx.clock.now(),
            pid: process.pid(),
            core: id,
        });
        sched.requeue_ready(Arc::clone(process));
    }
}

/// Per-instruction pacing: a fixed short sleep when no delay is configured,
/// otherwise a busy-wait until the global tick has advanced far enough.
fn apply_delay(ctx: &Arc<CoreContext>, busy: &Arc<AtomicBool>) {
    if ctx.delay_per_exec == 0 {
        thread::sleep(Duration::from_millis(1));
        return;
    }
    let target = ctx.clock.now() + ctx.delay_per_exec;
    while ctx.clock.now() < target && busy.load(Ordering::Relaxed) {
        thread::yield_now();
    }
}
