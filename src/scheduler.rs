//! The scheduler: ready queue, sleeping set, finished set, dispatcher, and
//! the optional auto-generator.
//!
//! A dispatcher thread wakes due sleepers, hands ready processes to idle
//! cores round-robin, reaps terminated processes (idempotently, by pid), and
//! writes the periodic memory snapshot. The auto-generator, when enabled,
//! submits a fresh randomly-sized process every `batch-process-freq` ticks.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::TickSource;
use crate::core::{Core, CoreContext};
use crate::manager::MemoryManager;
use crate::process::Process;
use crate::queue::ReadyQueue;
use crate::rng::SimRng;
use crate::trace::{EventTrace, ObsEvent};
use crate::Pid;

/// How long the dispatcher and generator sleep between iterations.
const LOOP_INTERVAL: Duration = Duration::from_millis(5);

/// Scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// First come, first served: a dispatched process keeps its core until it
    /// finishes or sleeps.
    Fcfs,
    /// Round-robin with a fixed quantum; preemption only at quantum
    /// boundaries, never mid-instruction.
    Rr,
}

impl FromStr for SchedPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcfs" => Ok(Self::Fcfs),
            "rr" => Ok(Self::Rr),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fcfs => write!(f, "fcfs"),
            Self::Rr => write!(f, "rr"),
        }
    }
}

/// Scheduler tuning, lifted from the configuration.
#[derive(Debug, Clone)]
pub struct SchedParams {
    /// Number of cores.
    pub num_cpu: usize,
    /// Scheduling policy.
    pub policy: SchedPolicy,
    /// Round-robin quantum; also the snapshot period in ticks.
    pub quantum_cycles: u64,
    /// Auto-generator period in ticks.
    pub batch_process_freq: u64,
    /// Minimum generated program length.
    pub min_ins: u64,
    /// Maximum generated program length.
    pub max_ins: u64,
    /// Per-instruction delay in ticks.
    pub delay_per_exec: u64,
}

#[derive(Debug, Default)]
struct FinishedSet {
    list: Vec<Arc<Process>>,
    pids: HashSet<Pid>,
}

/// The scheduler.
#[derive(Debug)]
pub struct Scheduler {
    params: SchedParams,
    cores: Vec<Core>,
    ready: ReadyQueue<Arc<Process>>,
    sleeping: Mutex<Vec<Arc<Process>>>,
    finished: Mutex<FinishedSet>,
    /// Every process ever submitted, in submission order.
    directory: Mutex<Vec<Arc<Process>>>,
    running: AtomicBool,
    gen_enabled: AtomicBool,
    next_pid: AtomicU64,
    /// Submitted but not yet reaped.
    active: AtomicU64,
    busy_ticks: Vec<AtomicU64>,
    next_core: AtomicUsize,
    last_snapshot: AtomicU64,
    ctx: Arc<CoreContext>,
    manager: Arc<MemoryManager>,
    clock: TickSource,
    trace: Arc<EventTrace>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the scheduler and its cores. Threads start with
    /// [`Scheduler::start`].
    #[must_use]
    pub fn new(
        params: SchedParams,
        manager: Arc<MemoryManager>,
        clock: TickSource,
        rng: Arc<Mutex<SimRng>>,
        trace: Arc<EventTrace>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let ctx = Arc::new(CoreContext {
                clock: clock.clone(),
                manager: Arc::clone(&manager),
                rng,
                trace: Arc::clone(&trace),
                min_ins: params.min_ins,
                max_ins: params.max_ins,
                delay_per_exec: params.delay_per_exec,
            });
            let cores = (0..params.num_cpu)
                .map(|id| Core::new(id, Arc::clone(&ctx), weak.clone()))
                .collect();
            let busy_ticks = (0..params.num_cpu).map(|_| AtomicU64::new(0)).collect();
            Self {
                params,
                cores,
                ready: ReadyQueue::new(),
                sleeping: Mutex::new(Vec::new()),
                finished: Mutex::new(FinishedSet::default()),
                directory: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                gen_enabled: AtomicBool::new(false),
                next_pid: AtomicU64::new(1),
                active: AtomicU64::new(0),
                busy_ticks,
                next_core: AtomicUsize::new(0),
                last_snapshot: AtomicU64::new(0),
                ctx,
                manager,
                clock,
                trace,
                dispatcher: Mutex::new(None),
                generator: Mutex::new(None),
            }
        })
    }

    /// Start the dispatcher thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || this.dispatcher_loop());
        *self.dispatcher.lock().expect("dispatcher lock poisoned") = Some(handle);
        info!(cores = self.params.num_cpu, policy = %self.params.policy, "scheduler started");
    }

    /// Stop everything: dispatcher, generator, and core workers.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.gen_enabled.store(false, Ordering::SeqCst);
        for core in &self.cores {
            core.stop();
        }
        if let Some(handle) = self.dispatcher.lock().expect("dispatcher lock poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.generator.lock().expect("generator lock poisoned").take() {
            let _ = handle.join();
        }
        for core in &self.cores {
            core.join_worker();
        }
        info!("scheduler stopped");
    }

    /// Whether the dispatcher is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enable the auto-generator. Idempotent.
    pub fn start_generation(self: &Arc<Self>) {
        if self.gen_enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || this.generator_loop());
        *self.generator.lock().expect("generator lock poisoned") = Some(handle);
        info!("process generation enabled");
    }

    /// Disable the auto-generator.
    pub fn stop_generation(&self) {
        self.gen_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.generator.lock().expect("generator lock poisoned").take() {
            let _ = handle.join();
        }
        info!("process generation disabled");
    }

    /// Whether the auto-generator is enabled.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.gen_enabled.load(Ordering::SeqCst)
    }

    /// Claim the next pid.
    #[must_use]
    pub fn next_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    /// Create a process bound to this scheduler's memory manager and clock.
    #[must_use]
    pub fn create_process(&self, name: impl Into<String>, allocated_bytes: usize) -> Arc<Process> {
        Process::new(
            self.next_pid(),
            name,
            allocated_bytes,
            Arc::clone(&self.manager),
            self.clock.clone(),
        )
    }

    /// Submit a process to the ready queue.
    pub fn submit(&self, process: Arc<Process>) {
        self.directory
            .lock()
            .expect("directory lock poisoned")
            .push(Arc::clone(&process));
        self.active.fetch_add(1, Ordering::SeqCst);
        self.trace.record(ObsEvent::Submitted {
            tick: self.clock.now(),
            pid: process.pid(),
            name: process.name().to_string(),
        });
        debug!(pid = process.pid(), name = process.name(), "process submitted");
        self.ready.push(process);
    }

    /// Put a process back at the tail of the ready queue (quantum expiry).
    pub(crate) fn requeue_ready(&self, process: Arc<Process>) {
        self.ready.push(process);
    }

    /// Park a process in the sleeping set.
    pub(crate) fn park_sleeping(&self, process: Arc<Process>) {
        self.trace.record(ObsEvent::Slept {
            tick: self.clock.now(),
            pid: process.pid(),
            until: process.sleep_target(),
        });
        self.sleeping
            .lock()
            .expect("sleeping set lock poisoned")
            .push(process);
    }

    /// Move a terminated process to the finished set. Idempotent per pid;
    /// the first call releases its memory.
    pub(crate) fn reap_finished(&self, process: &Arc<Process>) {
        let mut finished = self.finished.lock().expect("finished set lock poisoned");
        if !finished.pids.insert(process.pid()) {
            return;
        }
        process.set_finish_time(SystemTime::now());
        self.manager.deallocate(process.pid());
        finished.list.push(Arc::clone(process));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.trace.record(ObsEvent::Finished {
            tick: self.clock.now(),
            pid: process.pid(),
        });
        info!(pid = process.pid(), name = process.name(), "process finished");
    }

    /// Account one busy tick against a core.
    pub(crate) fn record_busy_tick(&self, core: usize) {
        if let Some(ticks) = self.busy_ticks.get(core) {
            ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Block until no submitted process remains unreaped.
    pub fn wait_until_all_done(&self) {
        while self.active.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Processes currently running on cores.
    #[must_use]
    pub fn running_processes(&self) -> Vec<Arc<Process>> {
        self.cores.iter().filter_map(Core::running_process).collect()
    }

    /// Processes in the sleeping set.
    #[must_use]
    pub fn sleeping_processes(&self) -> Vec<Arc<Process>> {
        self.sleeping
            .lock()
            .expect("sleeping set lock poisoned")
            .clone()
    }

    /// Reaped processes, in completion order.
    #[must_use]
    pub fn finished_processes(&self) -> Vec<Arc<Process>> {
        self.finished
            .lock()
            .expect("finished set lock poisoned")
            .list
            .clone()
    }

    /// Every submitted process, in submission order.
    #[must_use]
    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        self.directory.lock().expect("directory lock poisoned").clone()
    }

    /// Find any process by name (latest submission wins).
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Process>> {
        self.directory
            .lock()
            .expect("directory lock poisoned")
            .iter()
            .rev()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Find a non-terminated process by name.
    #[must_use]
    pub fn find_active_by_name(&self, name: &str) -> Option<Arc<Process>> {
        self.directory
            .lock()
            .expect("directory lock poisoned")
            .iter()
            .rev()
            .find(|p| p.name() == name && !p.is_finished())
            .cloned()
    }

    /// Find any process by pid.
    #[must_use]
    pub fn find_by_pid(&self, pid: Pid) -> Option<Arc<Process>> {
        self.directory
            .lock()
            .expect("directory lock poisoned")
            .iter()
            .find(|p| p.pid() == pid)
            .cloned()
    }

    /// Number of cores.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Cores with a process assigned.
    #[must_use]
    pub fn cores_used(&self) -> usize {
        self.cores.iter().filter(|c| c.is_busy()).count()
    }

    /// Idle cores.
    #[must_use]
    pub fn cores_available(&self) -> usize {
        self.core_count() - self.cores_used()
    }

    /// Percentage of cores in use.
    #[must_use]
    pub fn cpu_utilization(&self) -> f64 {
        if self.cores.is_empty() {
            return 0.0;
        }
        self.cores_used() as f64 / self.core_count() as f64 * 100.0
    }

    /// Busy ticks accumulated across all cores.
    #[must_use]
    pub fn active_ticks(&self) -> u64 {
        self.busy_ticks
            .iter()
            .map(|t| t.load(Ordering::Relaxed))
            .sum()
    }

    /// Scheduler tuning parameters.
    #[must_use]
    pub fn params(&self) -> &SchedParams {
        &self.params
    }

    fn dispatcher_loop(self: Arc<Self>) {
        while self.is_running() {
            self.wake_sleepers();
            self.dispatch();
            self.reap_cores();
            self.periodic_snapshot();
            thread::sleep(LOOP_INTERVAL);
        }
    }

    fn wake_sleepers(&self) {
        let now = self.clock.now();
        let mut woken = Vec::new();
        {
            let mut sleeping = self.sleeping.lock().expect("sleeping set lock poisoned");
            let mut i = 0;
            while i < sleeping.len() {
                if sleeping[i].sleep_target() <= now {
                    woken.push(sleeping.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for process in woken {
            process.clear_sleeping();
            self.trace.record(ObsEvent::Woken {
                tick: now,
                pid: process.pid(),
            });
            self.ready.push(process);
        }
    }

    fn dispatch(&self) {
        let n = self.cores.len();
        let start = self.next_core.load(Ordering::SeqCst);
        for i in 0..n {
            let idx = (start + i) % n;
            let core = &self.cores[idx];
            if core.is_busy() {
                continue;
            }
            let Some(process) = self.ready.try_pop() else {
                break;
            };
            let quantum = match self.params.policy {
                SchedPolicy::Fcfs => u64::MAX,
                SchedPolicy::Rr => self.params.quantum_cycles,
            };
            if core.try_assign(Arc::clone(&process), quantum) {
                self.trace.record(ObsEvent::Dispatched {
                    tick: self.clock.now(),
                    pid: process.pid(),
                    core: idx,
                });
            } else {
                self.ready.push(process);
            }
        }
        self.next_core.store((start + 1) % n.max(1), Ordering::SeqCst);
    }

    fn reap_cores(&self) {
        for core in &self.cores {
            if let Some(process) = core.running_process() {
                if process.is_finished() {
                    self.reap_finished(&process);
                }
            }
        }
    }

    fn periodic_snapshot(&self) {
        let now = self.clock.now();
        let last = self.last_snapshot.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.params.quantum_cycles {
            if let Err(err) = self.manager.write_vmstat_snapshot() {
                warn!(%err, "failed to write the vmstat snapshot");
            }
            self.last_snapshot.store(now, Ordering::Relaxed);
        }
    }

    fn generator_loop(self: Arc<Self>) {
        let mut last_gen = self.clock.now();
        while self.is_generating() && self.is_running() {
            let now = self.clock.now();
            if now >= last_gen + self.params.batch_process_freq {
                let bytes = {
                    let mut rng = self.ctx.rng.lock().expect("rng lock poisoned");
                    self.manager.random_proc_bytes(&mut rng)
                };
                let pid = self.next_pid.load(Ordering::SeqCst);
                let process = self.create_process(format!("p{pid:02}"), bytes);
                self.submit(process);
                last_gen = now;
            }
            thread::sleep(LOOP_INTERVAL);
        }
    }
}
