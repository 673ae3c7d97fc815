//! A process: program, execution state, symbol table, and page table.
//!
//! Processes are shared (`Arc`) between the shell, the scheduler, a core's
//! worker thread, and the memory manager (which flips a victim's valid bits
//! during eviction). Interior state is split by concern: execution state and
//! paging state live behind separate locks, lifecycle flags are atomics, so
//! an eviction never contends with another process's instruction stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::clock::TickSource;
use crate::instr::{clamp_word, Instr, Operand, PrintPiece, MAX_LOOP_DEPTH, MAX_LOOP_REPEATS};
use crate::manager::{MemoryError, MemoryManager};
use crate::Pid;

/// Why (and whether) a process stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Still live.
    Running,
    /// Ran off the end of its program.
    Finished,
    /// Killed by an invalid memory access. Terminal states never revert.
    MemoryViolation {
        /// Offending address as shown to the user.
        addr: String,
        /// Wall time of the violation.
        at: SystemTime,
    },
}

/// One process log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Global tick when the line was emitted.
    pub tick: u64,
    /// Wall time when the line was emitted.
    pub at: SystemTime,
    /// Rendered text.
    pub text: String,
}

/// One open `FOR` loop.
#[derive(Debug, Clone)]
struct LoopFrame {
    /// Index of the first body instruction.
    start: usize,
    /// Passes still owed, including the one in flight.
    remaining: u16,
}

#[derive(Debug, Default)]
struct ExecState {
    instructions: Vec<Instr>,
    pc: usize,
    loop_stack: Vec<LoopFrame>,
    logs: Vec<LogEntry>,
}

/// Paging-side state, guarded by the per-process page-table lock.
#[derive(Debug, Default)]
pub struct PageState {
    /// page number -> frame index. Entries survive eviction.
    pub(crate) table: HashMap<usize, usize>,
    /// page number -> residency. True iff the page is in a frame right now.
    pub(crate) valid: HashMap<usize, bool>,
    /// variable name -> logical byte address, all within page 0.
    pub(crate) symbols: BTreeMap<String, u32>,
}

/// An emulated process.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    name: String,
    allocated_bytes: usize,
    created_at: SystemTime,
    mem: Arc<MemoryManager>,
    clock: TickSource,
    exec: Mutex<ExecState>,
    pages: Mutex<PageState>,
    termination: Mutex<Termination>,
    finished: AtomicBool,
    sleeping: AtomicBool,
    sleep_until: AtomicU64,
    scheduled_once: AtomicBool,
    last_core: AtomicI64,
    finish_time: Mutex<Option<SystemTime>>,
}

impl Process {
    /// Create a process with an empty program.
    ///
    /// `allocated_bytes` must already be validated (power of two in range);
    /// memory itself is admitted lazily at first dispatch.
    #[must_use]
    pub fn new(
        pid: Pid,
        name: impl Into<String>,
        allocated_bytes: usize,
        mem: Arc<MemoryManager>,
        clock: TickSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: name.into(),
            allocated_bytes,
            created_at: SystemTime::now(),
            mem,
            clock,
            exec: Mutex::new(ExecState::default()),
            pages: Mutex::new(PageState::default()),
            termination: Mutex::new(Termination::Running),
            finished: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            sleep_until: AtomicU64::new(0),
            scheduled_once: AtomicBool::new(false),
            last_core: AtomicI64::new(-1),
            finish_time: Mutex::new(None),
        })
    }

    /// Process id.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes of logical address space this process owns.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Wall time of creation.
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Install the program. Meaningful only before the first step.
    pub fn install_program(&self, instructions: Vec<Instr>) {
        let mut exec = self.lock_exec();
        exec.instructions = instructions;
    }

    /// Next instruction index.
    #[must_use]
    pub fn pc(&self) -> usize {
        self.lock_exec().pc
    }

    /// Program length.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.lock_exec().instructions.len()
    }

    /// Copy of the installed program.
    #[must_use]
    pub fn program(&self) -> Vec<Instr> {
        self.lock_exec().instructions.clone()
    }

    /// Copy of the log so far.
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.lock_exec().logs.clone()
    }

    /// Current open-loop depth.
    #[must_use]
    pub fn loop_depth(&self) -> usize {
        self.lock_exec().loop_stack.len()
    }

    /// Current termination state.
    #[must_use]
    pub fn termination(&self) -> Termination {
        self.termination
            .lock()
            .expect("termination lock poisoned")
            .clone()
    }

    /// Whether the process reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether the process is parked on a `SLEEP`.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Tick at which a sleeping process becomes runnable.
    #[must_use]
    pub fn sleep_target(&self) -> u64 {
        self.sleep_until.load(Ordering::SeqCst)
    }

    /// Clear the sleeping flag (dispatcher wake path). The deadline marker
    /// stays behind so the next step can skip past the `SLEEP`.
    pub fn clear_sleeping(&self) {
        self.sleeping.store(false, Ordering::SeqCst);
    }

    /// Record which core ran this process last.
    pub fn set_last_core(&self, core: usize) {
        self.last_core.store(core as i64, Ordering::SeqCst);
    }

    /// Core that ran this process last, if any.
    #[must_use]
    pub fn last_core(&self) -> Option<usize> {
        let id = self.last_core.load(Ordering::SeqCst);
        usize::try_from(id).ok()
    }

    /// Record the wall time the scheduler reaped this process.
    pub fn set_finish_time(&self, at: SystemTime) {
        *self.finish_time.lock().expect("finish time lock poisoned") = Some(at);
    }

    /// Wall time the scheduler reaped this process, if it has.
    #[must_use]
    pub fn finish_time(&self) -> Option<SystemTime> {
        *self.finish_time.lock().expect("finish time lock poisoned")
    }

    /// Returns true exactly once, on the first call: the lazy-admission hook.
    pub fn first_schedule(&self) -> bool {
        !self.scheduled_once.swap(true, Ordering::SeqCst)
    }

    /// Logical address of a declared variable.
    #[must_use]
    pub fn symbol_address(&self, name: &str) -> Option<u32> {
        self.lock_pages().symbols.get(name).copied()
    }

    /// Read a declared variable through the regular memory path.
    ///
    /// # Errors
    ///
    /// Propagates a [`MemoryError`] from translation.
    pub fn read_var(&self, name: &str) -> Result<Option<u16>, MemoryError> {
        match self.symbol_address(name) {
            Some(addr) => Ok(Some(self.mem.read_word(self, addr)?)),
            None => Ok(None),
        }
    }

    /// Execute one instruction on `core_id`.
    ///
    /// Returns `Ok(false)` when there is nothing to do (finished or still
    /// sleeping), `Ok(true)` when one step ran. The program counter advances
    /// unless the instruction jumped or blocked.
    ///
    /// # Errors
    ///
    /// A [`MemoryError`] aborts the step; the termination reason has already
    /// been tagged by the translation layer.
    pub fn run_one(&self, core_id: usize) -> Result<bool, MemoryError> {
        if self.is_finished() || self.is_sleeping() {
            return Ok(false);
        }
        let mut exec = self.lock_exec();
        if exec.pc >= exec.instructions.len() {
            self.mark_finished_normally();
            return Ok(false);
        }
        let pc_before = exec.pc;
        let ins = exec.instructions[pc_before].clone();

        // A satisfied SLEEP leaves its deadline marker behind; consume the
        // marker and step past without sleeping again.
        if matches!(ins, Instr::Sleep { .. }) && self.sleep_until.load(Ordering::SeqCst) != 0 {
            self.sleep_until.store(0, Ordering::SeqCst);
            exec.pc += 1;
            if exec.pc >= exec.instructions.len() {
                self.mark_finished_normally();
            }
            return Ok(true);
        }

        self.execute(&mut exec, &ins, core_id)?;

        if !self.is_sleeping() && exec.pc == pc_before {
            exec.pc += 1;
        }
        if exec.pc >= exec.instructions.len() {
            self.mark_finished_normally();
        }
        Ok(true)
    }

    fn execute(
        &self,
        exec: &mut ExecState,
        ins: &Instr,
        core_id: usize,
    ) -> Result<(), MemoryError> {
        match ins {
            Instr::Declare { var, value } => match self.mem.allocate_variable(self, var)? {
                Some(addr) => {
                    self.mem.write_word(self, addr, (*value).unwrap_or(0))?;
                }
                None => {
                    self.log_line(exec, format!("[warn] DECLARE {var} skipped: symbol table full"));
                }
            },
            Instr::Add { dst, lhs, rhs } => self.arith(dst, lhs, rhs, false)?,
            Instr::Sub { dst, lhs, rhs } => self.arith(dst, lhs, rhs, true)?,
            Instr::Print { pieces } => {
                let mut text = String::new();
                for piece in pieces {
                    match piece {
                        PrintPiece::Literal(lit) => text.push_str(lit),
                        PrintPiece::Value(op) => {
                            let value = self.resolve(op)?;
                            text.push_str(&value.to_string());
                        }
                    }
                }
                self.log_line(exec, format!("Core:{core_id} \"{text}\""));
            }
            Instr::Sleep { ticks } => {
                // max(1) keeps 0 distinguishable as "no deadline pending".
                let target = self.clock.now().saturating_add(*ticks).max(1);
                self.sleep_until.store(target, Ordering::SeqCst);
                self.sleeping.store(true, Ordering::SeqCst);
            }
            Instr::For { repeats } => {
                if exec.loop_stack.len() >= MAX_LOOP_DEPTH {
                    self.log_line(exec, "[warn] FOR nesting limit reached, skipping".to_string());
                } else {
                    let count = self.resolve(repeats)?.min(MAX_LOOP_REPEATS);
                    exec.loop_stack.push(LoopFrame {
                        start: exec.pc + 1,
                        remaining: count,
                    });
                }
            }
            Instr::End => match exec.loop_stack.last_mut() {
                Some(top) => {
                    if top.remaining > 1 {
                        top.remaining -= 1;
                        exec.pc = top.start;
                    } else {
                        exec.loop_stack.pop();
                    }
                }
                None => {
                    self.log_line(exec, "[warn] END without matching FOR".to_string());
                }
            },
            Instr::Read { var, addr } => match self.mem.allocate_variable(self, var)? {
                Some(sym) => {
                    let value = self.mem.read_word(self, *addr)?;
                    self.mem.write_word(self, sym, value)?;
                }
                None => {
                    self.log_line(exec, format!("[warn] READ {var} skipped: symbol table full"));
                }
            },
            Instr::Write { addr, expr } => {
                let value = self.resolve(expr)?;
                self.mem.write_word(self, *addr, value)?;
            }
        }
        Ok(())
    }

    fn arith(
        &self,
        dst: &str,
        lhs: &Operand,
        rhs: &Operand,
        subtract: bool,
    ) -> Result<(), MemoryError> {
        let Some(addr) = self.symbol_address(dst) else {
            return Ok(());
        };
        let a = i64::from(self.resolve(lhs)?);
        let b = i64::from(self.resolve(rhs)?);
        let value = if subtract { a - b } else { a + b };
        self.mem.write_word(self, addr, clamp_word(value))
    }

    fn resolve(&self, op: &Operand) -> Result<u16, MemoryError> {
        match op {
            Operand::Lit(v) => Ok(*v),
            Operand::Var(name) => match self.symbol_address(name) {
                Some(addr) => self.mem.read_word(self, addr),
                None => Ok(0),
            },
        }
    }

    fn log_line(&self, exec: &mut ExecState, text: String) {
        exec.logs.push(LogEntry {
            tick: self.clock.now(),
            at: SystemTime::now(),
            text,
        });
    }

    /// Tag the process as killed by a memory violation. Terminal states are
    /// permanent; later calls are ignored.
    pub(crate) fn mark_violation(&self, addr: &str) {
        let mut termination = self.termination.lock().expect("termination lock poisoned");
        if matches!(*termination, Termination::Running) {
            *termination = Termination::MemoryViolation {
                addr: addr.to_string(),
                at: SystemTime::now(),
            };
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    fn mark_finished_normally(&self) {
        let mut termination = self.termination.lock().expect("termination lock poisoned");
        if matches!(*termination, Termination::Running) {
            *termination = Termination::Finished;
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lock_pages(&self) -> MutexGuard<'_, PageState> {
        self.pages.lock().expect("page table lock poisoned")
    }

    fn lock_exec(&self) -> MutexGuard<'_, ExecState> {
        self.exec.lock().expect("exec state lock poisoned")
    }
}
