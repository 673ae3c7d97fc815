//! Bootstrap: constructs the component graph, wires shared handles, and owns
//! shutdown.
//!
//! Ownership is acyclic: processes hold the memory manager, the manager holds
//! weak process handles for victim resolution, cores hold a weak scheduler
//! handle. The `System` owns the roots.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::clock::TickSource;
use crate::config::{Config, ConfigError, MAX_PROC_BYTES, MIN_PROC_BYTES};
use crate::instr::{parse_program, ParseError};
use crate::manager::{MemoryManager, MemoryParams};
use crate::process::Process;
use crate::rng::SimRng;
use crate::scheduler::{SchedParams, Scheduler};
use crate::trace::EventTrace;

/// Boot-time options not covered by `config.txt`.
#[derive(Debug, Clone)]
pub struct BootOptions {
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Directory receiving the three persisted files.
    pub out_dir: PathBuf,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            seed: None,
            out_dir: PathBuf::from("."),
        }
    }
}

/// Errors from submitting a process.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// A non-finished process already uses this name.
    #[error("process name '{0}' already exists")]
    NameConflict(String),
    /// The requested size is not a power of two in the allowed range.
    #[error("memory size {0} must be a power of two in {MIN_PROC_BYTES}..={MAX_PROC_BYTES}")]
    InvalidMemorySize(usize),
    /// The supplied program did not parse.
    #[error(transparent)]
    Program(#[from] ParseError),
}

/// The running emulator: clock, memory subsystem, and scheduler.
#[derive(Debug)]
pub struct System {
    config: Config,
    clock: TickSource,
    manager: Arc<MemoryManager>,
    scheduler: Arc<Scheduler>,
    trace: Arc<EventTrace>,
    out_dir: PathBuf,
}

impl System {
    /// Validate the configuration, construct the graph, and start the
    /// scheduler and tick source.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when validation fails; nothing is started.
    pub fn boot(config: Config, options: BootOptions) -> Result<Self, ConfigError> {
        config.validate()?;

        let clock = TickSource::new();
        clock.start();
        let trace = Arc::new(EventTrace::new());
        let manager = Arc::new(MemoryManager::new(
            MemoryParams {
                total_bytes: config.max_overall_mem,
                frame_size: config.mem_per_frame,
                min_proc_bytes: config.min_mem_per_proc,
                max_proc_bytes: config.max_mem_per_proc,
                out_dir: options.out_dir.clone(),
            },
            clock.clone(),
            Arc::clone(&trace),
        ));
        let rng = Arc::new(Mutex::new(match options.seed {
            Some(seed) => SimRng::new(seed),
            None => SimRng::from_entropy(),
        }));
        let scheduler = Scheduler::new(
            SchedParams {
                num_cpu: config.num_cpu as usize,
                policy: config.scheduler,
                quantum_cycles: config.quantum_cycles,
                batch_process_freq: config.batch_process_freq,
                min_ins: config.min_ins,
                max_ins: config.max_ins,
                delay_per_exec: config.delay_per_exec,
            },
            Arc::clone(&manager),
            clock.clone(),
            rng,
            Arc::clone(&trace),
        );
        scheduler.start();

        Ok(Self {
            config,
            clock,
            manager,
            scheduler,
            trace,
            out_dir: options.out_dir,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The memory manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// The global tick source.
    #[must_use]
    pub fn clock(&self) -> &TickSource {
        &self.clock
    }

    /// The observable event trace.
    #[must_use]
    pub fn trace(&self) -> &Arc<EventTrace> {
        &self.trace
    }

    /// Submit a process whose program will be generated at first dispatch
    /// (`screen -s`).
    ///
    /// # Errors
    ///
    /// Rejects invalid sizes and duplicate names of non-finished processes.
    pub fn submit_generated(
        &self,
        name: &str,
        memory_bytes: usize,
    ) -> Result<Arc<Process>, SubmitError> {
        self.check_submission(name, memory_bytes)?;
        let process = self.scheduler.create_process(name, memory_bytes);
        self.scheduler.submit(Arc::clone(&process));
        Ok(process)
    }

    /// Submit a process with a user-supplied program (`screen -c`).
    ///
    /// # Errors
    ///
    /// Rejects invalid sizes, duplicate names, and malformed programs.
    pub fn submit_program(
        &self,
        name: &str,
        memory_bytes: usize,
        source: &str,
    ) -> Result<Arc<Process>, SubmitError> {
        self.check_submission(name, memory_bytes)?;
        let program = parse_program(source)?;
        let process = self.scheduler.create_process(name, memory_bytes);
        process.install_program(program);
        self.scheduler.submit(Arc::clone(&process));
        Ok(process)
    }

    /// Block until every submitted process has been reaped.
    pub fn wait_until_all_done(&self) {
        self.scheduler.wait_until_all_done();
    }

    /// Write the `screen -ls` report to `csopesy-log.txt`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be written.
    pub fn write_report_file(&self) -> std::io::Result<PathBuf> {
        let path = self.out_dir.join("csopesy-log.txt");
        std::fs::write(&path, crate::report::utilization_report(&self.scheduler))?;
        Ok(path)
    }

    /// Stop the scheduler, cores, generator, and tick source.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.clock.stop();
    }

    fn check_submission(&self, name: &str, memory_bytes: usize) -> Result<(), SubmitError> {
        if !memory_bytes.is_power_of_two()
            || !(MIN_PROC_BYTES..=MAX_PROC_BYTES).contains(&memory_bytes)
        {
            return Err(SubmitError::InvalidMemorySize(memory_bytes));
        }
        if self.scheduler.find_active_by_name(name).is_some() {
            return Err(SubmitError::NameConflict(name.to_string()));
        }
        Ok(())
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn boot() -> System {
        let config = Config {
            num_cpu: 1,
            batch_process_freq: 1000,
            min_ins: 1,
            max_ins: 4,
            max_overall_mem: 1024,
            mem_per_frame: 64,
            min_mem_per_proc: 64,
            max_mem_per_proc: 1024,
            ..Config::default()
        };
        let out_dir = std::env::temp_dir().join(format!("csopesy-sys-{}", std::process::id()));
        std::fs::create_dir_all(&out_dir).unwrap();
        System::boot(
            config,
            BootOptions {
                seed: Some(7),
                out_dir,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_boot_rejects_invalid_config() {
        let config = Config {
            num_cpu: 0,
            ..Config::default()
        };
        assert!(System::boot(config, BootOptions::default()).is_err());
    }

    #[test]
    fn test_submission_validation() {
        let system = boot();
        assert_matches!(
            system.submit_generated("a", 100),
            Err(SubmitError::InvalidMemorySize(100))
        );
        assert_matches!(
            system.submit_generated("a", 32),
            Err(SubmitError::InvalidMemorySize(32))
        );
        let p = system.submit_program("a", 128, "PRINT(\"hi\")").unwrap();
        assert_matches!(
            system.submit_generated("a", 128),
            Err(SubmitError::NameConflict(_))
        );
        system.wait_until_all_done();
        assert!(p.is_finished());
        // Finished processes free their name for reuse.
        assert!(system.submit_program("a", 128, "PRINT(\"again\")").is_ok());
        system.wait_until_all_done();
    }

    #[test]
    fn test_bad_program_rejected() {
        let system = boot();
        assert_matches!(
            system.submit_program("b", 128, "FROB 1"),
            Err(SubmitError::Program(_))
        );
    }
}
