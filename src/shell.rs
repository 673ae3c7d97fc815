//! The interactive shell: command parsing and dispatch.
//!
//! Every functional command requires `initialize` first; until then the
//! system stays unconstructed and commands fail with a clear error. The
//! shell only ever submits and observes processes; execution is entirely the
//! scheduler's business.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::report;
use crate::system::{BootOptions, SubmitError, System};

/// Errors surfaced to the shell user.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// A functional command arrived before `initialize`.
    #[error("specifications have not yet been initialized, run 'initialize' first")]
    NotInitialized,
    /// The first token matched no command.
    #[error("unknown command: {0}")]
    Unknown(String),
    /// Recognized command, malformed arguments.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// Configuration loading failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Submission was rejected.
    #[error(transparent)]
    Submit(#[from] SubmitError),
    /// No process has this name.
    #[error("process '{0}' not found")]
    NotFound(String),
    /// A report file could not be written.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The interactive console.
#[derive(Debug)]
pub struct Shell {
    config_path: PathBuf,
    seed: Option<u64>,
    system: Option<System>,
}

impl Shell {
    /// Create a shell that will load `config_path` on `initialize`.
    #[must_use]
    pub fn new(config_path: PathBuf, seed: Option<u64>) -> Self {
        Self {
            config_path,
            seed,
            system: None,
        }
    }

    /// The booted system, if `initialize` has run.
    #[must_use]
    pub fn system(&self) -> Option<&System> {
        self.system.as_ref()
    }

    /// Read-eval-print until `exit` or EOF. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        println!("{}", banner());
        let stdin = io::stdin();
        loop {
            print!("csopesy> ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" {
                break;
            }
            match self.handle_line(line) {
                Ok(output) => print!("{output}"),
                Err(err) => println!("{err}"),
            }
        }
        if let Some(system) = &self.system {
            system.scheduler().stop_generation();
            system.wait_until_all_done();
            system.shutdown();
        }
        0
    }

    /// Execute one command line, returning its output.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing what the user got wrong; the
    /// system state is unchanged on error.
    pub fn handle_line(&mut self, line: &str) -> Result<String, CommandError> {
        debug!(line, "shell command");
        match line {
            "help" => return Ok(help_text()),
            "clear" => return Ok("\x1b[2J\x1b[H".to_string()),
            "initialize" => return self.initialize(),
            _ => {}
        }

        let system = self.system.as_ref().ok_or(CommandError::NotInitialized)?;
        match line {
            "screen -ls" => Ok(report::utilization_report(system.scheduler())),
            "scheduler-start" => {
                system.scheduler().start_generation();
                Ok("Scheduler started; continuous process generation enabled.\n".to_string())
            }
            "scheduler-stop" => {
                system.scheduler().stop_generation();
                Ok("Scheduler stopped; continuous process generation disabled.\n".to_string())
            }
            "report-util" => {
                let path = system.write_report_file()?;
                Ok(format!("Report generated at {}\n", path.display()))
            }
            "process-smi" => Ok(report::process_smi(system.scheduler(), system.manager())),
            "vmstat" => Ok(report::vmstat_report(
                system.scheduler(),
                system.manager(),
                system.clock(),
            )),
            _ if line.starts_with("screen ") => self.screen_command(line),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    fn initialize(&mut self) -> Result<String, CommandError> {
        if self.system.is_some() {
            return Ok("System already initialized.\n".to_string());
        }
        let config = Config::from_file(&self.config_path)?;
        let summary = config_summary(&config);
        let system = System::boot(
            config,
            BootOptions {
                seed: self.seed,
                out_dir: PathBuf::from("."),
            },
        )?;
        self.system = Some(system);
        Ok(summary)
    }

    fn screen_command(&self, line: &str) -> Result<String, CommandError> {
        let system = self.system.as_ref().ok_or(CommandError::NotInitialized)?;
        let rest = line.trim_start_matches("screen").trim_start();

        if let Some(args) = rest.strip_prefix("-s ") {
            let mut tokens = args.split_whitespace();
            let (Some(name), Some(size), None) = (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(CommandError::Usage("screen -s <name> <memory_bytes>"));
            };
            let bytes = parse_size(size)?;
            let process = system.submit_generated(name, bytes)?;
            return Ok(format!(
                "Process {} (PID {}) created with {} bytes.\n",
                process.name(),
                process.pid(),
                process.allocated_bytes()
            ));
        }

        if let Some(args) = rest.strip_prefix("-c ") {
            let open = args.find('"');
            let close = args.rfind('"');
            let (Some(open), Some(close)) = (open, close) else {
                return Err(CommandError::Usage(
                    "screen -c <name> <memory_bytes> \"<instructions>\"",
                ));
            };
            if close <= open {
                return Err(CommandError::Usage(
                    "screen -c <name> <memory_bytes> \"<instructions>\"",
                ));
            }
            let source = &args[open + 1..close];
            let mut tokens = args[..open].split_whitespace();
            let (Some(name), Some(size), None) = (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(CommandError::Usage(
                    "screen -c <name> <memory_bytes> \"<instructions>\"",
                ));
            };
            let bytes = parse_size(size)?;
            let process = system.submit_program(name, bytes, source)?;
            return Ok(format!(
                "Process {} (PID {}) created with {} bytes and {} instructions.\n",
                process.name(),
                process.pid(),
                process.allocated_bytes(),
                process.instruction_count()
            ));
        }

        if let Some(name) = rest.strip_prefix("-r ") {
            let name = name.trim();
            if name.is_empty() {
                return Err(CommandError::Usage("screen -r <name>"));
            }
            let process = system
                .scheduler()
                .find_by_name(name)
                .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
            return Ok(report::process_view(&process, system.clock()));
        }

        Err(CommandError::Usage(
            "screen -s <name> <size> | screen -c <name> <size> \"<instrs>\" | screen -r <name> | screen -ls",
        ))
    }
}

fn parse_size(token: &str) -> Result<usize, CommandError> {
    token
        .parse()
        .map_err(|_| CommandError::Usage("memory size must be a number of bytes"))
}

fn banner() -> String {
    "CSOPESY emulator. Type 'help' for commands, 'initialize' to begin.".to_string()
}

fn config_summary(config: &Config) -> String {
    format!(
        "Loaded configuration:\n\
         \x20 num-cpu            = {}\n\
         \x20 scheduler          = {}\n\
         \x20 quantum-cycles     = {}\n\
         \x20 batch-process-freq = {}\n\
         \x20 min-ins            = {}\n\
         \x20 max-ins            = {}\n\
         \x20 delay-per-exec     = {}\n\
         \x20 max-overall-mem    = {}\n\
         \x20 mem-per-frame      = {}\n\
         \x20 min-mem-per-proc   = {}\n\
         \x20 max-mem-per-proc   = {}\n",
        config.num_cpu,
        config.scheduler,
        config.quantum_cycles,
        config.batch_process_freq,
        config.min_ins,
        config.max_ins,
        config.delay_per_exec,
        config.max_overall_mem,
        config.mem_per_frame,
        config.min_mem_per_proc,
        config.max_mem_per_proc,
    )
}

fn help_text() -> String {
    "\nAvailable commands:\n\
     - initialize: load config.txt and start the emulator\n\
     - screen -s <name> <size>: create a process with a generated program\n\
     - screen -c <name> <size> \"<instrs>\": create a process with the given program\n\
     - screen -r <name>: attach to a process screen\n\
     - screen -ls: show CPU status and process lists\n\
     - scheduler-start: enable continuous process generation\n\
     - scheduler-stop: disable continuous process generation\n\
     - report-util: write the CPU report to csopesy-log.txt\n\
     - process-smi: CPU and memory summary\n\
     - vmstat: memory and tick counters\n\
     - clear: clear the screen\n\
     - exit: quit\n\
     Note: run 'initialize' before any functional command.\n"
        .to_string()
}
