//! Shared fixtures for the scenario tests.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use csopesy::config::Config;
use csopesy::scheduler::SchedPolicy;
use csopesy::system::{BootOptions, System};

/// Per-test output directory so persisted files never collide.
pub fn unique_out_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "csopesy-test-{tag}-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::create_dir_all(&dir).expect("create test output dir");
    dir
}

/// One-core FCFS baseline; scenarios override what they need.
pub fn base_config() -> Config {
    Config {
        num_cpu: 1,
        scheduler: SchedPolicy::Fcfs,
        quantum_cycles: 4,
        batch_process_freq: 100_000,
        min_ins: 1,
        max_ins: 4,
        delay_per_exec: 0,
        max_overall_mem: 1024,
        mem_per_frame: 64,
        min_mem_per_proc: 64,
        max_mem_per_proc: 512,
    }
}

/// Boot a system with a fixed seed and an isolated output directory.
pub fn boot(tag: &str, config: Config) -> System {
    System::boot(
        config,
        BootOptions {
            seed: Some(42),
            out_dir: unique_out_dir(tag),
        },
    )
    .expect("boot system")
}

/// Wait until every submitted process has finished and been reaped.
///
/// Panics when `timeout` elapses first, so a wedged scheduler fails the test
/// instead of hanging it.
pub fn wait_all_reaped(system: &System, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let all = system.scheduler().all_processes();
        let reaped = system.scheduler().finished_processes().len();
        if !all.is_empty() && all.iter().all(|p| p.is_finished()) && reaped == all.len() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "processes did not finish in time: {} submitted, {} reaped",
            all.len(),
            reaped
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}
