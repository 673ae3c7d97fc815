//! Basic FCFS completion: one core, one process, run to the end.

#[allow(dead_code)]
mod helpers;

use std::time::Duration;

use csopesy::config::Config;
use csopesy::process::Termination;
use csopesy::scheduler::SchedPolicy;

#[test]
fn test_single_process_runs_to_completion() {
    let config = Config {
        scheduler: SchedPolicy::Fcfs,
        min_mem_per_proc: 128,
        max_mem_per_proc: 128,
        ..helpers::base_config()
    };
    let system = helpers::boot("fcfs", config);

    let p = system
        .submit_program("worker", 128, "DECLARE x 5; ADD x x 3; PRINT(\"x=\" + x)")
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(20));

    assert!(matches!(p.termination(), Termination::Finished));
    let logs = p.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].text.contains("x=8"), "log was: {}", logs[0].text);

    assert!(system.manager().paged_in() >= 1);
    assert_eq!(system.manager().paged_out(), 0);

    system.shutdown();
}

#[test]
fn test_fcfs_runs_processes_in_submission_order() {
    let system = helpers::boot("fcfs-order", helpers::base_config());

    let a = system
        .submit_program("first", 64, "PRINT(\"a\"); PRINT(\"a\"); PRINT(\"a\")")
        .unwrap();
    let b = system
        .submit_program("second", 64, "PRINT(\"b\")")
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(20));

    // Under FCFS on one core the first process runs to completion before the
    // second starts: every log tick of `a` precedes every log tick of `b`.
    let last_a = a.logs().iter().map(|l| l.tick).max().unwrap();
    let first_b = b.logs().iter().map(|l| l.tick).min().unwrap();
    assert!(last_a <= first_b, "FCFS interleaved: {last_a} > {first_b}");

    system.shutdown();
}
