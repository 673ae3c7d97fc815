//! FIFO replacement under pressure: more working-set pages than frames.

#[allow(dead_code)]
mod helpers;

use std::time::Duration;

use csopesy::config::Config;
use csopesy::scheduler::SchedPolicy;
use csopesy::trace::ObsEvent;

#[test]
fn test_three_processes_share_two_frames() {
    // Two frames total; three processes of two pages each, touching both
    // pages every loop pass.
    let config = Config {
        num_cpu: 2,
        scheduler: SchedPolicy::Rr,
        quantum_cycles: 2,
        max_overall_mem: 128,
        mem_per_frame: 64,
        min_mem_per_proc: 128,
        max_mem_per_proc: 128,
        ..helpers::base_config()
    };
    let out_dir = helpers::unique_out_dir("pressure");
    let system = csopesy::system::System::boot(
        config,
        csopesy::system::BootOptions {
            seed: Some(42),
            out_dir: out_dir.clone(),
        },
    )
    .unwrap();

    let program = "FOR 4; WRITE 0x10 7; WRITE 0x40 9; END; READ v 0x40; PRINT(\"v=\" + v)";
    let procs: Vec<_> = (0..3)
        .map(|i| {
            system
                .submit_program(&format!("thrash{i}"), 128, program)
                .unwrap()
        })
        .collect();
    helpers::wait_all_reaped(&system, Duration::from_secs(30));

    for p in &procs {
        assert!(p.is_finished());
        // The round-trip survives evictions in between.
        assert!(
            p.logs().iter().any(|l| l.text.contains("v=9")),
            "{} logs: {:?}",
            p.name(),
            p.logs()
        );
    }

    let manager = system.manager();
    assert!(manager.paged_out() >= 1, "expected replacement activity");
    assert!(manager.resident_pages().len() <= 2);
    assert!(manager.paged_in() > manager.paged_out());

    // Every eviction left a record in the swap log.
    let log = std::fs::read_to_string(out_dir.join("csopesy-backing-store.txt")).unwrap();
    let records = log.matches("BACKING STORE SNAPSHOT").count() as u64;
    assert_eq!(records, manager.paged_out());

    let evictions = system
        .trace()
        .snapshot()
        .iter()
        .filter(|e| matches!(e, ObsEvent::Evicted { .. }))
        .count() as u64;
    assert_eq!(evictions, manager.paged_out());

    system.shutdown();
}
