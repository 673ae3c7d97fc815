//! SLEEP suspends a process and the dispatcher resumes it after the deadline.

#[allow(dead_code)]
mod helpers;

use std::time::Duration;

use csopesy::trace::ObsEvent;

#[test]
fn test_sleep_suspends_and_resumes() {
    let system = helpers::boot("sleep", helpers::base_config());

    let p = system
        .submit_program("napper", 64, "PRINT(\"a\"); SLEEP 5; PRINT(\"b\")")
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(20));

    let logs = p.logs();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].text.contains('a'));
    assert!(logs[1].text.contains('b'));
    assert!(
        logs[1].tick >= logs[0].tick + 5,
        "second log at tick {} is not 5 past {}",
        logs[1].tick,
        logs[0].tick
    );

    let events = system.trace().snapshot();
    let slept = events
        .iter()
        .any(|e| matches!(e, ObsEvent::Slept { pid, .. } if *pid == p.pid()));
    let woken = events
        .iter()
        .any(|e| matches!(e, ObsEvent::Woken { pid, .. } if *pid == p.pid()));
    assert!(slept && woken, "expected Slept and Woken events");

    system.shutdown();
}

#[test]
fn test_sleep_zero_reenters_immediately() {
    let system = helpers::boot("sleep0", helpers::base_config());

    let p = system
        .submit_program("blinker", 64, "SLEEP 0; PRINT(\"done\")")
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(20));

    assert_eq!(p.logs().len(), 1);
    assert!(p.logs()[0].text.contains("done"));

    system.shutdown();
}
