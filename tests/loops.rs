//! FOR/END loops through the full scheduler path.

#[allow(dead_code)]
mod helpers;

use std::time::Duration;

#[test]
fn test_for_loop_accumulates() {
    let system = helpers::boot("loops", helpers::base_config());

    let p = system
        .submit_program("looper", 64, "DECLARE x; FOR 3; ADD x x 1; END; PRINT(\"x=\" + x)")
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(20));

    assert!(p.logs().iter().any(|l| l.text.contains("x=3")));
    system.shutdown();
}

#[test]
fn test_nested_loop_with_sleep_completes() {
    let system = helpers::boot("loops-nested", helpers::base_config());

    let p = system
        .submit_program(
            "nested",
            64,
            "DECLARE x; FOR 2; FOR 2; ADD x x 1; SLEEP 1; END; END; PRINT(\"x=\" + x)",
        )
        .unwrap();
    helpers::wait_all_reaped(&system, Duration::from_secs(30));

    assert!(p.logs().iter().any(|l| l.text.contains("x=4")));
    system.shutdown();
}
