//! Report rendering: `screen -ls`, `process-smi`, `vmstat`, and the
//! per-process attach view.
//!
//! Everything here is presentation only; the data comes from the scheduler
//! and memory manager. Wall times are formatted in UTC with a small civil
//! conversion because scheduling itself never consults the wall clock.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::clock::TickSource;
use crate::manager::MemoryManager;
use crate::process::{Process, Termination};
use crate::scheduler::Scheduler;

/// `(MM/DD/YYYY hh:MM:SSAM)` - the timestamp shape used in process listings.
#[must_use]
pub fn wall_timestamp(at: SystemTime) -> String {
    let (date, h12, min, sec, half) = split_wall(at);
    format!("({date} {h12:02}:{min:02}:{sec:02}{half})")
}

/// `MM/DD/YYYY hh:MM:SS AM` - the shape used in the backing-store banner.
#[must_use]
pub(crate) fn wall_date_time(at: SystemTime) -> String {
    let (date, h12, min, sec, half) = split_wall(at);
    format!("{date} {h12:02}:{min:02}:{sec:02} {half}")
}

/// `HH:MM:SS` - the shape used in violation messages.
#[must_use]
pub fn clock_time(at: SystemTime) -> String {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (h, m, s) = (secs / 3600 % 24, secs / 60 % 60, secs % 60);
    format!("{h:02}:{m:02}:{s:02}")
}

fn split_wall(at: SystemTime) -> (String, u64, u64, u64, &'static str) {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let hour = secs / 3600 % 24;
    let half = if hour < 12 { "AM" } else { "PM" };
    let h12 = match hour % 12 {
        0 => 12,
        h => h,
    };
    (
        format!("{month:02}/{day:02}/{year:04}"),
        h12,
        secs / 60 % 60,
        secs % 60,
        half,
    )
}

/// Gregorian date for a day count since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// The `screen -ls` / `report-util` body.
#[must_use]
pub fn utilization_report(scheduler: &Scheduler) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "CPU utilization: {:.0}%", scheduler.cpu_utilization());
    let _ = writeln!(out, "Cores used: {}", scheduler.cores_used());
    let _ = writeln!(out, "Cores available: {}", scheduler.cores_available());

    let _ = writeln!(out, "\nRunning processes:");
    for p in scheduler.running_processes() {
        let core = p.last_core().map_or_else(|| "-".to_string(), |c| c.to_string());
        let _ = writeln!(
            out,
            "{} {} Core: {} {} / {}",
            p.name(),
            wall_timestamp(p.created_at()),
            core,
            p.pc(),
            p.instruction_count()
        );
    }

    let _ = writeln!(out, "\nFinished processes:");
    for p in scheduler.finished_processes() {
        let _ = writeln!(
            out,
            "{} {} Finished {} / {}",
            p.name(),
            wall_timestamp(p.created_at()),
            p.pc(),
            p.instruction_count()
        );
    }
    out
}

/// The `process-smi` summary table.
#[must_use]
pub fn process_smi(scheduler: &Scheduler, manager: &MemoryManager) -> String {
    let total = manager.total_bytes();
    let used = manager.used_bytes();
    let mem_util = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };

    let mut out = String::new();
    let _ = writeln!(out, "+-----------------------------------------+");
    let _ = writeln!(out, "| PROCESS-SMI v1.0                        |");
    let _ = writeln!(out, "+-----------------------------------------+");
    let _ = writeln!(out, "CPU-Util: {:.0}%", scheduler.cpu_utilization());
    let _ = writeln!(out, "Memory Usage: {used}B / {total}B");
    let _ = writeln!(out, "Memory Util: {mem_util:.0}%");
    let _ = writeln!(out, "\nRunning processes and memory usage:");
    let _ = writeln!(out, "+-----------------------------------------+");
    for p in scheduler.running_processes() {
        let _ = writeln!(out, "{} {}B", p.name(), p.allocated_bytes());
    }
    let _ = writeln!(out, "+-----------------------------------------+");
    out
}

/// The `vmstat` counters.
#[must_use]
pub fn vmstat_report(scheduler: &Scheduler, manager: &MemoryManager, clock: &TickSource) -> String {
    let total_ticks = clock.now();
    let active_ticks = scheduler.active_ticks();
    let idle_ticks = total_ticks.saturating_sub(active_ticks);

    let mut out = String::new();
    let _ = writeln!(out, "Total memory: {} bytes", manager.total_bytes());
    let _ = writeln!(out, "Used memory: {} bytes", manager.used_bytes());
    let _ = writeln!(out, "Free memory: {} bytes", manager.free_bytes());
    let _ = writeln!(out, "Idle CPU ticks: {idle_ticks}");
    let _ = writeln!(out, "Active CPU ticks: {active_ticks}");
    let _ = writeln!(out, "Total CPU ticks: {total_ticks}");
    let _ = writeln!(out, "Paged in: {}", manager.paged_in());
    let _ = writeln!(out, "Paged out: {}", manager.paged_out());
    out
}

/// The `screen -r` attach view for one process.
#[must_use]
pub fn process_view(process: &Process, clock: &TickSource) -> String {
    if let Termination::MemoryViolation { addr, at } = process.termination() {
        return format!(
            "Process {} shut down due to memory access violation error that occurred at {}. {} invalid.\n",
            process.name(),
            clock_time(at),
            addr
        );
    }

    let mut out = String::new();
    let _ = writeln!(out, "Process name: {}", process.name());
    let _ = writeln!(out, "ID: {}", process.pid());
    let _ = writeln!(out, "Current Global CPU Tick: {}", clock.now());
    let _ = writeln!(out, "Logs:");
    let logs = process.logs();
    if logs.is_empty() {
        let _ = writeln!(out, "  (No logs yet)");
    } else {
        for entry in logs {
            let _ = writeln!(out, "  {} {}", wall_timestamp(entry.at), entry.text);
        }
    }
    match process.termination() {
        Termination::Finished => {
            let _ = writeln!(out, "Finished!");
        }
        Termination::Running if process.is_sleeping() => {
            let _ = writeln!(
                out,
                "Status: Sleeping (Until tick: {})",
                process.sleep_target()
            );
        }
        _ => {
            let _ = writeln!(out, "Status: Running");
        }
    }
    let _ = writeln!(out, "Current instruction line: {}", process.pc());
    let _ = writeln!(out, "Lines of code: {}", process.instruction_count());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_civil_from_days_known_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(31), (1970, 2, 1));
        assert_eq!(civil_from_days(365), (1971, 1, 1));
        // 1972 is a leap year: Feb 29 exists.
        assert_eq!(civil_from_days(365 + 365 + 31 + 28), (1972, 2, 29));
    }

    #[test]
    fn test_wall_timestamp_epoch() {
        let ts = wall_timestamp(UNIX_EPOCH);
        assert_eq!(ts, "(01/01/1970 12:00:00AM)");
    }

    #[test]
    fn test_clock_time_wraps_within_day() {
        let at = UNIX_EPOCH + Duration::from_secs(3661);
        assert_eq!(clock_time(at), "01:01:01");
        let noon = UNIX_EPOCH + Duration::from_secs(12 * 3600);
        assert_eq!(clock_time(noon), "12:00:00");
        assert!(wall_timestamp(noon).ends_with("12:00:00PM)"));
    }
}
