//! Emulator configuration, loaded from `config.txt`.
//!
//! The file is a flat sequence of whitespace-separated `key value` pairs;
//! values may be double-quoted. Every key is required. Validation happens
//! eagerly so the system either boots with a coherent configuration or not
//! at all.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedPolicy;

/// Validated emulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of CPU cores, 1..=128.
    pub num_cpu: u32,
    /// Scheduling policy.
    pub scheduler: SchedPolicy,
    /// Time slice in instructions for round-robin; also the snapshot period.
    pub quantum_cycles: u64,
    /// Auto-generator period in global ticks.
    pub batch_process_freq: u64,
    /// Minimum generated program length.
    pub min_ins: u64,
    /// Maximum generated program length.
    pub max_ins: u64,
    /// Per-instruction delay in global ticks (0 selects a fixed short sleep).
    pub delay_per_exec: u64,
    /// Total physical memory in bytes. Power of two.
    pub max_overall_mem: usize,
    /// Frame (and page) size in bytes. Power of two dividing total memory.
    pub mem_per_frame: usize,
    /// Smallest per-process allocation the generator may pick. Power of two.
    pub min_mem_per_proc: usize,
    /// Largest per-process allocation the generator may pick. Power of two.
    pub max_mem_per_proc: usize,
}

/// Smallest allocation any process may request, in bytes.
pub const MIN_PROC_BYTES: usize = 64;
/// Largest allocation any process may request, in bytes.
pub const MAX_PROC_BYTES: usize = 65_536;

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A required key was absent.
    #[error("missing key '{0}'")]
    MissingKey(&'static str),
    /// A value failed to parse for its key.
    #[error("invalid value '{value}' for key '{key}'")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Raw value text.
        value: String,
    },
    /// A value parsed but fell outside its allowed range.
    #[error("{key} out of range: {detail}")]
    OutOfRange {
        /// Offending key.
        key: &'static str,
        /// Human-readable constraint.
        detail: String,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cpu: 4,
            scheduler: SchedPolicy::Rr,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delay_per_exec: 0,
            max_overall_mem: 16_384,
            mem_per_frame: 16,
            min_mem_per_proc: 4096,
            max_mem_per_proc: 4096,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is unreadable, a key is missing
    /// or malformed, or a range constraint fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Validate an already-constructed configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for any violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn range(key: &'static str, detail: impl Into<String>) -> ConfigError {
            ConfigError::OutOfRange {
                key,
                detail: detail.into(),
            }
        }

        if self.num_cpu < 1 || self.num_cpu > 128 {
            return Err(range("num-cpu", "must be in 1..=128"));
        }
        if self.quantum_cycles < 1 {
            return Err(range("quantum-cycles", "must be at least 1"));
        }
        if self.batch_process_freq < 1 {
            return Err(range("batch-process-freq", "must be at least 1"));
        }
        if self.min_ins < 1 {
            return Err(range("min-ins", "must be at least 1"));
        }
        if self.max_ins < self.min_ins {
            return Err(range("max-ins", "must be >= min-ins"));
        }
        for (key, value) in [
            ("max-overall-mem", self.max_overall_mem),
            ("mem-per-frame", self.mem_per_frame),
            ("min-mem-per-proc", self.min_mem_per_proc),
            ("max-mem-per-proc", self.max_mem_per_proc),
        ] {
            if !value.is_power_of_two() {
                return Err(range(key, format!("{value} is not a power of two")));
            }
        }
        if self.mem_per_frame > self.max_overall_mem {
            return Err(range("mem-per-frame", "larger than max-overall-mem"));
        }
        if self.min_mem_per_proc < MIN_PROC_BYTES || self.max_mem_per_proc > MAX_PROC_BYTES {
            return Err(range(
                "min-mem-per-proc",
                format!("per-process sizes must lie in {MIN_PROC_BYTES}..={MAX_PROC_BYTES}"),
            ));
        }
        if self.min_mem_per_proc > self.max_mem_per_proc {
            return Err(range("min-mem-per-proc", "must be <= max-mem-per-proc"));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut kv = HashMap::new();
        let mut tokens = text.split_whitespace();
        while let Some(key) = tokens.next() {
            let value = tokens.next().unwrap_or("");
            kv.insert(key.to_string(), strip_quotes(value).to_string());
        }

        fn get<'m>(
            kv: &'m HashMap<String, String>,
            key: &'static str,
        ) -> Result<&'m str, ConfigError> {
            kv.get(key)
                .map(String::as_str)
                .ok_or(ConfigError::MissingKey(key))
        }

        fn num<T: FromStr>(kv: &HashMap<String, String>, key: &'static str) -> Result<T, ConfigError> {
            let raw = get(kv, key)?;
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: raw.to_string(),
            })
        }

        let scheduler_raw = get(&kv, "scheduler")?;
        let scheduler = scheduler_raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "scheduler",
                value: scheduler_raw.to_string(),
            })?;

        let config = Self {
            num_cpu: num(&kv, "num-cpu")?,
            scheduler,
            quantum_cycles: num(&kv, "quantum-cycles")?,
            batch_process_freq: num(&kv, "batch-process-freq")?,
            min_ins: num(&kv, "min-ins")?,
            max_ins: num(&kv, "max-ins")?,
            delay_per_exec: num(&kv, "delay-per-exec")?,
            max_overall_mem: num(&kv, "max-overall-mem")?,
            mem_per_frame: num(&kv, "mem-per-frame")?,
            min_mem_per_proc: num(&kv, "min-mem-per-proc")?,
            max_mem_per_proc: num(&kv, "max-mem-per-proc")?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GOOD: &str = "\
num-cpu 4
scheduler \"rr\"
quantum-cycles 5
batch-process-freq 1
min-ins 1000
max-ins 2000
delay-per-exec 0
max-overall-mem 16384
mem-per-frame 16
min-mem-per-proc 4096
max-mem-per-proc 4096
";

    #[test]
    fn test_parse_full_config() {
        let cfg: Config = GOOD.parse().unwrap();
        assert_eq!(cfg.num_cpu, 4);
        assert_eq!(cfg.scheduler, SchedPolicy::Rr);
        assert_eq!(cfg.quantum_cycles, 5);
        assert_eq!(cfg.mem_per_frame, 16);
    }

    #[test]
    fn test_missing_key_rejected() {
        let text = GOOD.replace("num-cpu 4\n", "");
        let err = text.parse::<Config>().unwrap_err();
        assert_matches!(err, ConfigError::MissingKey("num-cpu"));
    }

    #[test]
    fn test_bad_scheduler_rejected() {
        let text = GOOD.replace("\"rr\"", "lottery");
        let err = text.parse::<Config>().unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { key: "scheduler", .. });
    }

    #[test]
    fn test_non_power_of_two_memory_rejected() {
        let text = GOOD.replace("mem-per-frame 16", "mem-per-frame 24");
        let err = text.parse::<Config>().unwrap_err();
        assert_matches!(err, ConfigError::OutOfRange { key: "mem-per-frame", .. });
    }

    #[test]
    fn test_min_above_max_ins_rejected() {
        let text = GOOD.replace("min-ins 1000", "min-ins 9000");
        let err = text.parse::<Config>().unwrap_err();
        assert_matches!(err, ConfigError::OutOfRange { key: "max-ins", .. });
    }

    #[test]
    fn test_num_cpu_bounds() {
        for bad in ["0", "129"] {
            let text = GOOD.replace("num-cpu 4", &format!("num-cpu {bad}"));
            assert_matches!(
                text.parse::<Config>().unwrap_err(),
                ConfigError::OutOfRange { key: "num-cpu", .. }
            );
        }
    }
}
