//! CPU and memory formatting for the Docker stats job.
//!
//! CPU% needs two consecutive samples per container; the previous sample is
//! kept in a [`CpuSampleTable`] owned by the observer instance, not in a
//! process-wide static.

use std::collections::HashMap;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Point-in-time resource numbers extracted from one stats response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSample {
    pub total_cpu_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

/// Per-container-name table of previous samples, retained across stats ticks.
#[derive(Debug, Default)]
pub struct CpuSampleTable {
    previous: HashMap<String, StatsSample>,
}

impl CpuSampleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes CPU% from the delta against the previous sample and stores
    /// the new one. The first sample for a container yields 0.0.
    pub fn cpu_percent(&mut self, container_name: &str, sample: StatsSample) -> f64 {
        let percent = match self.previous.get(container_name) {
            Some(prev) => {
                let cpu_delta = sample.total_cpu_usage.saturating_sub(prev.total_cpu_usage);
                let system_delta = sample.system_cpu_usage.saturating_sub(prev.system_cpu_usage);
                if system_delta == 0 {
                    0.0
                } else {
                    (cpu_delta as f64 / system_delta as f64) * sample.online_cpus as f64 * 100.0
                }
            }
            None => 0.0,
        };
        self.previous.insert(container_name.to_string(), sample);
        percent
    }

    /// Dropped containers must not leave stale samples behind.
    pub fn forget(&mut self, container_name: &str) {
        self.previous.remove(container_name);
    }
}

pub fn format_cpu(percent: f64) -> String {
    format!("{percent:.2}%")
}

/// MiB below 1GiB, GiB from exactly 1GiB upwards, two decimals either way.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2}GiB", bytes as f64 / GIB as f64)
    } else {
        format!("{:.2}MiB", bytes as f64 / MIB as f64)
    }
}

pub fn format_memory(usage: u64, limit: u64) -> String {
    format!("{}/{}", format_bytes(usage), format_bytes(limit))
}

/// Defaults used when a container has no stats at all; the UI expects
/// zeroed strings, never null.
pub const EMPTY_MEMORY: &str = "0MiB/0MiB";
pub const EMPTY_CPU: &str = "0%";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_yields_zero_percent() {
        let mut table = CpuSampleTable::new();
        let sample = StatsSample {
            total_cpu_usage: 1_000_000,
            system_cpu_usage: 10_000_000,
            online_cpus: 4,
            ..Default::default()
        };
        let percent = table.cpu_percent("orders-devmode", sample);
        assert_eq!(format_cpu(percent), "0.00%");
    }

    #[test]
    fn test_cpu_percent_from_consecutive_samples() {
        let mut table = CpuSampleTable::new();
        table.cpu_percent(
            "orders-devmode",
            StatsSample {
                total_cpu_usage: 1_000_000,
                system_cpu_usage: 10_000_000,
                online_cpus: 4,
                ..Default::default()
            },
        );
        // Δtotal = 500_000, Δsystem = 10_000_000 → 0.05 × 4 × 100 = 20.00%
        let percent = table.cpu_percent(
            "orders-devmode",
            StatsSample {
                total_cpu_usage: 1_500_000,
                system_cpu_usage: 20_000_000,
                online_cpus: 4,
                ..Default::default()
            },
        );
        assert_eq!(format_cpu(percent), "20.00%");
    }

    #[test]
    fn test_forget_resets_sample_history() {
        let mut table = CpuSampleTable::new();
        let sample = StatsSample {
            total_cpu_usage: 100,
            system_cpu_usage: 1000,
            online_cpus: 1,
            ..Default::default()
        };
        table.cpu_percent("a", sample);
        table.forget("a");
        let percent = table.cpu_percent(
            "a",
            StatsSample {
                total_cpu_usage: 200,
                system_cpu_usage: 2000,
                online_cpus: 1,
                ..Default::default()
            },
        );
        assert_eq!(percent, 0.0);
    }

    #[test]
    fn test_memory_formatting_boundary_at_one_gib() {
        assert_eq!(format_bytes(1073741823), "1024.00MiB");
        assert_eq!(format_bytes(1073741824), "1.00GiB");
    }

    #[test]
    fn test_memory_pair_formatting() {
        assert_eq!(
            format_memory(512 * 1024 * 1024, 2 * 1024 * 1024 * 1024),
            "512.00MiB/2.00GiB"
        );
    }
}
