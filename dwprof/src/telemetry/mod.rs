//! # Telemetry Collaborators
//!
//! Counters sampled next to each call chain: CPU time of the target, system
//! CPU time, package energy and GPU power draw. Each source sits behind a
//! small trait so the capture loop does not care where the numbers come from.
//!
//! Two consecutive snapshots give the power drawn by the target: the package
//! energy spent between them, scaled by the target's share of all CPU time
//! spent in the same interval (see [`Telemetry::process_power`]).
//!
//! Every reading is optional. A counter that is missing on this machine, or
//! that fails to read once, yields `None` and the chain is recorded anyway.

pub mod energy;
pub mod gpu;
pub mod proc;

use serde::Serialize;
use std::time::Duration;

use crate::domain::Pid;

pub use energy::Rapl;
pub use gpu::DrmHwmon;
pub use proc::ProcStat;

/// CPU time consumed by one process
pub trait ProcessClock {
    /// User plus system time in clock ticks, `None` once the process exited
    fn process_time(&self, pid: Pid) -> Option<u64>;
}

/// CPU time consumed by the whole system
pub trait SystemClock {
    /// Sum of every state of the aggregate `cpu` line, in clock ticks
    fn total_cpu_time(&self) -> Option<u64>;
}

/// Monotonic energy counter that wraps at a fixed maximum
pub trait EnergyMeter {
    /// Current counter value in microjoules
    fn total_energy(&self) -> Option<u64>;

    /// Value at which the counter wraps back to zero, if known
    fn energy_range(&self) -> Option<u64> {
        None
    }

    /// Energy spent between two readings, accounting for one wrap
    fn delta(&self, before: u64, after: u64) -> Option<u64> {
        if after >= before {
            return Some(after - before);
        }
        let range = self.energy_range()?;
        Some(range.saturating_sub(before) + after)
    }
}

/// Power draw of the installed GPUs
pub trait GpuPowerMeter {
    /// Average watts over the first `gpu_count` devices, `None` when no
    /// compatible device exists
    fn gpu_power(&self, gpu_count: usize) -> Option<f64>;
}

/// One reading of every collaborator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub process_time: Option<u64>,
    pub total_cpu_time: Option<u64>,
    pub energy_uj: Option<u64>,
    pub gpu_watts: Option<f64>,
}

/// The set of collaborators the capture loop samples
pub struct Telemetry {
    pub process: Box<dyn ProcessClock>,
    pub system: Box<dyn SystemClock>,
    pub energy: Box<dyn EnergyMeter>,
    pub gpu: Box<dyn GpuPowerMeter>,
    pub gpu_count: usize,
}

impl Telemetry {
    /// Collaborators backed by /proc and /sys
    #[must_use]
    pub fn linux(gpu_count: usize) -> Self {
        Self {
            process: Box::new(ProcStat::default()),
            system: Box::new(ProcStat::default()),
            energy: Box::new(Rapl::default()),
            gpu: Box::new(DrmHwmon::default()),
            gpu_count,
        }
    }

    #[must_use]
    pub fn snapshot(&self, pid: Pid) -> TelemetrySnapshot {
        TelemetrySnapshot {
            process_time: self.process.process_time(pid),
            total_cpu_time: self.system.total_cpu_time(),
            energy_uj: self.energy.total_energy(),
            gpu_watts: if self.gpu_count == 0 { None } else { self.gpu.gpu_power(self.gpu_count) },
        }
    }

    /// Watts attributed to the target between two snapshots `elapsed` apart
    ///
    /// Package energy over the interval, multiplied by the fraction of system
    /// CPU time the target consumed in it. `None` when any counter is
    /// missing, the system clock did not advance, or `elapsed` is zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn process_power(
        &self,
        before: &TelemetrySnapshot,
        after: &TelemetrySnapshot,
        elapsed: Duration,
    ) -> Option<f64> {
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return None;
        }

        let energy_uj = self.energy.delta(before.energy_uj?, after.energy_uj?)?;
        let process_ticks = after.process_time?.checked_sub(before.process_time?)?;
        let total_ticks = after.total_cpu_time?.checked_sub(before.total_cpu_time?)?;
        if total_ticks == 0 {
            return None;
        }

        // Both clocks are sampled a few microseconds apart
        let share = (process_ticks as f64 / total_ticks as f64).min(1.0);
        Some(energy_uj as f64 / 1e6 * share / seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        energy: Option<u64>,
        range: Option<u64>,
    }

    impl EnergyMeter for Fixed {
        fn total_energy(&self) -> Option<u64> {
            self.energy
        }

        fn energy_range(&self) -> Option<u64> {
            self.range
        }
    }

    impl ProcessClock for Fixed {
        fn process_time(&self, _pid: Pid) -> Option<u64> {
            Some(12)
        }
    }

    impl SystemClock for Fixed {
        fn total_cpu_time(&self) -> Option<u64> {
            None
        }
    }

    impl GpuPowerMeter for Fixed {
        fn gpu_power(&self, gpu_count: usize) -> Option<f64> {
            Some(25.0 * gpu_count as f64)
        }
    }

    fn fixed() -> Box<Fixed> {
        Box::new(Fixed { energy: Some(500), range: Some(1_000) })
    }

    #[test]
    fn test_energy_delta_without_wrap() {
        assert_eq!(fixed().delta(100, 350), Some(250));
    }

    #[test]
    fn test_energy_delta_across_wrap() {
        assert_eq!(fixed().delta(900, 50), Some(150));
    }

    #[test]
    fn test_energy_delta_wrap_with_unknown_range() {
        let meter = Fixed { energy: None, range: None };
        assert_eq!(meter.delta(900, 50), None);
    }

    #[test]
    fn test_snapshot_collects_every_source() {
        let telemetry =
            Telemetry { process: fixed(), system: fixed(), energy: fixed(), gpu: fixed(), gpu_count: 2 };

        let snapshot = telemetry.snapshot(Pid(1));
        assert_eq!(snapshot.process_time, Some(12));
        assert_eq!(snapshot.total_cpu_time, None);
        assert_eq!(snapshot.energy_uj, Some(500));
        assert_eq!(snapshot.gpu_watts, Some(50.0));
    }

    fn reading(process_time: u64, total_cpu_time: u64, energy_uj: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            process_time: Some(process_time),
            total_cpu_time: Some(total_cpu_time),
            energy_uj: Some(energy_uj),
            gpu_watts: None,
        }
    }

    fn telemetry() -> Telemetry {
        Telemetry { process: fixed(), system: fixed(), energy: fixed(), gpu: fixed(), gpu_count: 0 }
    }

    #[test]
    fn test_process_power_scales_energy_by_cpu_share() {
        // 400 uJ over half a second, target used a quarter of all CPU time
        let before = reading(10, 100, 100);
        let after = reading(20, 140, 500);

        let watts = telemetry().process_power(&before, &after, Duration::from_millis(500)).unwrap();
        assert!((watts - 0.0002).abs() < 1e-12, "got {watts}");
    }

    #[test]
    fn test_process_power_across_energy_wrap() {
        // Counter wrapped at 1000: 900 -> 100 is 200 uJ
        let before = reading(0, 0, 900);
        let after = reading(50, 50, 100);

        let watts = telemetry().process_power(&before, &after, Duration::from_secs(1)).unwrap();
        assert!((watts - 0.0002).abs() < 1e-12, "got {watts}");
    }

    #[test]
    fn test_process_power_needs_every_counter() {
        let before = reading(10, 100, 100);
        let mut after = reading(20, 140, 500);
        after.total_cpu_time = None;
        assert_eq!(telemetry().process_power(&before, &after, Duration::from_secs(1)), None);

        // Idle system clock
        let after = reading(10, 100, 500);
        assert_eq!(telemetry().process_power(&before, &after, Duration::from_secs(1)), None);

        let after = reading(20, 140, 500);
        assert_eq!(telemetry().process_power(&before, &after, Duration::ZERO), None);
    }

    #[test]
    fn test_snapshot_skips_gpu_when_none_requested() {
        let telemetry =
            Telemetry { process: fixed(), system: fixed(), energy: fixed(), gpu: fixed(), gpu_count: 0 };
        assert_eq!(telemetry.snapshot(Pid(1)).gpu_watts, None);
    }
}
