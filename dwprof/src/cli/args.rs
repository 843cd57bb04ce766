//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::format::ChainOrder;
use crate::profiling::{EventSource, SamplerConfig};

/// Frame order of printed chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    /// Sampled function first
    Inner,
    /// Entry point first (collapsed-stack order)
    Outer,
}

/// Sampling clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    /// Software CPU clock, available everywhere
    CpuClock,
    /// Hardware cycle counter
    Cycles,
}

#[derive(Parser, Debug)]
#[command(
    name = "dwprof",
    about = "Sample call stacks of a running process and correlate them with energy use",
    after_help = "\
EXAMPLES:
    sudo dwprof --pid 1234                         Print one chain per sample
    sudo dwprof --pid 1234 --order outer --batch   Collapsed-stack order, one line per poll
    sudo dwprof --pid 1234 --export s.jsonl --gpus 1 --duration 30"
)]
pub struct Args {
    /// Process ID to profile
    #[arg(short, long)]
    pub pid: i32,

    /// Samples per second per thread
    #[arg(short = 'F', long, default_value = "99")]
    pub frequency: u64,

    /// Ring buffer data pages per thread (power of two)
    #[arg(long, default_value = "64")]
    pub pages: usize,

    /// What drives sampling
    #[arg(long, value_enum, default_value = "cpu-clock")]
    pub event: EventArg,

    /// Also sample kernel frames
    #[arg(long)]
    pub kernel: bool,

    /// Frame order of printed chains
    #[arg(long, value_enum, default_value = "inner")]
    pub order: OrderArg,

    /// Print every chain drained in one poll on a single line, each followed by '|'
    #[arg(long)]
    pub batch: bool,

    /// Export samples with telemetry as JSON lines
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// GPUs to include in power readings (0 = skip GPU telemetry)
    #[arg(long, default_value = "0")]
    pub gpus: usize,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Don't print chains or the startup banner
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            frequency_hz: self.frequency,
            data_pages: self.pages,
            event: match self.event {
                EventArg::CpuClock => EventSource::CpuClock,
                EventArg::Cycles => EventSource::CpuCycles,
            },
            include_kernel: self.kernel,
        }
    }

    #[must_use]
    pub fn chain_order(&self) -> ChainOrder {
        match self.order {
            OrderArg::Inner => ChainOrder::InnermostFirst,
            OrderArg::Outer => ChainOrder::OutermostFirst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sampler_defaults() {
        let args = Args::try_parse_from(["dwprof", "--pid", "1234"]).unwrap();
        assert_eq!(args.pid, 1234);
        assert_eq!(args.sampler_config(), SamplerConfig::default());
        assert_eq!(args.chain_order(), ChainOrder::InnermostFirst);
        assert!(args.export.is_none());
    }

    #[test]
    fn test_all_flags() {
        let args = Args::try_parse_from([
            "dwprof", "-p", "7", "-F", "499", "--pages", "16", "--event", "cycles", "--kernel",
            "--order", "outer", "--batch", "--export", "out.jsonl", "--gpus", "2", "--quiet",
        ])
        .unwrap();

        let config = args.sampler_config();
        assert_eq!(config.frequency_hz, 499);
        assert_eq!(config.data_pages, 16);
        assert_eq!(config.event, EventSource::CpuCycles);
        assert!(config.include_kernel);
        assert_eq!(args.chain_order(), ChainOrder::OutermostFirst);
        assert!(args.batch);
        assert_eq!(args.export, Some(PathBuf::from("out.jsonl")));
        assert_eq!(args.gpus, 2);
        assert!(args.quiet);
    }

    #[test]
    fn test_pid_is_required() {
        assert!(Args::try_parse_from(["dwprof"]).is_err());
    }
}
