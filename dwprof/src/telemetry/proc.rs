//! CPU accounting from /proc

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs;
use std::path::PathBuf;

use super::{ProcessClock, SystemClock};
use crate::domain::Pid;

/// Reads `/proc/<pid>/stat` and `/proc/stat`
#[derive(Debug, Clone)]
pub struct ProcStat {
    proc_root: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self { proc_root: PathBuf::from("/proc") }
    }
}

impl ProcStat {
    /// Read from an alternative procfs mount
    #[must_use]
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }
}

impl ProcessClock for ProcStat {
    fn process_time(&self, pid: Pid) -> Option<u64> {
        let path = self.proc_root.join(pid.0.to_string()).join("stat");
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .and_then(|stat| parse_process_time(&stat))
            .map_err(|e| debug!("No process time for {pid}: {e:#}"))
            .ok()
    }
}

impl SystemClock for ProcStat {
    fn total_cpu_time(&self) -> Option<u64> {
        let path = self.proc_root.join("stat");
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .and_then(|stat| parse_total_cpu_time(&stat))
            .map_err(|e| debug!("No system CPU time: {e:#}"))
            .ok()
    }
}

/// `utime + stime` from the contents of `/proc/<pid>/stat`
///
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last `)`.
///
/// # Errors
/// Returns an error if the line is malformed
pub fn parse_process_time(stat: &str) -> Result<u64> {
    let (_, rest) = stat.rsplit_once(')').context("Missing ')' after command name")?;

    // rest starts at field 3 (state); utime and stime are fields 14 and 15
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next().context("Missing utime")?.parse().context("Bad utime")?;
    let stime: u64 = fields.next().context("Missing stime")?.parse().context("Bad stime")?;

    Ok(utime + stime)
}

/// Sum of the aggregate `cpu` line of `/proc/stat`
///
/// # Errors
/// Returns an error if no aggregate line is present or a field is not a number
pub fn parse_total_cpu_time(stat: &str) -> Result<u64> {
    let Some(line) = stat.lines().find(|line| line.starts_with("cpu ")) else {
        bail!("No aggregate cpu line in /proc/stat");
    };

    line.split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>().with_context(|| format!("Bad cpu field '{field}'")))
        .sum()
}
