//! Pre-flight checks for dwprof
//!
//! Validates system requirements before opening perf events.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::domain::Pid;

const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

/// Highest `perf_event_paranoid` level that still lets an unprivileged user
/// sample user-space call stacks of their own processes
const MAX_UNPRIVILEGED_PARANOID: i32 = 2;

/// Run all pre-flight checks before attaching
///
/// # Errors
/// Returns an error naming the first unmet requirement
pub fn run_preflight_checks(pid: Pid) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    check_perf_permissions()?;
    Ok(())
}

/// Check that perf sampling is allowed for the current user
fn check_perf_permissions() -> Result<()> {
    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    let content = std::fs::read_to_string(PARANOID_PATH)
        .with_context(|| format!("Failed to read {PARANOID_PATH}"))?;
    let level = parse_paranoid(&content)?;

    if level > MAX_UNPRIVILEGED_PARANOID {
        bail!(
            "Permission denied: perf_event_paranoid is {level}.\n\n\
             Run with sudo, or allow user-space sampling with:\n  \
             sudo sysctl kernel.perf_event_paranoid={MAX_UNPRIVILEGED_PARANOID}"
        );
    }
    Ok(())
}

fn parse_paranoid(content: &str) -> Result<i32> {
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid perf_event_paranoid value '{}'", content.trim()))
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let pid = pid.0;
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let pid = pid.0;
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}
