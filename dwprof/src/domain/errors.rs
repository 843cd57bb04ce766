//! Structured error types for dwprof
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Unresolved symbols are deliberately absent: they are data (null frame
//! fields), not failures.

use super::types::{Pid, Tid};
use thiserror::Error;

/// Cannot open or refresh the target process's module view.
///
/// Fatal to the session. Never retried internally since the process may
/// legitimately have restarted under a new pid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("Permission denied reading the address space of process {0}")]
    PermissionDenied(Pid),

    #[error("Failed to read /proc/{}/maps: {reason}", .pid.0)]
    MapsUnreadable { pid: Pid, reason: String },
}

impl AttachError {
    /// Classify an I/O failure from `/proc/<pid>/*`
    #[must_use]
    pub fn from_io(pid: Pid, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ProcessNotFound(pid),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(pid),
            _ if err.raw_os_error() == Some(libc::ESRCH) => Self::ProcessNotFound(pid),
            _ => Self::MapsUnreadable { pid, reason: err.to_string() },
        }
    }
}

/// The kernel dropped samples between two reads.
///
/// Non-fatal: the reader stays usable and subsequent records are valid.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Ring buffer overrun: {}", describe_loss(*.lost))]
pub struct OverrunError {
    /// Records the kernel reported as lost, `None` when the reader detected
    /// that it was lapped without a loss record.
    pub lost: Option<u64>,
}

fn describe_loss(lost: Option<u64>) -> String {
    match lost {
        Some(lost) => format!("{lost} records lost"),
        None => "reader lapped by the kernel".to_string(),
    }
}

/// A record failed validation and was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptRecord {
    #[error("Record header declares {size} bytes, smaller than the header itself")]
    HeaderTooSmall { size: usize },

    #[error("Record declares {size} bytes but only {available} are pending")]
    Truncated { size: usize, available: usize },

    #[error("Callchain declares {nr} entries, above the {max} entry limit")]
    CallchainTooDeep { nr: u64, max: usize },

    #[error("Callchain declares {nr} entries but the record body holds {body} bytes")]
    CallchainOverflow { nr: u64, body: usize },
}

/// Errors surfaced by [`crate::ring_buffer::RecordReader::next_record`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error(transparent)]
    Overrun(#[from] OverrunError),

    #[error(transparent)]
    Corrupt(#[from] CorruptRecord),
}

/// Errors surfaced by [`crate::capture::capture_chain`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Overrun(OverrunError),

    #[error(transparent)]
    Corrupt(CorruptRecord),
}

impl From<ReadError> for CaptureError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Overrun(e) => Self::Overrun(e),
            ReadError::Corrupt(e) => Self::Corrupt(e),
        }
    }
}

/// Failures while setting up a perf sampling event
#[derive(Error, Debug)]
pub enum PerfError {
    #[error("perf_event_open failed for {tid}: {source}")]
    Open {
        tid: Tid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to mmap perf ring buffer: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("perf ioctl failed: {0}")]
    Ioctl(#[source] std::io::Error),

    #[error("Ring buffer size must be a power of two number of pages, got {0}")]
    InvalidPageCount(usize),
}

/// Failures while writing exported samples
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to create export file {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
