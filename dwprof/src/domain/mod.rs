//! Domain model for dwprof
//!
//! Core domain types and errors shared by every pipeline stage:
//! - Newtype wrappers for process/thread identifiers
//! - Typed errors for attach, ring buffer, perf setup and export failures

pub mod errors;
pub mod types;

pub use types::{Pid, Tid};

pub use errors::{
    AttachError, CaptureError, CorruptRecord, ExportError, OverrunError, PerfError, ReadError,
};
