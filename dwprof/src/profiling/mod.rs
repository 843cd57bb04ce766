//! Profiling core modules
//!
//! - Per-thread perf sampling events and their ring buffers
//! - Thread discovery

pub mod perf_event;
pub mod threads;

pub use perf_event::{EventSource, PerfEvent, SamplerConfig};
pub use threads::{list_threads, ThreadInfo, ThreadTracker};
