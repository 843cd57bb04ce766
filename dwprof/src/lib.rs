//! # dwprof - Call-Chain Sampling Profiler
//!
//! dwprof samples the call stacks of a running process through the kernel's
//! perf ring buffer and turns every sample into a symbolic stack trace, with
//! no cooperation from the target and no debugger attached. Samples can be
//! correlated with CPU time, package energy and GPU power.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Target Process                            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ perf_event_open (one event per thread)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Kernel: PERF_SAMPLE_CALLCHAIN records                │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ mmap'd ring buffer
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    dwprof (This Crate)                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Ring Buffer  │──▶│  Symbolizer  │──▶│    Format    │──▶ out  │
//! │  │   Reader     │   │ (DWARF/ELF)  │   │  (a;b;c)     │         │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘         │
//! │                            │                                    │
//! │                     ┌──────▼───────┐   ┌──────────────┐         │
//! │                     │   Session    │   │  Telemetry   │         │
//! │                     │  (modules)   │   │ (/proc,/sys) │         │
//! │                     └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`ring_buffer`]: lock-free reader for the kernel's record ring, plus an
//!   in-process ring with the same layout
//! - [`session`]: live module map of the target, debug-info handles and the
//!   resolved-frame cache
//! - [`symbolization`]: address → module → function, line and inline chain
//! - [`format`]: deterministic chain rendering
//! - [`capture`]: one call from ring buffer to rendered chain
//! - [`profiling`]: perf event setup and thread discovery
//! - [`telemetry`]: CPU time, energy and GPU power collaborators
//! - [`export`]: JSON-lines sample writer
//! - [`cli`], [`preflight`]: the `dwprof` binary's front end
//! - [`domain`]: identifiers and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Print one chain per sample
//! sudo ./dwprof --pid <PID>
//!
//! # Collapsed-stack order with energy and GPU power, for offline analysis
//! sudo ./dwprof --pid <PID> --order outer --export samples.jsonl --gpus 1
//! ```

pub mod capture;
pub mod cli;
pub mod domain;
pub mod export;
pub mod format;
pub mod preflight;
pub mod profiling;
pub mod ring_buffer;
pub mod session;
pub mod symbolization;
pub mod telemetry;

pub use capture::{capture_batch, capture_chain, capture_chain_with, CapturedBatch};
pub use format::{format_batch, format_chain, ChainFormatter, ChainOrder, NO_CALLCHAIN};
pub use session::Session;
