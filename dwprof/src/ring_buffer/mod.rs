//! # Ring-Buffer Record Reader
//!
//! The kernel appends sample records to a circular buffer shared with
//! userspace. The buffer is a single-producer/single-consumer queue driven by
//! two cursors in the header page:
//!
//! ```text
//!   header page                      data area (power of two bytes)
//! ┌─────────────────────┐   ┌────────────────────────────────────────┐
//! │ data_head (kernel)  │   │ ... │ tail ─── pending records ─── head │
//! │ data_tail (reader)  │   └────────────────────────────────────────┘
//! └─────────────────────┘
//! ```
//!
//! ## Memory Ordering
//!
//! - `data_head` is loaded with `Acquire`, so every record byte the kernel
//!   wrote before publishing the head is visible to the copy that follows.
//! - `data_tail` is stored with `Release` only after the copy completes, so
//!   the kernel cannot reuse space the reader is still copying out of.
//!
//! Cursors grow without bound; the byte position is `cursor % size`. A record
//! that straddles the end of the data area is copied in two slices.
//!
//! ## Record Types
//!
//! - `PERF_RECORD_SAMPLE` → [`RawSampleRecord`]
//! - `PERF_RECORD_LOST`, `PERF_RECORD_LOST_SAMPLES` → [`OverrunError`](crate::domain::OverrunError)
//! - everything else is skipped

#![allow(unsafe_code)] // shared memory with the kernel is accessed through raw pointers

pub mod heap;
pub mod reader;

use dwprof_common::{is_context_marker, MAX_CALLCHAIN_ENTRIES};
use std::sync::atomic::AtomicU64;

use crate::domain::CorruptRecord;

pub use heap::HeapRing;
pub use reader::{ReaderStats, RecordReader};

/// Memory shared between a record producer and a [`RecordReader`]
///
/// # Safety
///
/// Implementors guarantee that:
/// - `data_ptr()` points to `data_size()` readable bytes that stay mapped for
///   the lifetime of `self`,
/// - `data_size()` is a non-zero power of two,
/// - the producer only publishes `data_head` after the bytes below it are
///   fully written, and never overwrites bytes between `data_tail` and
///   `data_head`.
pub unsafe trait RingMemory {
    /// Producer write cursor
    fn data_head(&self) -> &AtomicU64;

    /// Consumer read cursor
    fn data_tail(&self) -> &AtomicU64;

    fn data_ptr(&self) -> *const u8;

    fn data_size(&self) -> usize;
}

// SAFETY: forwards to an implementation that upholds the contract
unsafe impl<M: RingMemory + ?Sized> RingMemory for &M {
    fn data_head(&self) -> &AtomicU64 {
        (**self).data_head()
    }

    fn data_tail(&self) -> &AtomicU64 {
        (**self).data_tail()
    }

    fn data_ptr(&self) -> *const u8 {
        (**self).data_ptr()
    }

    fn data_size(&self) -> usize {
        (**self).data_size()
    }
}

/// One callchain sample: instruction pointers, innermost frame first
///
/// Context markers (`PERF_CONTEXT_USER`, `PERF_CONTEXT_KERNEL`, ...) are
/// stripped, so every entry is a real address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSampleRecord {
    pub ips: Vec<u64>,
}

impl RawSampleRecord {
    /// Parse the body of a `PERF_SAMPLE_CALLCHAIN` sample: `u64 nr, u64 ips[nr]`
    ///
    /// # Errors
    /// Rejects a body too short for its count and any count above
    /// [`MAX_CALLCHAIN_ENTRIES`]
    pub fn parse(body: &[u8]) -> Result<Self, CorruptRecord> {
        let nr = read_u64(body, 0)
            .ok_or(CorruptRecord::Truncated { size: 8, available: body.len() })?;

        if nr > MAX_CALLCHAIN_ENTRIES as u64 {
            return Err(CorruptRecord::CallchainTooDeep { nr, max: MAX_CALLCHAIN_ENTRIES });
        }

        // nr is bounded above, so this cannot overflow
        #[allow(clippy::cast_possible_truncation)]
        let end = 8 + nr as usize * 8;
        let entries =
            body.get(8..end).ok_or(CorruptRecord::CallchainOverflow { nr, body: body.len() })?;

        let ips = entries
            .chunks_exact(8)
            .filter_map(|chunk| chunk.try_into().ok().map(u64::from_ne_bytes))
            .filter(|&ip| !is_context_marker(ip))
            .collect();

        Ok(Self { ips })
    }

    /// Encode as a sample body, the inverse of [`RawSampleRecord::parse`]
    #[must_use]
    pub fn encode(ips: &[u64]) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + ips.len() * 8);
        body.extend_from_slice(&(ips.len() as u64).to_ne_bytes());
        for ip in ips {
            body.extend_from_slice(&ip.to_ne_bytes());
        }
        body
    }
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(raw))
}
