//! In-process ring with a kernel-like producer
//!
//! [`HeapRing`] lays records out exactly as the kernel does in a perf mmap
//! area, which makes it usable for replaying recorded sample streams and for
//! exercising the reader's wraparound and overrun paths without
//! `perf_event_open` privileges.

use dwprof_common::{RecordHeader, PERF_RECORD_LOST, PERF_RECORD_SAMPLE, RECORD_HEADER_SIZE};
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RawSampleRecord, RingMemory};

/// Size of a `PERF_RECORD_LOST` record: header, `u64 id`, `u64 lost`
const LOST_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 16;

pub struct HeapRing {
    data_head: AtomicU64,
    data_tail: AtomicU64,
    data: Box<[UnsafeCell<u8>]>,
    /// Producer cursor; bytes below it but above `data_head` are unpublished
    staged: Cell<u64>,
    /// Records dropped since the last LOST record was emitted
    pending_lost: Cell<u64>,
}

impl HeapRing {
    /// Ring with at least `capacity` bytes of data area
    ///
    /// The capacity is rounded up to a power of two, as perf requires.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_cursor(capacity, 0)
    }

    /// Ring whose cursors both start at `start`
    ///
    /// Starting just short of a multiple of the capacity places the first
    /// records across the end of the data area.
    #[must_use]
    pub fn with_cursor(capacity: usize, start: u64) -> Self {
        let size = capacity.max(RECORD_HEADER_SIZE).next_power_of_two();
        Self {
            data_head: AtomicU64::new(start),
            data_tail: AtomicU64::new(start),
            data: (0..size).map(|_| UnsafeCell::new(0)).collect(),
            staged: Cell::new(start),
            pending_lost: Cell::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn head(&self) -> u64 {
        self.data_head.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tail(&self) -> u64 {
        self.data_tail.load(Ordering::Acquire)
    }

    /// Bytes the producer may still write before reaching the reader
    #[must_use]
    pub fn free_space(&self) -> usize {
        let used = self.staged.get().wrapping_sub(self.tail());
        usize::try_from(used).map_or(0, |used| self.capacity().saturating_sub(used))
    }

    /// Records dropped and not yet reported through a LOST record
    #[must_use]
    pub fn pending_lost(&self) -> u64 {
        self.pending_lost.get()
    }

    /// Append a callchain sample, innermost address first
    ///
    /// Returns false when the ring was full and the sample was dropped.
    pub fn push_sample(&self, ips: &[u64]) -> bool {
        self.push_record(PERF_RECORD_SAMPLE, &RawSampleRecord::encode(ips))
    }

    /// Append one record the way the kernel does
    ///
    /// A record that does not fit is dropped and counted. The next record that
    /// fits is preceded by a `PERF_RECORD_LOST` carrying that count.
    pub fn push_record(&self, kind: u32, body: &[u8]) -> bool {
        let size = RECORD_HEADER_SIZE + body.len();
        let lost = self.pending_lost.get();
        let needed = if lost > 0 { size + LOST_RECORD_SIZE } else { size };

        let Ok(header_size) = u16::try_from(size) else {
            self.pending_lost.set(lost + 1);
            return false;
        };
        if needed > self.free_space() {
            self.pending_lost.set(lost + 1);
            return false;
        }

        if lost > 0 {
            self.write_lost(lost);
            self.pending_lost.set(0);
        }

        let header = RecordHeader { kind, misc: 0, size: header_size };
        self.write(&header.to_bytes());
        self.write(body);
        self.publish();
        true
    }

    /// Append a `PERF_RECORD_LOST` record reporting `lost` dropped records
    pub fn push_lost(&self, lost: u64) {
        self.write_lost(lost);
        self.publish();
    }

    /// Append bytes verbatim, with no header
    pub fn push_raw(&self, bytes: &[u8]) {
        self.write(bytes);
        self.publish();
    }

    /// Move the write cursor without writing, as a producer that lapped the
    /// reader would
    pub fn force_head(&self, head: u64) {
        self.staged.set(head);
        self.publish();
    }

    fn write_lost(&self, lost: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let header =
            RecordHeader { kind: PERF_RECORD_LOST, misc: 0, size: LOST_RECORD_SIZE as u16 };
        self.write(&header.to_bytes());
        self.write(&0u64.to_ne_bytes());
        self.write(&lost.to_ne_bytes());
    }

    fn write(&self, bytes: &[u8]) {
        let mask = self.capacity() - 1;
        let mut cursor = self.staged.get();
        for &byte in bytes {
            #[allow(clippy::cast_possible_truncation)]
            let idx = cursor as usize & mask;
            // SAFETY: idx is masked into the data area, and the reader only
            // copies published bytes, which the free-space check keeps clear
            unsafe { *self.data[idx].get() = byte };
            cursor = cursor.wrapping_add(1);
        }
        self.staged.set(cursor);
    }

    fn publish(&self) {
        self.data_head.store(self.staged.get(), Ordering::Release);
    }
}

// SAFETY: the data area is a non-empty power of two owned by `self`; records
// are written before `publish` stores `data_head` with Release, and writes are
// refused once they would cross `data_tail`.
unsafe impl RingMemory for HeapRing {
    fn data_head(&self) -> &AtomicU64 {
        &self.data_head
    }

    fn data_tail(&self) -> &AtomicU64 {
        &self.data_tail
    }

    fn data_ptr(&self) -> *const u8 {
        // UnsafeCell<u8> has the same layout as u8
        self.data.as_ptr().cast::<u8>()
    }

    fn data_size(&self) -> usize {
        self.data.len()
    }
}
