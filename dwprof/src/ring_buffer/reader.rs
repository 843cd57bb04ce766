use dwprof_common::{
    RecordHeader, PERF_RECORD_LOST, PERF_RECORD_LOST_SAMPLES, PERF_RECORD_SAMPLE,
    RECORD_HEADER_SIZE,
};
use log::{debug, trace, warn};
use std::ptr;
use std::sync::atomic::Ordering;

use super::{read_u64, RawSampleRecord, RingMemory};
use crate::domain::{CorruptRecord, OverrunError, ReadError};

/// Counters accumulated over a reader's life
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub batches: u64,
    pub samples: u64,
    pub lost: u64,
    pub overruns: u64,
    pub corrupt: u64,
    pub skipped: u64,
}

enum Parsed {
    Sample(RawSampleRecord),
    Lost(u64),
    Skipped,
}

/// Consumer side of a perf ring buffer
///
/// Each time its local batch is exhausted the reader copies everything the
/// producer published since the last copy, then hands out records one at a
/// time. Reading never blocks: an empty ring yields `Ok(None)`.
pub struct RecordReader<M: RingMemory> {
    ring: M,
    batch: Vec<u8>,
    pos: usize,
    new_batch: bool,
    stats: ReaderStats,
}

impl<M: RingMemory> RecordReader<M> {
    pub fn new(ring: M) -> Self {
        Self { ring, batch: Vec::new(), pos: 0, new_batch: false, stats: ReaderStats::default() }
    }

    /// Next callchain sample, if one is pending
    ///
    /// # Errors
    /// - [`ReadError::Overrun`] when the producer reports lost records, or the
    ///   reader finds itself lapped. The reader stays usable.
    /// - [`ReadError::Corrupt`] when a record fails validation. That record is
    ///   skipped; a corrupt header discards the rest of the batch.
    pub fn next_record(&mut self) -> Result<Option<RawSampleRecord>, ReadError> {
        loop {
            if self.pos >= self.batch.len() && !self.fill()? {
                return Ok(None);
            }

            match self.parse_next()? {
                Parsed::Sample(record) => {
                    self.stats.samples += 1;
                    return Ok(Some(record));
                }
                Parsed::Lost(lost) => {
                    self.stats.lost += lost;
                    self.stats.overruns += 1;
                    warn!("Kernel dropped {lost} records, reader fell behind");
                    return Err(OverrunError { lost: Some(lost) }.into());
                }
                Parsed::Skipped => {
                    self.stats.skipped += 1;
                }
            }
        }
    }

    /// Returns true once after every new batch copied out of the ring
    pub fn batch_started(&mut self) -> bool {
        std::mem::take(&mut self.new_batch)
    }

    /// Bytes of the current batch not yet handed out
    #[must_use]
    pub fn pending_in_batch(&self) -> usize {
        self.batch.len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    #[must_use]
    pub fn ring(&self) -> &M {
        &self.ring
    }

    /// Copy every published byte into the local batch and release it
    fn fill(&mut self) -> Result<bool, ReadError> {
        let size = self.ring.data_size();
        let head = self.ring.data_head().load(Ordering::Acquire);
        let tail = self.ring.data_tail().load(Ordering::Relaxed);

        self.batch.clear();
        self.pos = 0;

        if head == tail {
            return Ok(false);
        }

        let pending = head.wrapping_sub(tail);
        if pending > size as u64 {
            // The producer wrote over data we never read; skip to its cursor
            self.ring.data_tail().store(head, Ordering::Release);
            self.stats.overruns += 1;
            warn!("Reader lapped by producer ({pending} bytes pending, ring holds {size})");
            return Err(OverrunError { lost: None }.into());
        }

        // pending <= size, which is a usize
        #[allow(clippy::cast_possible_truncation)]
        let pending = pending as usize;
        #[allow(clippy::cast_possible_truncation)]
        let start = (tail & (size as u64 - 1)) as usize;
        let first = pending.min(size - start);

        self.batch.resize(pending, 0);
        let data = self.ring.data_ptr();
        // SAFETY: `start + first <= size` and `pending - first < size`, both
        // slices lie inside the data area, and the producer does not touch
        // bytes between tail and head until the tail store below.
        unsafe {
            ptr::copy_nonoverlapping(data.add(start), self.batch.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(data, self.batch.as_mut_ptr().add(first), pending - first);
        }

        self.ring.data_tail().store(head, Ordering::Release);

        self.new_batch = true;
        self.stats.batches += 1;
        trace!("Copied {pending} bytes (tail 0x{tail:x} -> head 0x{head:x})");
        Ok(true)
    }

    fn parse_next(&mut self) -> Result<Parsed, ReadError> {
        let available = self.batch.len() - self.pos;

        let Some(header_bytes) = self.batch.get(self.pos..self.pos + RECORD_HEADER_SIZE) else {
            return Err(self.reject_batch(CorruptRecord::Truncated {
                size: RECORD_HEADER_SIZE,
                available,
            }));
        };
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw.copy_from_slice(header_bytes);
        let header = RecordHeader::from_bytes(raw);

        let size = usize::from(header.size);
        if size < RECORD_HEADER_SIZE {
            return Err(self.reject_batch(CorruptRecord::HeaderTooSmall { size }));
        }
        if size > available {
            return Err(self.reject_batch(CorruptRecord::Truncated { size, available }));
        }

        let body = &self.batch[self.pos + RECORD_HEADER_SIZE..self.pos + size];
        let parsed = match header.kind {
            PERF_RECORD_SAMPLE => RawSampleRecord::parse(body).map(Parsed::Sample),
            // struct { u64 id; u64 lost; }
            PERF_RECORD_LOST => Ok(Parsed::Lost(read_u64(body, 8).unwrap_or(0))),
            // struct { u64 lost; }
            PERF_RECORD_LOST_SAMPLES => Ok(Parsed::Lost(read_u64(body, 0).unwrap_or(0))),
            other => {
                trace!("Skipping record type {other} ({size} bytes)");
                Ok(Parsed::Skipped)
            }
        };
        self.pos += size;

        parsed.map_err(|err| {
            self.stats.corrupt += 1;
            debug!("Rejected sample record: {err}");
            ReadError::Corrupt(err)
        })
    }

    /// Drop the rest of the batch after a header could not be trusted
    fn reject_batch(&mut self, err: CorruptRecord) -> ReadError {
        self.stats.corrupt += 1;
        warn!("Discarding {} bytes after corrupt record header: {err}", self.pending_in_batch());
        self.pos = self.batch.len();
        ReadError::Corrupt(err)
    }
}
