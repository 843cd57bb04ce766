//! Sampling event setup through `perf_event_open(2)`
//!
//! One [`PerfEvent`] samples one thread: the kernel walks the user call stack
//! on every sample and appends it to a ring buffer mapped into this process.
//! The mapping is `1 + 2^n` pages, a header page with the cursors followed by
//! the data area, and implements [`RingMemory`] so a
//! [`RecordReader`](crate::ring_buffer::RecordReader) can drain it.

#![allow(unsafe_code)] // perf_event_open, mmap and ioctl are raw syscalls

use dwprof_common::{
    PerfEventAttr, ATTR_FLAG_DISABLED, ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL,
    ATTR_FLAG_EXCLUDE_HV, ATTR_FLAG_EXCLUDE_KERNEL, ATTR_FLAG_FREQ, DATA_HEAD_OFFSET,
    DATA_TAIL_OFFSET, PERF_ATTR_SIZE_VER5, PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_SW_CPU_CLOCK,
    PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_FLAG_FD_CLOEXEC, PERF_SAMPLE_CALLCHAIN,
    PERF_TYPE_HARDWARE, PERF_TYPE_SOFTWARE,
};
use log::{debug, info};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU64;

use crate::domain::{PerfError, Tid};
use crate::ring_buffer::RingMemory;

/// What drives the sampling clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSource {
    /// Software CPU clock; works in VMs and containers without a PMU
    #[default]
    CpuClock,
    /// Hardware cycle counter
    CpuCycles,
}

/// Sampling parameters shared by every per-thread event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    pub frequency_hz: u64,
    /// Data area size in pages, a power of two
    pub data_pages: usize,
    pub event: EventSource,
    /// Also sample while the thread runs in the kernel
    pub include_kernel: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { frequency_hz: 99, data_pages: 64, event: EventSource::CpuClock, include_kernel: false }
    }
}

impl SamplerConfig {
    /// Attribute block handed to `perf_event_open`
    ///
    /// Events start disabled; call [`PerfEvent::enable`] once every thread has
    /// its ring buffer.
    #[must_use]
    pub fn attr(&self) -> PerfEventAttr {
        let (kind, config) = match self.event {
            EventSource::CpuClock => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
            EventSource::CpuCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        };

        let mut flags = ATTR_FLAG_DISABLED | ATTR_FLAG_FREQ | ATTR_FLAG_EXCLUDE_HV;
        if !self.include_kernel {
            flags |= ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL;
        }

        PerfEventAttr {
            kind,
            size: PERF_ATTR_SIZE_VER5,
            config,
            sample_period_or_freq: self.frequency_hz,
            sample_type: PERF_SAMPLE_CALLCHAIN,
            flags,
            // Wake on every sample; the reader polls anyway
            wakeup_events: 1,
            ..PerfEventAttr::default()
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// An open sampling event and its mapped ring buffer
///
/// Dropping it unmaps the buffer and closes the fd.
#[derive(Debug)]
pub struct PerfEvent {
    tid: Tid,
    fd: OwnedFd,
    base: NonNull<u8>,
    mmap_len: usize,
    page_size: usize,
}

impl PerfEvent {
    /// Open a callchain sampling event on one thread and map its ring buffer
    ///
    /// # Errors
    /// - [`PerfError::InvalidPageCount`] if `config.data_pages` is not a power
    ///   of two
    /// - [`PerfError::Open`] if the kernel refuses the event (permissions,
    ///   `perf_event_paranoid`, thread gone)
    /// - [`PerfError::Mmap`] if the ring buffer cannot be mapped
    pub fn open(tid: Tid, config: &SamplerConfig) -> Result<Self, PerfError> {
        if !config.data_pages.is_power_of_two() {
            return Err(PerfError::InvalidPageCount(config.data_pages));
        }

        let attr = config.attr();
        // SAFETY: attr is a valid PERF_ATTR_SIZE_VER5 block that outlives the
        // call; cpu -1 with a concrete tid follows that thread on any CPU.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                ptr::from_ref(&attr),
                tid.0,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
            )
        };
        let raw_fd = i32::try_from(ret).unwrap_or(-1);
        if raw_fd < 0 {
            return Err(PerfError::Open { tid, source: io::Error::last_os_error() });
        }
        // SAFETY: the kernel just returned this fd and nothing else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let page_size = page_size();
        let mmap_len = (config.data_pages + 1) * page_size;
        // Read/write so our data_tail stores reach the kernel, which then
        // refuses to overwrite unread records instead of silently lapping us
        // SAFETY: mapping a perf fd with a 1 + 2^n page length is the
        // documented interface; the result is checked before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            // fd is closed when it drops here
            return Err(PerfError::Mmap(io::Error::last_os_error()));
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| PerfError::Mmap(io::Error::other("mmap returned null")))?;

        debug!(
            "Opened perf event for {tid}: fd {}, {} data pages at {:p}",
            fd.as_raw_fd(),
            config.data_pages,
            base
        );

        Ok(Self { tid, fd, base, mmap_len, page_size })
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Start sampling
    ///
    /// # Errors
    /// Returns [`PerfError::Ioctl`] if the kernel rejects the request
    pub fn enable(&self) -> Result<(), PerfError> {
        self.ioctl(PERF_EVENT_IOC_ENABLE)?;
        info!("Sampling enabled for {}", self.tid);
        Ok(())
    }

    /// Stop sampling; records already in the ring stay readable
    ///
    /// # Errors
    /// Returns [`PerfError::Ioctl`] if the kernel rejects the request
    pub fn disable(&self) -> Result<(), PerfError> {
        self.ioctl(PERF_EVENT_IOC_DISABLE)
    }

    fn ioctl(&self, request: u64) -> Result<(), PerfError> {
        // SAFETY: fd is a live perf event and these requests take no argument
        #[allow(clippy::cast_possible_truncation)]
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, 0) };
        if ret < 0 {
            return Err(PerfError::Ioctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn header_field(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: the header page is mapped for self's lifetime, the cursor
        // offsets are 8-byte aligned within it, and the kernel only ever
        // accesses them atomically.
        unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU64>() }
    }
}

// SAFETY: the data area starts one page past the header and spans
// `mmap_len - page_size` bytes, a power of two of pages; the kernel publishes
// data_head only after writing the records below it and, in read/write
// mapping mode, never writes past data_tail.
unsafe impl RingMemory for PerfEvent {
    fn data_head(&self) -> &AtomicU64 {
        self.header_field(DATA_HEAD_OFFSET)
    }

    fn data_tail(&self) -> &AtomicU64 {
        self.header_field(DATA_TAIL_OFFSET)
    }

    fn data_ptr(&self) -> *const u8 {
        // SAFETY: page_size < mmap_len
        unsafe { self.base.as_ptr().add(self.page_size) }
    }

    fn data_size(&self) -> usize {
        self.mmap_len - self.page_size
    }
}

impl Drop for PerfEvent {
    fn drop(&mut self) {
        // SAFETY: base/mmap_len describe the mapping created in open, and no
        // borrow of it can outlive self
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.mmap_len);
        }
        debug!("Closed perf event for {}", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attr_samples_user_callchains() {
        let attr = SamplerConfig::default().attr();
        assert_eq!(attr.kind, PERF_TYPE_SOFTWARE);
        assert_eq!(attr.config, PERF_COUNT_SW_CPU_CLOCK);
        assert_eq!(attr.size, PERF_ATTR_SIZE_VER5);
        assert_eq!(attr.sample_period_or_freq, 99);
        assert_eq!(attr.sample_type, PERF_SAMPLE_CALLCHAIN);
        assert_ne!(attr.flags & ATTR_FLAG_FREQ, 0);
        assert_ne!(attr.flags & ATTR_FLAG_DISABLED, 0);
        assert_ne!(attr.flags & ATTR_FLAG_EXCLUDE_KERNEL, 0);
    }

    #[test]
    fn test_kernel_sampling_clears_exclusions() {
        let config = SamplerConfig {
            include_kernel: true,
            event: EventSource::CpuCycles,
            ..SamplerConfig::default()
        };
        let attr = config.attr();
        assert_eq!(attr.kind, PERF_TYPE_HARDWARE);
        assert_eq!(attr.flags & ATTR_FLAG_EXCLUDE_KERNEL, 0);
        assert_eq!(attr.flags & ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL, 0);
    }

    #[test]
    fn test_rejects_non_power_of_two_pages() {
        let config = SamplerConfig { data_pages: 3, ..SamplerConfig::default() };
        let err = PerfEvent::open(Tid(1), &config).unwrap_err();
        assert!(matches!(err, PerfError::InvalidPageCount(3)));
    }

    #[test]
    fn test_open_on_own_thread() {
        // SAFETY: gettid has no preconditions
        let tid = Tid(unsafe { libc::gettid() });
        let config = SamplerConfig { data_pages: 8, ..SamplerConfig::default() };

        let event = match PerfEvent::open(tid, &config) {
            Ok(event) => event,
            // perf_event_paranoid, a sandbox or RLIMIT_MEMLOCK may forbid it
            Err(PerfError::Open { .. } | PerfError::Mmap(_)) => return,
            Err(other) => panic!("unexpected error: {other}"),
        };

        assert_eq!(event.tid(), tid);
        assert_eq!(event.data_size(), 8 * page_size());
        assert!(event.enable().is_ok());
        assert!(event.disable().is_ok());
    }

    #[test]
    fn test_drain_while_another_thread_is_sampled() {
        use crate::domain::ReadError;
        use crate::ring_buffer::RecordReader;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{mpsc, Arc};
        use std::time::{Duration, Instant};

        let start = Arc::new(AtomicBool::new(false));
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = {
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                // SAFETY: gettid has no preconditions
                tid_tx.send(Tid(unsafe { libc::gettid() })).unwrap();
                while !start.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                let spin_until = Instant::now() + Duration::from_millis(300);
                let mut acc = 0u64;
                while Instant::now() < spin_until {
                    acc = std::hint::black_box(acc.wrapping_mul(31).wrapping_add(7));
                }
                acc
            })
        };

        let tid = tid_rx.recv().unwrap();
        let config = SamplerConfig { frequency_hz: 1000, data_pages: 8, ..SamplerConfig::default() };
        let event = match PerfEvent::open(tid, &config) {
            Ok(event) => event,
            // perf_event_paranoid, a sandbox or RLIMIT_MEMLOCK may forbid it
            Err(PerfError::Open { .. } | PerfError::Mmap(_)) => {
                start.store(true, Ordering::Release);
                worker.join().unwrap();
                return;
            }
            Err(other) => panic!("unexpected error: {other}"),
        };
        event.enable().unwrap();
        start.store(true, Ordering::Release);

        // Drain concurrently with the kernel writing on the worker's behalf
        let mut reader = RecordReader::new(event);
        let mut samples = Vec::new();
        let mut drain = |reader: &mut RecordReader<PerfEvent>| loop {
            match reader.next_record() {
                Ok(Some(record)) => samples.push(record),
                Ok(None) => break,
                Err(ReadError::Overrun(_)) => {}
                Err(ReadError::Corrupt(err)) => panic!("kernel record rejected: {err}"),
            }
        };
        while !worker.is_finished() {
            drain(&mut reader);
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.join().unwrap();
        reader.ring().disable().unwrap();
        drain(&mut reader);

        assert!(!samples.is_empty(), "no samples in 300ms of spinning at 1000 Hz");
        assert!(samples.iter().any(|record| !record.ips.is_empty()));
        assert_eq!(reader.stats().corrupt, 0);
    }
}
