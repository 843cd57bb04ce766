//! # Shared perf ABI definitions (Kernel ↔ Userspace)
//!
//! Constants and `#[repr(C)]` layouts for the parts of the Linux
//! `perf_event_open(2)` interface dwprof relies on. Everything here mirrors
//! `include/uapi/linux/perf_event.h`; keep field order and widths in sync with
//! the kernel header.
//!
//! ## Key Types
//!
//! - [`PerfEventAttr`] - Event configuration passed to `perf_event_open`
//! - [`RecordHeader`] - Header preceding every record in the ring buffer
//!
//! The mmap page itself is accessed by offset (see [`DATA_HEAD_OFFSET`]) rather
//! than through a full struct, since only the cursor fields are read.

#![no_std]

// ============================================================================
// Ring Buffer Layout
// ============================================================================

/// Byte offset of `data_head` inside `struct perf_event_mmap_page`
///
/// Written by the kernel after it finishes appending records. `data_tail`
/// follows immediately at `DATA_HEAD_OFFSET + 8`.
pub const DATA_HEAD_OFFSET: usize = 1024;

/// Byte offset of `data_tail` inside `struct perf_event_mmap_page`
///
/// Written by userspace to tell the kernel which bytes may be reused.
pub const DATA_TAIL_OFFSET: usize = 1032;

/// Size of a record header in bytes
pub const RECORD_HEADER_SIZE: usize = 8;

// ============================================================================
// Record Types (perf_event_header.type)
// ============================================================================

/// Executable mapping created (only emitted when `attr.mmap` is set)
pub const PERF_RECORD_MMAP: u32 = 1;

/// Kernel dropped records because the ring buffer was full
///
/// Body: `u64 id, u64 lost`.
pub const PERF_RECORD_LOST: u32 = 2;

/// Sampling was throttled by the kernel
pub const PERF_RECORD_THROTTLE: u32 = 5;

/// Sampling was unthrottled by the kernel
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;

/// One sample, layout determined by `attr.sample_type`
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Extended executable mapping record
pub const PERF_RECORD_MMAP2: u32 = 10;

/// Samples lost in the PMU before reaching the ring buffer
///
/// Body: `u64 lost`.
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;

// ============================================================================
// Event Types and Configs
// ============================================================================

/// Hardware event type (`PERF_TYPE_HARDWARE`)
pub const PERF_TYPE_HARDWARE: u32 = 0;

/// Software event type (`PERF_TYPE_SOFTWARE`)
pub const PERF_TYPE_SOFTWARE: u32 = 1;

/// `PERF_COUNT_HW_CPU_CYCLES`
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

/// `PERF_COUNT_SW_CPU_CLOCK`
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

/// `PERF_COUNT_SW_TASK_CLOCK`
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;

// ============================================================================
// Sample Type Bits (attr.sample_type)
// ============================================================================

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;

/// Kernel-walked call chain: `u64 nr, u64 ips[nr]`
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;

// ============================================================================
// Attribute Flag Bits (the bitfield following read_format)
// ============================================================================

pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const ATTR_FLAG_FREQ: u64 = 1 << 10;
pub const ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL: u64 = 1 << 21;

// ============================================================================
// Call Chain Context Markers
// ============================================================================

/// Marker preceding hypervisor frames (`(u64)-32`)
pub const PERF_CONTEXT_HV: u64 = (-32_i64) as u64;

/// Marker preceding kernel frames (`(u64)-128`)
pub const PERF_CONTEXT_KERNEL: u64 = (-128_i64) as u64;

/// Marker preceding user frames (`(u64)-512`)
pub const PERF_CONTEXT_USER: u64 = (-512_i64) as u64;

/// Every value at or above this is a context marker, not an address
pub const PERF_CONTEXT_MAX: u64 = (-4095_i64) as u64;

/// Default `kernel.perf_event_max_stack`
pub const PERF_MAX_STACK_DEPTH: usize = 127;

/// Default `kernel.perf_event_max_contexts_per_stack`
pub const PERF_MAX_CONTEXTS_PER_STACK: usize = 8;

/// Largest `nr` a well-formed callchain sample can carry
///
/// Anything above this is treated as a corrupt record.
pub const MAX_CALLCHAIN_ENTRIES: usize = PERF_MAX_STACK_DEPTH + PERF_MAX_CONTEXTS_PER_STACK;

/// Returns true if a callchain entry is a context marker rather than an address
#[must_use]
pub const fn is_context_marker(entry: u64) -> bool {
    entry >= PERF_CONTEXT_MAX
}

// ============================================================================
// ioctl Requests
// ============================================================================

/// `PERF_EVENT_IOC_ENABLE` (`_IO('$', 0)`)
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;

/// `PERF_EVENT_IOC_DISABLE` (`_IO('$', 1)`)
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;

/// `perf_event_open` flag: set `O_CLOEXEC` on the new fd
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Header at the start of every ring buffer record
///
/// **Memory Layout**: matches `struct perf_event_header`. `size` includes the
/// header itself.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    /// Decode a header from its native-endian byte representation
    #[must_use]
    pub fn from_bytes(bytes: [u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            kind: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            misc: u16::from_ne_bytes([bytes[4], bytes[5]]),
            size: u16::from_ne_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Encode the header to its native-endian byte representation
    #[must_use]
    pub fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[..4].copy_from_slice(&self.kind.to_ne_bytes());
        out[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        out[6..].copy_from_slice(&self.size.to_ne_bytes());
        out
    }
}

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5` (112 bytes)
///
/// Unions are flattened to the member dwprof uses: `sample_period_or_freq`
/// holds a frequency when [`ATTR_FLAG_FREQ`] is set, a period otherwise.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

/// Size the kernel expects in [`PerfEventAttr::size`]
pub const PERF_ATTR_SIZE_VER5: u32 = 112;

const _: () = assert!(core::mem::size_of::<PerfEventAttr>() == PERF_ATTR_SIZE_VER5 as usize);
const _: () = assert!(core::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);
