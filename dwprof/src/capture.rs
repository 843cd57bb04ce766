//! Sample capture: ring buffer to rendered call chain
//!
//! Ties the pipeline together. Each call pulls the next sample out of a
//! [`RecordReader`], symbolizes its addresses through the [`Session`] and
//! renders the resulting frames.
//!
//! Whenever the reader copies a new batch out of the ring, the session starts
//! a new batch too, which re-arms its refresh-on-miss.

use log::{debug, warn};

use crate::domain::{AttachError, CaptureError};
use crate::format::ChainFormatter;
use crate::ring_buffer::{RecordReader, RingMemory};
use crate::session::Session;
use crate::symbolization::resolve_chain;

/// Capture and render the next pending sample, innermost frame first
///
/// Returns `Ok(None)` when no sample is pending.
///
/// # Errors
/// - [`CaptureError::Attach`] once the traced process is gone or its module
///   map became unreadable. Fatal for the session.
/// - [`CaptureError::Overrun`] when samples were lost since the last read.
///   Capture can simply continue.
/// - [`CaptureError::Corrupt`] when a record was rejected. Capture can
///   simply continue.
pub fn capture_chain<M: RingMemory>(
    session: &mut Session,
    reader: &mut RecordReader<M>,
) -> Result<Option<String>, CaptureError> {
    capture_chain_with(session, reader, &ChainFormatter::default())
}

/// [`capture_chain`] with a caller-chosen frame order
///
/// # Errors
/// Same as [`capture_chain`]
pub fn capture_chain_with<M: RingMemory>(
    session: &mut Session,
    reader: &mut RecordReader<M>,
    formatter: &ChainFormatter,
) -> Result<Option<String>, CaptureError> {
    session.check_attached()?;

    let Some(record) = reader.next_record()? else {
        return Ok(None);
    };
    if reader.batch_started() {
        session.begin_batch();
    }

    let frames = resolve_chain(session, &record.ips);
    // A refresh triggered by this sample may have found the process gone
    session.check_attached()?;

    Ok(Some(formatter.format(&frames)))
}

/// Everything drained from a ring in one [`capture_batch`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBatch {
    pub chains: Vec<String>,
    /// Overrun reports seen while draining
    pub overruns: u64,
    /// Samples the kernel reported lost, where it gave a count
    pub lost: u64,
    pub corrupt: u64,
}

/// Drain every pending sample
///
/// Overruns and corrupt records are counted and logged, then skipped.
///
/// # Errors
/// Returns the [`AttachError`] that detached the session. Chains captured
/// before the failure are dropped with it.
pub fn capture_batch<M: RingMemory>(
    session: &mut Session,
    reader: &mut RecordReader<M>,
    formatter: &ChainFormatter,
) -> Result<CapturedBatch, AttachError> {
    let mut batch = CapturedBatch::default();

    loop {
        match capture_chain_with(session, reader, formatter) {
            Ok(Some(chain)) => batch.chains.push(chain),
            Ok(None) => break,
            Err(CaptureError::Attach(err)) => return Err(err),
            Err(CaptureError::Overrun(err)) => {
                batch.overruns += 1;
                batch.lost += err.lost.unwrap_or(0);
                warn!("{err}");
            }
            Err(CaptureError::Corrupt(err)) => {
                batch.corrupt += 1;
                debug!("Skipped corrupt record: {err}");
            }
        }
    }

    Ok(batch)
}
