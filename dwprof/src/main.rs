//! # dwprof - Main Entry Point
//!
//! Attaches to one process, opens a sampling event per thread and prints a
//! symbolized call chain for every sample until interrupted, a duration limit
//! elapses or the target exits.

// Main function is intentionally long for clarity; time conversions lose precision for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dwprof::capture::capture_batch;
use dwprof::cli::Args;
use dwprof::domain::{AttachError, PerfError, Pid, Tid};
use dwprof::export::{JsonLinesExporter, SampleRecord};
use dwprof::format::{format_batch, ChainFormatter};
use dwprof::preflight::run_preflight_checks;
use dwprof::profiling::{list_threads, PerfEvent, SamplerConfig, ThreadInfo, ThreadTracker};
use dwprof::ring_buffer::RecordReader;
use dwprof::session::Session;
use dwprof::telemetry::{Telemetry, TelemetrySnapshot};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const THREAD_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

type Sampler = RecordReader<PerfEvent>;

/// Open and enable sampling on every thread of `threads` not yet tracked
///
/// Threads that exit between listing and opening are skipped. Any other
/// failure to open is fatal.
fn attach_new_threads(
    threads: &[ThreadInfo],
    config: &SamplerConfig,
    tracker: &mut ThreadTracker<Sampler>,
) -> Result<usize> {
    tracker.attach_new(threads, |thread| {
        let event = match PerfEvent::open(thread.tid, config) {
            Ok(event) => event,
            Err(PerfError::Open { source, .. }) if source.raw_os_error() == Some(libc::ESRCH) => {
                debug!("Thread {} exited before sampling started", thread.tid);
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to sample thread {}", thread.tid));
            }
        };
        event.enable()?;

        info!("Sampling {} ({})", thread.tid, thread.comm);
        Ok(Some(RecordReader::new(event)))
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Default)]
struct RunStats {
    samples: u64,
    overruns: u64,
    lost: u64,
    corrupt: u64,
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let pid = Pid(args.pid);

    // Run pre-flight checks before anything else
    run_preflight_checks(pid)?;

    let config = args.sampler_config();
    let formatter = ChainFormatter::new(args.chain_order());

    let mut session = Session::open(pid).context("Failed to attach to target")?;

    let mut samplers = ThreadTracker::new();
    let threads = list_threads(pid)?;
    attach_new_threads(&threads, &config, &mut samplers)?;
    if samplers.is_empty() {
        anyhow::bail!("No threads of {pid} could be sampled");
    }

    let telemetry = Telemetry::linux(args.gpus);
    let mut exporter = args
        .export
        .as_deref()
        .map(JsonLinesExporter::create)
        .transpose()
        .context("Failed to set up sample export")?;

    if !quiet {
        eprintln!("dwprof v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("pid: {}", pid.0);
        eprintln!("modules: {}", session.modules().len());
        eprintln!("threads: {}", samplers.len());
        eprintln!("sampling: {} Hz, {} pages per thread", config.frequency_hz, config.data_pages);
        if let Some(ref export_path) = args.export {
            eprintln!("export: {}", export_path.display());
        }
    }

    let mut stats = RunStats::default();
    let mut threads_seen = samplers.len();
    let mut previous_reading: Option<(Instant, TelemetrySnapshot)> = None;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Track start time for duration limit
    let profiling_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut last_rescan = Instant::now();

    // Pre-compute proc path for process liveness check
    let proc_path = format!("/proc/{}", pid.0);

    // Track why we exited the loop
    let mut exit_reason = "interrupted";

    'sampling: loop {
        // Check for duration timeout
        if let Some(limit) = duration_limit {
            if profiling_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        // Check if target process still exists
        if !std::path::Path::new(&proc_path).exists() {
            exit_reason = "process exited";
            break;
        }

        // Exited threads get one last drain below, then their rings are unmapped
        let mut retiring = Vec::new();
        if last_rescan.elapsed() >= THREAD_RESCAN_INTERVAL {
            match list_threads(pid) {
                Ok(threads) => {
                    retiring = samplers.retire_exited(&threads);
                    match attach_new_threads(&threads, &config, &mut samplers) {
                        Ok(0) => {}
                        Ok(n) => {
                            debug!("Attached {n} new threads");
                            threads_seen += n;
                        }
                        Err(e) => warn!("Thread rescan failed: {e:#}"),
                    }
                }
                Err(e) => warn!("Thread rescan failed: {e:#}"),
            }
            last_rescan = Instant::now();
        }

        let snapshot = telemetry.snapshot(pid);
        let read_at = Instant::now();
        let power_watts = previous_reading.and_then(|(at, before)| {
            telemetry.process_power(&before, &snapshot, read_at.duration_since(at))
        });
        previous_reading = Some((read_at, snapshot));

        let timestamp_ms = unix_millis();
        let mut poll_chains = Vec::new();

        // Drain every ring
        let rings = samplers
            .iter_mut()
            .chain(retiring.iter_mut().map(|(tid, reader)| (*tid, reader)));
        for (tid, reader) in rings {
            let batch = match capture_batch(&mut session, reader, &formatter) {
                Ok(batch) => batch,
                Err(AttachError::ProcessNotFound(_)) => {
                    exit_reason = "process exited";
                    break 'sampling;
                }
                Err(e) => return Err(e).context("Lost access to target"),
            };

            stats.samples += batch.chains.len() as u64;
            stats.overruns += batch.overruns;
            stats.lost += batch.lost;
            stats.corrupt += batch.corrupt;

            for chain in batch.chains {
                if let Some(exporter) = exporter.as_mut() {
                    let record = SampleRecord::new(
                        timestamp_ms,
                        pid,
                        tid,
                        chain.clone(),
                        &snapshot,
                        power_watts,
                    );
                    exporter.write(&record).context("Failed to export sample")?;
                }
                if !quiet && !args.batch {
                    println!("{chain}");
                }
                poll_chains.push(chain);
            }
        }

        if !quiet && args.batch && !poll_chains.is_empty() {
            println!("{}", format_batch(&poll_chains));
        }

        // Use select to handle both sleep and Ctrl+C
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {
                // Continue loop
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    for (tid, reader) in samplers.iter() {
        if let Err(e) = reader.ring().disable() {
            debug!("Disabling sampling for {tid} failed: {e}");
        }
    }

    if let Some(exporter) = exporter {
        let written = exporter.written();
        exporter.finish().context("Failed to flush sample export")?;
        if !quiet {
            if let Some(ref export_path) = args.export {
                eprintln!("saved: {} ({written} samples)", export_path.display());
            }
        }
    }

    // Print summary
    if !quiet {
        let elapsed = profiling_start.elapsed();
        eprintln!(
            "\n{}: {:.1}s, {} samples from {} threads (overruns: {}, lost: {}, corrupt: {}, module refreshes: {})",
            exit_reason,
            elapsed.as_secs_f64(),
            stats.samples,
            threads_seen,
            stats.overruns,
            stats.lost,
            stats.corrupt,
            session.refresh_count(),
        );
    }

    Ok(())
}
