//! Sample export
//!
//! Writes one JSON object per captured sample, one per line:
//!
//! ```text
//! {"timestamp_ms":1718035200123,"pid":4242,"tid":4243,"chain":"compute+0x20;main+0x1f","process_time":187,"total_cpu_time":912345,"energy_uj":123456789,"power_watts":3.2,"gpu_watts":null}
//! ```
//!
//! `power_watts` is the power attributed to the target over the poll that
//! drained the sample. Every sample of that poll carries the same value, so
//! a consumer splits it across them. Missing telemetry is written as `null`. Lines are independent, so a trace
//! cut short by a crash stays readable up to the last full line.

use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::{ExportError, Pid, Tid};
use crate::telemetry::TelemetrySnapshot;

/// One exported line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub pid: Pid,
    pub tid: Tid,
    pub chain: String,
    pub process_time: Option<u64>,
    pub total_cpu_time: Option<u64>,
    pub energy_uj: Option<u64>,
    pub power_watts: Option<f64>,
    pub gpu_watts: Option<f64>,
}

impl SampleRecord {
    #[must_use]
    pub fn new(
        timestamp_ms: u64,
        pid: Pid,
        tid: Tid,
        chain: String,
        telemetry: &TelemetrySnapshot,
        power_watts: Option<f64>,
    ) -> Self {
        Self {
            timestamp_ms,
            pid,
            tid,
            chain,
            process_time: telemetry.process_time,
            total_cpu_time: telemetry.total_cpu_time,
            energy_uj: telemetry.energy_uj,
            power_watts,
            gpu_watts: telemetry.gpu_watts,
        }
    }
}

/// JSON-lines writer for [`SampleRecord`]s
pub struct JsonLinesExporter<W: Write> {
    out: W,
    written: u64,
}

impl JsonLinesExporter<BufWriter<File>> {
    /// Create (or truncate) an export file
    ///
    /// # Errors
    /// Returns [`ExportError::Create`] if the file cannot be created
    pub fn create(path: &Path) -> Result<Self, ExportError> {
        let file = File::create(path).map_err(|source| ExportError::Create {
            path: path.display().to_string(),
            source,
        })?;
        info!("Exporting samples to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    /// Append one record
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn write(&mut self, record: &SampleRecord) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Records written so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush buffered lines to the underlying writer
    ///
    /// # Errors
    /// Returns an error if the flush fails
    pub fn flush(&mut self) -> Result<(), ExportError> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush and return the underlying writer
    ///
    /// # Errors
    /// Returns an error if the flush fails
    pub fn finish(mut self) -> Result<W, ExportError> {
        self.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chain: &str, gpu_watts: Option<f64>) -> SampleRecord {
        SampleRecord {
            timestamp_ms: 1_718_035_200_123,
            pid: Pid(4242),
            tid: Tid(4243),
            chain: chain.to_string(),
            process_time: Some(187),
            total_cpu_time: Some(912_345),
            energy_uj: None,
            power_watts: Some(3.2),
            gpu_watts,
        }
    }

    #[test]
    fn test_line_shape() {
        let mut exporter = JsonLinesExporter::new(Vec::new());
        exporter.write(&record("compute+0x20", Some(41.5))).unwrap();
        let out = String::from_utf8(exporter.finish().unwrap()).unwrap();

        assert!(out.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(parsed["timestamp_ms"], 1_718_035_200_123_u64);
        assert_eq!(parsed["pid"], 4242);
        assert_eq!(parsed["tid"], 4243);
        assert_eq!(parsed["chain"], "compute+0x20");
        assert_eq!(parsed["process_time"], 187);
        assert_eq!(parsed["total_cpu_time"], 912_345);
        assert!(parsed["energy_uj"].is_null());
        assert_eq!(parsed["power_watts"], 3.2);
        assert_eq!(parsed["gpu_watts"], 41.5);
    }

    #[test]
    fn test_record_from_snapshot() {
        let snapshot = TelemetrySnapshot {
            process_time: Some(10),
            total_cpu_time: Some(400),
            energy_uj: Some(77),
            gpu_watts: None,
        };
        let record = SampleRecord::new(5, Pid(1), Tid(2), "main".to_string(), &snapshot, Some(1.5));

        assert_eq!(record.process_time, Some(10));
        assert_eq!(record.total_cpu_time, Some(400));
        assert_eq!(record.energy_uj, Some(77));
        assert_eq!(record.power_watts, Some(1.5));
        assert_eq!(record.gpu_watts, None);
    }

    #[test]
    fn test_one_line_per_record() {
        let mut exporter = JsonLinesExporter::new(Vec::new());
        exporter.write(&record("a;b", None)).unwrap();
        exporter.write(&record("[no callchain]", None)).unwrap();
        assert_eq!(exporter.written(), 2);

        let out = String::from_utf8(exporter.finish().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed["gpu_watts"].is_null());
        }
    }

    #[test]
    fn test_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");

        let mut exporter = JsonLinesExporter::create(&path).unwrap();
        exporter.write(&record("compute+0x20", None)).unwrap();
        drop(exporter.finish().unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"chain\":\"compute+0x20\""));
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let result = JsonLinesExporter::create(Path::new("/nonexistent/dir/samples.jsonl"));
        assert!(matches!(result, Err(ExportError::Create { .. })));
    }
}
