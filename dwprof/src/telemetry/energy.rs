//! Package energy from the RAPL powercap interface

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use super::EnergyMeter;

/// Default zone: package 0
pub const RAPL_PACKAGE_ZONE: &str = "/sys/class/powercap/intel-rapl:0";

/// One RAPL powercap zone
///
/// `energy_uj` counts microjoules and wraps at `max_energy_range_uj`. Reading
/// it needs root on kernels patched against the Platypus side channel.
#[derive(Debug, Clone)]
pub struct Rapl {
    zone: PathBuf,
}

impl Default for Rapl {
    fn default() -> Self {
        Self { zone: PathBuf::from(RAPL_PACKAGE_ZONE) }
    }
}

impl Rapl {
    #[must_use]
    pub fn with_zone(zone: impl Into<PathBuf>) -> Self {
        Self { zone: zone.into() }
    }

    fn read(&self, attribute: &str) -> Result<u64> {
        read_counter(&self.zone.join(attribute))
    }
}

impl EnergyMeter for Rapl {
    fn total_energy(&self) -> Option<u64> {
        self.read("energy_uj").map_err(|e| debug!("No energy reading: {e:#}")).ok()
    }

    fn energy_range(&self) -> Option<u64> {
        self.read("max_energy_range_uj").ok()
    }
}

/// Read a sysfs attribute holding one unsigned integer
///
/// # Errors
/// Returns an error if the file cannot be read or does not hold a number
pub fn read_counter(path: &Path) -> Result<u64> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid counter in {}: '{}'", path.display(), content.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(energy: &str, range: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("energy_uj"), energy).unwrap();
        fs::write(dir.path().join("max_energy_range_uj"), range).unwrap();
        dir
    }

    #[test]
    fn test_reads_energy_counter() {
        let dir = zone("123456789\n", "262143328850\n");
        let rapl = Rapl::with_zone(dir.path());
        assert_eq!(rapl.total_energy(), Some(123_456_789));
        assert_eq!(rapl.energy_range(), Some(262_143_328_850));
    }

    #[test]
    fn test_delta_uses_zone_range() {
        let dir = zone("0\n", "1000\n");
        let rapl = Rapl::with_zone(dir.path());
        assert_eq!(rapl.delta(990, 15), Some(25));
    }

    #[test]
    fn test_missing_zone_is_none() {
        let rapl = Rapl::with_zone("/nonexistent/intel-rapl:9");
        assert_eq!(rapl.total_energy(), None);
    }

    #[test]
    fn test_garbage_counter_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy_uj");
        fs::write(&path, "n/a").unwrap();
        let err = read_counter(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid counter"));
    }
}
