//! GPU power from DRM hwmon sensors
//!
//! Each GPU driver that exposes power telemetry (amdgpu, xe, i915 and others)
//! registers a hwmon device under its DRM card:
//!
//! ```text
//! /sys/class/drm/card0/device/hwmon/hwmon3/power1_average   (microwatts)
//! ```

use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use super::energy::read_counter;
use super::GpuPowerMeter;

const POWER_ATTRIBUTES: [&str; 2] = ["power1_average", "power1_input"];

/// GPU power meter over `/sys/class/drm`
#[derive(Debug, Clone)]
pub struct DrmHwmon {
    drm_root: PathBuf,
}

impl Default for DrmHwmon {
    fn default() -> Self {
        Self { drm_root: PathBuf::from("/sys/class/drm") }
    }
}

impl DrmHwmon {
    #[must_use]
    pub fn with_root(drm_root: impl Into<PathBuf>) -> Self {
        Self { drm_root: drm_root.into() }
    }

    /// Power sensor files of every card, in card order
    ///
    /// Connector entries (`card0-DP-1`) and render nodes are skipped.
    #[must_use]
    pub fn sensors(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.drm_root) else {
            return Vec::new();
        };

        let mut cards: Vec<(u32, PathBuf)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let index = entry.file_name().to_str()?.strip_prefix("card")?.parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        cards.sort_by_key(|(index, _)| *index);

        cards.iter().filter_map(|(_, card)| power_sensor(card)).collect()
    }
}

fn power_sensor(card: &Path) -> Option<PathBuf> {
    let hwmon_dir = card.join("device/hwmon");
    let mut hwmons: Vec<PathBuf> =
        fs::read_dir(hwmon_dir).ok()?.filter_map(|e| e.ok().map(|e| e.path())).collect();
    hwmons.sort();

    hwmons.iter().find_map(|hwmon| {
        POWER_ATTRIBUTES.iter().map(|attr| hwmon.join(attr)).find(|path| path.is_file())
    })
}

impl GpuPowerMeter for DrmHwmon {
    fn gpu_power(&self, gpu_count: usize) -> Option<f64> {
        let readings: Vec<u64> = self
            .sensors()
            .iter()
            .take(gpu_count)
            .filter_map(|sensor| {
                read_counter(sensor).map_err(|e| debug!("Skipping GPU sensor: {e:#}")).ok()
            })
            .collect();

        if readings.is_empty() {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let total_watts: f64 = readings.iter().map(|&uw| uw as f64 / 1_000_000.0).sum();
        #[allow(clippy::cast_precision_loss)]
        Some(total_watts / readings.len() as f64)
    }
}
