// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon sysfs temperature collection.
//!
//! Scans `/sys/class/hwmon/` for `tempN_input` files and re-reads them on
//! demand. The sysfs root can be moved with the `HOST_SYS` environment
//! variable (useful in containers and tests).

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the `/sys` root.
pub const KEY_HOST_SYS: &str = "HOST_SYS";

const DEFAULT_SYS_ROOT: &str = "/sys";

/// sysfs reports millidegrees Celsius.
const TEMPERATURE_SCALE: f64 = 1000.0;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("could not get temperature files: {0}")]
    Discovery(#[source] io::Error),
    #[error("{}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: invalid value {value:?}", path.display())]
    Parse { path: PathBuf, value: String },
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Identity of a sensor, stable for the lifetime of the process.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TemperatureId(pub u16);

/// One temperature sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Temperature {
    #[serde(skip)]
    pub id: TemperatureId,
    /// e.g. `k10temp_tctl`
    pub key: String,
    /// e.g. `k10temp: Tctl`; this is what curve thresholds refer to.
    pub name: String,
    pub device: String,
    /// Degrees Celsius
    pub temperature: f64,
    pub high: Option<f64>,
    pub critical: Option<f64>,
}

/// Result of one collection pass: what could be read, and what could not.
#[derive(Debug, Default)]
pub struct Readings {
    pub temperatures: Vec<Temperature>,
    pub errors: Vec<SensorError>,
}

impl Readings {
    /// Every sensor failed (or there was nothing to read and something failed).
    pub fn is_failure(&self) -> bool {
        self.temperatures.is_empty() && !self.errors.is_empty()
    }
}

struct Sensor {
    input_path: PathBuf,
    template: Temperature,
}

/// The set of discovered sensors.
pub struct Collector {
    sensors: Vec<Sensor>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

impl Collector {
    /// Discover sensors under `$HOST_SYS` (default `/sys`).
    ///
    /// Sensors that cannot be read during discovery are returned as errors
    /// alongside the collector and left out of it.
    pub fn discover() -> Result<(Self, Vec<SensorError>), SensorError> {
        Self::discover_in(&sys_root())
    }

    pub fn discover_in(sys_root: &Path) -> Result<(Self, Vec<SensorError>), SensorError> {
        let files = temperature_files(sys_root).map_err(SensorError::Discovery)?;

        let mut sensors = Vec::with_capacity(files.len());
        let mut errors = Vec::new();
        for (i, file) in files.into_iter().enumerate() {
            match build_sensor(TemperatureId(i as u16), file) {
                Ok(sensor) => sensors.push(sensor),
                Err(e) => errors.push(e),
            }
        }

        Ok((Self { sensors }, errors))
    }

    /// Remove every sensor whose name is in `names`.
    pub fn drop_sensors(&mut self, names: &[&str]) {
        self.sensors
            .retain(|p| !names.contains(&p.template.name.as_str()));
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Re-read every sensor.
    pub fn temperatures(&self) -> Readings {
        let mut readings = Readings::default();
        for sensor in &self.sensors {
            match read_millidegrees(&sensor.input_path) {
                Ok(value) => readings.temperatures.push(Temperature {
                    temperature: value / TEMPERATURE_SCALE,
                    ..sensor.template.clone()
                }),
                Err(e) => readings.errors.push(e),
            }
        }
        readings
    }
}

fn sys_root() -> PathBuf {
    std::env::var_os(KEY_HOST_SYS)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SYS_ROOT))
}

/// `class/hwmon/hwmon*/temp*_input`, or under `device/` when the first
/// layout has none (older kernels put the files there).
fn temperature_files(sys_root: &Path) -> io::Result<Vec<PathBuf>> {
    let hwmon_root = sys_root.join("class").join("hwmon");

    let mut hwmon_dirs: Vec<PathBuf> = fs::read_dir(&hwmon_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("hwmon"))
        .map(|e| e.path())
        .collect();
    hwmon_dirs.sort();

    let files = input_files(hwmon_dirs.iter().cloned());
    if !files.is_empty() {
        return Ok(files);
    }
    Ok(input_files(hwmon_dirs.iter().map(|d| d.join("device"))))
}

fn input_files(dirs: impl Iterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("temp") && name.ends_with("_input")
            })
            .map(|e| e.path())
            .collect();
        found.sort();
        files.extend(found);
    }
    files
}

fn build_sensor(id: TemperatureId, input_path: PathBuf) -> Result<Sensor, SensorError> {
    let directory = input_path.parent().unwrap_or(Path::new("/")).to_path_buf();

    // temp1_input => temp1
    let file_name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = file_name.split('_').next().unwrap_or_default().to_string();
    let base_path = directory.join(&base);

    // Missing when the chip has a single sensor.
    let label = read_trimmed(&with_suffix(&base_path, "_label")).unwrap_or_default();

    let name_path = directory.join("name");
    let chip = fs::read_to_string(&name_path)
        .map(|s| s.trim().to_string())
        .map_err(|source| SensorError::Read {
            path: name_path,
            source,
        })?;

    let mut key = chip.clone();
    if !label.is_empty() {
        // "Core 0" => "core_0"
        key.push('_');
        key.push_str(&label.to_lowercase().replace(' ', "_"));
    }

    let device = device_name(&directory.join("device")).unwrap_or_else(|| chip.clone());
    let mut name = device.clone();
    if !label.is_empty() {
        name.push_str(": ");
        name.push_str(&label);
    }

    let temperature = read_millidegrees(&input_path)? / TEMPERATURE_SCALE;

    Ok(Sensor {
        template: Temperature {
            id,
            key,
            name,
            device,
            temperature,
            high: optional_value(&with_suffix(&base_path, "_max")),
            critical: optional_value(&with_suffix(&base_path, "_crit")),
        },
        input_path,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn read_millidegrees(path: &Path) -> Result<f64, SensorError> {
    let raw = fs::read_to_string(path).map_err(|source| SensorError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim().parse::<f64>().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        value: raw.trim().to_string(),
    })
}

fn optional_value(path: &Path) -> Option<f64> {
    read_trimmed(path)
        .and_then(|s| s.parse::<f64>().ok())
        .map(|v| v / TEMPERATURE_SCALE)
}

fn device_name(device_dir: &Path) -> Option<String> {
    ["name", "model"]
        .iter()
        .find_map(|f| read_trimmed(&device_dir.join(f)))
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
