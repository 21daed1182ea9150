//! Experiment documents.
//!
//! The experiment file is a free-form mapping. Every top-level key becomes an
//! attribute of the measurement; the workflow reads the ones it knows through
//! typed views:
//!
//! ```yaml
//! init:
//!   devices: devices.yml
//! scan:
//!   laser:
//!     name: Santec
//!     params: {start_wavelength: 1490 nm, stop_wavelength: 1500 nm,
//!              interval_trigger: 0.1 nm, wavelength_speed: 10 nm/s}
//!   detectors: [Photodiode 1]
//!   axis:
//!     device: {name: Piezo X, output: position, range: [0 um, 10 um, 1 um]}
//!   shutter: {port: port0/line0, delay: 100 ms}
//! monitor:
//!   laser: {name: Santec, params: {}}
//!   detectors: [Photodiode 1]
//! ```

use super::loader::{load_yaml_dict, resolve};
use crate::core::Conditions;
use crate::error::{AppResult, ExperimentorError};
use crate::units::Quantity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

/// Name used on the scan axis to repeat line scans without moving a device.
pub const TIME_AXIS: &str = "time";

/// Top-level experiment dictionary.
#[derive(Clone, Debug, Default)]
pub struct ExperimentConfig {
    base_dir: PathBuf,
    attributes: Mapping,
}

/// `init` section: where the device topology lives.
#[derive(Clone, Debug, Deserialize)]
pub struct InitConfig {
    pub devices: PathBuf,
}

/// Laser and the parameters to apply before sweeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaserSettings {
    pub name: String,
    #[serde(default)]
    pub params: Conditions,
}

/// Device stepped between line scans.
#[derive(Clone, Debug, Deserialize)]
pub struct AxisDevice {
    /// A device name, or `time` to repeat line scans in place.
    pub name: String,
    /// Key of the value dictionary sent to the device.
    #[serde(default)]
    pub output: Option<String>,
    /// `[start, stop, step]` for a device; `[start, count]` for the time axis.
    pub range: Vec<Quantity>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AxisConfig {
    pub device: AxisDevice,
}

/// Digital line gating the laser beam.
#[derive(Clone, Debug, Deserialize)]
pub struct ShutterConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    pub delay: Quantity,
    /// DAQ card owning the line; falls back to the configured default.
    #[serde(default)]
    pub device: Option<String>,
}

/// `scan` section: a 2-D scan of laser wavelength against one axis.
#[derive(Clone, Debug, Deserialize)]
pub struct ScanConfig {
    pub laser: LaserSettings,
    #[serde(default)]
    pub detectors: Vec<String>,
    pub axis: AxisConfig,
    pub shutter: ShutterConfig,
}

/// `monitor` section: endless sweeps for watching a signal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub laser: LaserSettings,
    #[serde(default)]
    pub detectors: Vec<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(crate::core::yaml_key(&value))
}

impl ExperimentConfig {
    /// Wrap an already-parsed mapping. Relative paths resolve against `base_dir`.
    pub fn from_mapping(attributes: Mapping, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            attributes,
        }
    }

    /// Parse a YAML string. Relative paths resolve against the working directory.
    pub fn from_yaml_str(yaml: &str) -> AppResult<Self> {
        match serde_yaml::from_str(yaml)? {
            Value::Mapping(map) => Ok(Self::from_mapping(map, PathBuf::new())),
            _ => Err(ExperimentorError::Configuration(
                "experiment document must be a mapping".to_string(),
            )),
        }
    }

    /// Load an experiment file. Relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let attributes = load_yaml_dict(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self::from_mapping(attributes, base_dir))
    }

    /// Top-level keys, in document order.
    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.attributes.keys().map(crate::core::yaml_key)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attribute_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.attributes.get_mut(key)
    }

    pub fn set_attribute(&mut self, key: &str, value: Value) {
        self.attributes.insert(Value::String(key.to_string()), value);
    }

    /// Store `value` under `section.key`, creating the section if needed.
    pub fn set_nested(&mut self, section: &str, key: &str, value: Value) {
        let entry = self
            .attributes
            .entry(Value::String(section.to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = entry {
            map.insert(Value::String(key.to_string()), value);
        }
    }

    /// Deserialize one attribute into a typed view.
    pub fn typed<T: DeserializeOwned>(&self, key: &str) -> AppResult<T> {
        let value = self
            .attribute(key)
            .ok_or_else(|| ExperimentorError::MissingAttribute(key.to_string()))?;
        serde_yaml::from_value(value.clone()).map_err(|e| {
            ExperimentorError::Configuration(format!("invalid '{}' section: {}", key, e))
        })
    }

    /// The `init` section with `devices` resolved against the document's directory.
    pub fn init(&self) -> AppResult<InitConfig> {
        let mut init: InitConfig = self.typed("init")?;
        init.devices = resolve(&self.base_dir, init.devices);
        Ok(init)
    }

    pub fn scan(&self) -> AppResult<ScanConfig> {
        self.typed("scan")
    }

    pub fn monitor(&self) -> AppResult<MonitorConfig> {
        self.typed("monitor")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Load an experiment file; see [`ExperimentConfig::load`].
pub fn load_experiment_file(path: impl AsRef<Path>) -> AppResult<ExperimentConfig> {
    ExperimentConfig::load(path)
}
