//! Device topology documents.
//!
//! A devices file is one YAML mapping keyed by device name. Each entry gives
//! the device type, an optional driver reference, a connection descriptor and
//! any number of free-form properties. Channels wired to a DAQ card are devices
//! themselves (`connection.device` names the card and `mode` selects the list
//! they are routed to); instruments with their own sub-channels list them under
//! `sensors:` and `actuators:`.
//!
//! ```yaml
//! NI-DAQ:
//!   type: daq
//!   driver: mockup/daq
//!   trigger: external
//!   trigger_source: PFI0
//! Photodiode 1:
//!   type: analog daq
//!   model: ni
//!   mode: input
//!   connection: {type: daq, device: NI-DAQ, port: 0}
//! Oscilloscope:
//!   type: scope
//!   driver: mockup/generic
//!   sensors:
//!     PD2: {port: 1, units: V}
//! ```

use crate::core::{yaml_key, Conditions};
use crate::error::{AppResult, ExperimentorError};
use crate::units::{Calibration, Quantity};
use serde::{de::Error as _, Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Device type string that marks a DAQ card.
pub const DAQ_TYPE: &str = "daq";

/// Device type string that marks a rotation stage.
pub const ROTATION_STAGE_TYPE: &str = "Rotation Stage";

/// List a DAQ-connected channel is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Input,
    Output,
    Monitor,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Input => write!(f, "input"),
            ChannelMode::Output => write!(f, "output"),
            ChannelMode::Monitor => write!(f, "monitor"),
        }
    }
}

/// How the computer (or a DAQ card) reaches a device.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ConnectionSpec {
    /// Transport, e.g. `GPIB`, `usb`, `daq`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Name of the device this one is plugged into.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub port: Option<String>,
    #[serde(flatten)]
    pub extra: Conditions,
}

/// Inclusive bounds on the physical value of a channel.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub min: Option<Quantity>,
    #[serde(default)]
    pub max: Option<Quantity>,
}

impl Limits {
    /// Reject `value` if it lies outside the bounds.
    pub fn check(&self, channel: &str, value: &Quantity) -> AppResult<()> {
        let below = match &self.min {
            Some(min) => value.m_as(min.units())? < min.magnitude(),
            None => false,
        };
        let above = match &self.max {
            Some(max) => value.m_as(max.units())? > max.magnitude(),
            None => false,
        };
        if below || above {
            return Err(ExperimentorError::OutOfLimits {
                channel: channel.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

/// A sensor or actuator: one sub-channel of a device.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ChannelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub port: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub calibration: Option<Calibration>,
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(flatten)]
    pub properties: Conditions,
}

/// One entry of a devices file.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceSpec {
    /// Defaults to the mapping key.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Reference resolved through the `DriverRegistry`.
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub mode: Option<ChannelMode>,
    /// `ni` marks an analog channel driven through its DAQ card.
    #[serde(default)]
    pub model: Option<String>,
    /// Defaults overlay file, resolved against the devices file's directory.
    #[serde(default)]
    pub defaults: Option<PathBuf>,
    #[serde(default)]
    pub calibration: Option<Calibration>,
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(default, deserialize_with = "channel_list")]
    pub sensors: Vec<ChannelSpec>,
    #[serde(default, deserialize_with = "channel_list")]
    pub actuators: Vec<ChannelSpec>,
    /// Everything else (`trigger`, `trigger_source`, `outputs`, ...).
    #[serde(flatten)]
    pub properties: Conditions,
}

impl DeviceSpec {
    pub fn is_daq(&self) -> bool {
        self.kind == DAQ_TYPE
    }

    pub fn is_rotation_stage(&self) -> bool {
        self.kind == ROTATION_STAGE_TYPE
    }

    /// Devices with an `outputs` property can be driven by a scan.
    pub fn has_outputs(&self) -> bool {
        self.properties.contains_key("outputs")
    }

    /// Analog channel written through the DAQ card it is plugged into.
    pub fn is_analog_channel(&self) -> bool {
        self.model.as_deref() == Some("ni")
    }

    /// Name of the DAQ card (or other device) this device is plugged into.
    pub fn connected_to(&self) -> Option<&str> {
        self.connection.device.as_deref()
    }

    /// Describe this device as a channel of the card it is connected to.
    pub fn as_channel(&self) -> ChannelSpec {
        ChannelSpec {
            name: self.name.clone(),
            port: self.connection.port.clone(),
            units: self.calibration.as_ref().map(|c| c.units.clone()),
            calibration: self.calibration.clone(),
            limits: self.limits.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(ExperimentorError::Configuration(
                "device name cannot be empty".to_string(),
            ));
        }
        if self.connected_to().is_some() && self.mode.is_none() {
            return Err(ExperimentorError::Configuration(format!(
                "device '{}' is connected to '{}' but has no 'mode' (input, output or monitor)",
                self.name,
                self.connected_to().unwrap_or_default()
            )));
        }
        if self.connected_to() == Some(self.name.as_str()) {
            return Err(ExperimentorError::Configuration(format!(
                "device '{}' cannot be connected to itself",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for channel in self.sensors.iter().chain(&self.actuators) {
            if !seen.insert(channel.name.as_str()) {
                return Err(ExperimentorError::Configuration(format!(
                    "device '{}' declares channel '{}' more than once",
                    self.name, channel.name
                )));
            }
        }
        Ok(())
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(v) => Some(yaml_key(&v)),
    })
}

/// Channels may be written as a mapping keyed by name or as a list of entries.
fn channel_list<'de, D>(deserializer: D) -> Result<Vec<ChannelSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Mapping(map) => map
            .into_iter()
            .map(|(key, value)| {
                let mut channel: ChannelSpec =
                    serde_yaml::from_value(value).map_err(D::Error::custom)?;
                if channel.name.is_empty() {
                    channel.name = yaml_key(&key);
                }
                Ok(channel)
            })
            .collect(),
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .map(|value| {
                let channel: ChannelSpec =
                    serde_yaml::from_value(value).map_err(D::Error::custom)?;
                if channel.name.is_empty() {
                    return Err(D::Error::custom("channel entries in a list need a 'name'"));
                }
                Ok(channel)
            })
            .collect(),
        other => Err(D::Error::custom(format!(
            "expected a mapping or list of channels, found {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ParameterValue;

    fn parse(yaml: &str) -> DeviceSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_known_keys_and_free_form_properties() {
        let spec = parse(
            r#"
type: daq
driver: mockup/daq
connection: {type: usb, port: 1}
trigger: external
trigger_source: PFI0
"#,
        );
        assert!(spec.is_daq());
        assert_eq!(spec.driver.as_deref(), Some("mockup/daq"));
        assert_eq!(spec.connection.port.as_deref(), Some("1"));
        assert_eq!(
            spec.properties.get("trigger_source"),
            Some(&ParameterValue::from("PFI0"))
        );
        assert!(!spec.properties.contains_key("driver"));
    }

    #[test]
    fn test_channels_from_mapping_keep_order_and_names() {
        let spec = parse(
            r#"
type: scope
sensors:
  PD2: {port: 1, units: V}
  PD1: {port: 0, units: V, gain: 10}
actuators:
  - {name: Offset, port: ao0, calibration: {units: V, slope: 1}}
"#,
        );
        let names: Vec<_> = spec.sensors.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["PD2", "PD1"]);
        assert_eq!(spec.sensors[1].properties["gain"], ParameterValue::Int(10));
        assert_eq!(spec.actuators[0].port.as_deref(), Some("ao0"));
        assert_eq!(spec.actuators[0].calibration.as_ref().unwrap().offset, 0.0);
    }

    #[test]
    fn test_connected_device_requires_mode() {
        let mut spec = parse(
            r#"
type: analog daq
connection: {type: daq, device: NI-DAQ, port: 0}
"#,
        );
        spec.name = "Photodiode".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("has no 'mode'"));

        spec.mode = Some(ChannelMode::Monitor);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_duplicate_channel_names_are_rejected() {
        let mut spec = parse(
            r#"
type: scope
sensors: [{name: A}]
actuators: [{name: A}]
"#,
        );
        spec.name = "Scope".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_limits_check_converts_units() {
        let limits: Limits = serde_yaml::from_str("{min: 0 um, max: 100 um}").unwrap();
        assert!(limits.check("piezo", &Quantity::parse("0.05 mm").unwrap()).is_ok());
        let err = limits
            .check("piezo", &Quantity::parse("0.2 mm").unwrap())
            .unwrap_err();
        assert!(matches!(err, ExperimentorError::OutOfLimits { .. }));
    }

    #[test]
    fn test_as_channel_carries_calibration() {
        let mut spec = parse(
            r#"
type: analog daq
model: ni
mode: output
connection: {type: daq, device: NI-DAQ, port: 2}
calibration: {units: um, slope: 10, offset: 0}
"#,
        );
        spec.name = "Piezo X".to_string();
        let channel = spec.as_channel();
        assert!(spec.is_analog_channel());
        assert_eq!(channel.name, "Piezo X");
        assert_eq!(channel.port.as_deref(), Some("2"));
        assert_eq!(channel.units.as_deref(), Some("um"));
    }
}
