//! Driver traits and the driver factory.
//!
//! A driver is the vendor-specific object that talks to an instrument. The
//! framework treats it as opaque: every device gets a `Box<dyn Driver>`
//! built from the `driver:` reference of its description, and reaches the
//! richer interfaces through the role accessors ([`Driver::as_daq`],
//! [`Driver::as_laser`], [`Driver::as_positioner`]).
//!
//! All methods take `&self`; drivers keep their mutable state behind their
//! own locks so the registry can hand out shared references while a scan
//! is running.
//!
//! Failures are reported through `anyhow`. The device registry and the
//! measurement wrap them into [`ExperimentorError::Driver`] together with
//! the device name.

pub mod mock;

use crate::config::devices::{ChannelSpec, DeviceSpec};
use crate::core::Conditions;
use crate::error::{AppResult, ExperimentorError};
use crate::units::Quantity;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Handle to an acquisition task created by [`Daq::analog_input_setup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Whether an acquisition stops after `points` samples or keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sampling {
    Finite,
    Continuous,
}

/// Parameters of an analog acquisition on one DAQ card.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalogInputConditions {
    /// Time between samples.
    pub accuracy: Quantity,
    /// Samples per channel.
    pub points: usize,
    /// Channels to acquire, in the order their blocks appear in the buffer.
    pub devices: Vec<ChannelSpec>,
    pub trigger: Option<String>,
    pub trigger_source: Option<String>,
    pub sampling: Sampling,
}

/// Samples read from a task.
///
/// `data` holds `points` samples per channel, channel after channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalogReading {
    pub points: usize,
    pub data: Vec<f64>,
}

/// A DC level to write on one analog output channel.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalogOutput {
    pub channel: ChannelSpec,
    pub volts: f64,
}

/// State of a swept laser, as reported by the instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepCondition {
    Run,
    Pause,
    Stop,
}

/// Operations every driver supports.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open the connection to the instrument.
    async fn initialize(&self) -> Result<()>;

    /// Apply a dictionary of settings (the driver decides which keys it understands).
    async fn apply_values(&self, values: &Conditions) -> Result<()>;

    /// Read one sensor attached to this device.
    async fn read_value(&self, sensor: &ChannelSpec) -> Result<Quantity>;

    /// Set one actuator attached to this device.
    async fn apply_value(&self, actuator: &ChannelSpec, value: Quantity) -> Result<()>;

    /// Close the connection. Called once on shutdown.
    async fn finalize(&self) -> Result<()>;

    fn as_daq(&self) -> Option<&dyn Daq> {
        None
    }

    fn as_laser(&self) -> Option<&dyn SweptLaser> {
        None
    }

    fn as_positioner(&self) -> Option<&dyn Positioner> {
        None
    }
}

/// Data acquisition card with analog inputs, analog outputs and digital lines.
#[async_trait]
pub trait Daq: Send + Sync {
    async fn analog_input_setup(&self, conditions: &AnalogInputConditions) -> Result<TaskId>;

    async fn trigger_analog(&self, task: TaskId) -> Result<()>;

    /// Read `points` samples per channel, or everything available when `None`.
    async fn read_analog(&self, task: TaskId, points: Option<usize>) -> Result<AnalogReading>;

    async fn analog_output_dc(&self, output: &AnalogOutput) -> Result<()>;

    async fn digital_output(&self, port: &str, level: bool) -> Result<()>;

    async fn is_task_complete(&self, task: TaskId) -> Result<bool>;

    async fn stop_task(&self, task: TaskId) -> Result<()>;

    async fn clear_task(&self, task: TaskId) -> Result<()>;

    async fn reset_device(&self) -> Result<()>;
}

/// Tunable laser that sweeps its wavelength between two limits.
#[async_trait]
pub trait SweptLaser: Send + Sync {
    async fn execute_sweep(&self) -> Result<()>;

    async fn pause_sweep(&self) -> Result<()>;

    async fn stop_sweep(&self) -> Result<()>;

    async fn sweep_condition(&self) -> Result<SweepCondition>;
}

/// Anything that moves and needs time to settle.
#[async_trait]
pub trait Positioner: Send + Sync {
    async fn finished_moving(&self) -> Result<bool>;
}

type DriverFactory = Box<dyn Fn(&DeviceSpec) -> Result<Box<dyn Driver>> + Send + Sync>;

/// Maps `driver:` references to the code that builds the driver.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the simulated drivers under `mockup/daq`, `mockup/laser`,
    /// `mockup/stage` and `mockup/generic`.
    pub fn with_mockups() -> Self {
        let mut registry = Self::new();
        registry.register("mockup/daq", |spec| {
            Ok(Box::new(mock::MockDaq::new(&spec.name)) as Box<dyn Driver>)
        });
        registry.register("mockup/laser", |spec| {
            let polls = spec
                .properties
                .get("sweep_polls")
                .and_then(|v| v.as_i64())
                .map(|n| n.max(0) as u32)
                .unwrap_or(mock::DEFAULT_SWEEP_POLLS);
            Ok(Box::new(mock::MockLaser::with_sweep_polls(polls)) as Box<dyn Driver>)
        });
        registry.register("mockup/stage", |_| {
            Ok(Box::new(mock::MockStage::new()) as Box<dyn Driver>)
        });
        registry.register("mockup/generic", |_| {
            Ok(Box::new(mock::MockGeneric::new()) as Box<dyn Driver>)
        });
        registry
    }

    /// Register (or replace) the factory for `reference`.
    pub fn register<F>(&mut self, reference: impl Into<String>, factory: F)
    where
        F: Fn(&DeviceSpec) -> Result<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories.insert(reference.into(), Box::new(factory));
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.factories.contains_key(reference)
    }

    /// Build the driver named by `spec.driver`.
    pub fn create(&self, spec: &DeviceSpec) -> AppResult<Box<dyn Driver>> {
        let reference = spec
            .driver
            .as_deref()
            .ok_or_else(|| ExperimentorError::DriverNotInitialized(spec.name.clone()))?;
        let factory = self
            .factories
            .get(reference)
            .ok_or_else(|| ExperimentorError::UnknownDriver(reference.to_string()))?;
        factory(spec).map_err(|e| ExperimentorError::driver(&spec.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> DeviceSpec {
        let mut spec: DeviceSpec = serde_yaml::from_str(yaml).unwrap();
        spec.name = "Device".to_string();
        spec
    }

    #[test]
    fn test_mockups_are_registered() {
        let registry = DriverRegistry::with_mockups();
        for reference in ["mockup/daq", "mockup/laser", "mockup/stage", "mockup/generic"] {
            assert!(registry.contains(reference), "{} missing", reference);
        }
    }

    #[test]
    fn test_unknown_reference() {
        let registry = DriverRegistry::with_mockups();
        let result = registry.create(&spec("{type: daq, driver: vendor/unknown}"));
        assert!(matches!(result, Err(ExperimentorError::UnknownDriver(ref r)) if r == "vendor/unknown"));
    }

    #[test]
    fn test_roles_follow_driver_kind() {
        let registry = DriverRegistry::with_mockups();
        let daq = registry.create(&spec("{type: daq, driver: mockup/daq}")).unwrap();
        assert!(daq.as_daq().is_some());
        assert!(daq.as_laser().is_none());

        let laser = registry
            .create(&spec("{type: scan laser, driver: mockup/laser}"))
            .unwrap();
        assert!(laser.as_laser().is_some());
        assert!(laser.as_positioner().is_none());

        let stage = registry
            .create(&spec("{type: stage, driver: mockup/stage}"))
            .unwrap();
        assert!(stage.as_positioner().is_some());
    }

    #[test]
    fn test_custom_factory_errors_carry_device_name() {
        let mut registry = DriverRegistry::new();
        registry.register("vendor/broken", |_| Err(anyhow::anyhow!("no such port")));
        let err = registry
            .create(&spec("{type: scope, driver: vendor/broken}"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Device"));
        assert!(err.to_string().contains("no such port"));
    }
}
