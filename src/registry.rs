//! Device registry.
//!
//! Holds every device of an experiment, in the order they were described,
//! together with the per-DAQ routing tables:
//!
//! - **input** / **output**: channels wired to the card, selected by each
//!   device's `mode`, plus the card's own nested sensors and actuators.
//! - **monitor**: the detectors read during the current scan, rebuilt for
//!   every scan.
//!
//! Devices without a `driver:` reference are kept as passive descriptions
//! (typically channels that are driven through the DAQ they are plugged into).

use crate::config::devices::{ChannelMode, ChannelSpec, DeviceSpec};
use crate::config::loader::merge_values;
use crate::core::Conditions;
use crate::driver::{Daq, Driver, DriverRegistry, Positioner, SweptLaser, TaskId};
use crate::error::{AppResult, ExperimentorError};
use crate::units::Quantity;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// A described device and, once initialized, its driver.
pub struct Device {
    pub spec: DeviceSpec,
    driver: Option<Box<dyn Driver>>,
    /// Every value applied so far, merged.
    pub params: Conditions,
    pub sensors: Vec<ChannelSpec>,
    pub actuators: Vec<ChannelSpec>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.spec.name)
            .field("type", &self.spec.kind)
            .field("driver", &self.spec.driver)
            .field("initialized", &self.driver.is_some())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.spec.name, self.spec.kind)
    }
}

impl Device {
    pub fn new(mut spec: DeviceSpec) -> Self {
        let sensors = std::mem::take(&mut spec.sensors);
        let actuators = std::mem::take(&mut spec.actuators);
        Self {
            spec,
            driver: None,
            params: Conditions::new(),
            sensors,
            actuators,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    /// Install a driver built elsewhere, replacing any previous one.
    pub fn set_driver(&mut self, driver: Box<dyn Driver>) {
        self.driver = Some(driver);
    }

    pub fn driver(&self) -> AppResult<&dyn Driver> {
        self.driver
            .as_deref()
            .ok_or_else(|| ExperimentorError::DriverNotInitialized(self.spec.name.clone()))
    }

    pub fn daq(&self) -> AppResult<&dyn Daq> {
        self.driver()?
            .as_daq()
            .ok_or_else(|| self.unsupported("DAQ operations"))
    }

    pub fn laser(&self) -> AppResult<&dyn SweptLaser> {
        self.driver()?
            .as_laser()
            .ok_or_else(|| self.unsupported("wavelength sweeps"))
    }

    pub fn positioner(&self) -> AppResult<&dyn Positioner> {
        self.driver()?
            .as_positioner()
            .ok_or_else(|| self.unsupported("positioning"))
    }

    fn unsupported(&self, capability: &'static str) -> ExperimentorError {
        ExperimentorError::CapabilityNotSupported {
            device: self.spec.name.clone(),
            capability,
        }
    }

    /// Build and initialize the driver named in the description.
    ///
    /// Returns `false` for devices that have no driver reference.
    pub async fn initialize_driver(&mut self, drivers: &DriverRegistry) -> AppResult<bool> {
        if self.spec.driver.is_none() {
            debug!(device = %self.spec.name, "no driver reference, skipping initialization");
            return Ok(false);
        }
        let driver = drivers.create(&self.spec)?;
        driver
            .initialize()
            .await
            .map_err(|e| ExperimentorError::driver(&self.spec.name, e))?;
        info!(device = %self.spec.name, driver = ?self.spec.driver, "driver initialized");
        self.driver = Some(driver);
        Ok(true)
    }

    /// Forward `values` to the driver, if any, and record them in `params`
    /// once accepted. Rejected values leave `params` untouched.
    pub async fn apply_values(&mut self, values: &Conditions) -> AppResult<()> {
        if let Some(driver) = &self.driver {
            driver
                .apply_values(values)
                .await
                .map_err(|e| ExperimentorError::driver(&self.spec.name, e))?;
        }
        merge_values(&mut self.params, values);
        Ok(())
    }

    /// A parameter applied earlier, read as a quantity.
    pub fn param_quantity(&self, key: &str) -> AppResult<Quantity> {
        self.params
            .get(key)
            .ok_or_else(|| ExperimentorError::missing(&self.spec.name, key))?
            .as_quantity()
    }

    pub fn sensor(&self, name: &str) -> AppResult<&ChannelSpec> {
        self.sensors
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.unknown_channel(name))
    }

    pub fn actuator(&self, name: &str) -> AppResult<&ChannelSpec> {
        self.actuators
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.unknown_channel(name))
    }

    fn unknown_channel(&self, name: &str) -> ExperimentorError {
        ExperimentorError::UnknownChannel {
            device: self.spec.name.clone(),
            channel: name.to_string(),
        }
    }

    /// Read one attached sensor through the driver.
    pub async fn read_sensor(&self, name: &str) -> AppResult<Quantity> {
        let sensor = self.sensor(name)?;
        self.driver()?
            .read_value(sensor)
            .await
            .map_err(|e| ExperimentorError::driver(&self.spec.name, e))
    }

    /// Set one attached actuator through the driver, after checking its limits.
    pub async fn set_actuator(&self, name: &str, value: Quantity) -> AppResult<()> {
        let actuator = self.actuator(name)?;
        if let Some(limits) = &actuator.limits {
            limits.check(&actuator.name, &value)?;
        }
        self.driver()?
            .apply_value(actuator, value)
            .await
            .map_err(|e| ExperimentorError::driver(&self.spec.name, e))
    }

    async fn finalize(&mut self) -> AppResult<()> {
        if let Some(driver) = self.driver.take() {
            driver
                .finalize()
                .await
                .map_err(|e| ExperimentorError::driver(&self.spec.name, e))?;
            debug!(device = %self.spec.name, "driver finalized");
        }
        Ok(())
    }
}

/// Channels routed to one DAQ card.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DaqRoute {
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub monitor: Vec<String>,
    /// Acquisition task of the current scan.
    pub monitor_task: Option<TaskId>,
}

impl DaqRoute {
    fn list_mut(&mut self, mode: ChannelMode) -> &mut Vec<String> {
        match mode {
            ChannelMode::Input => &mut self.input,
            ChannelMode::Output => &mut self.output,
            ChannelMode::Monitor => &mut self.monitor,
        }
    }
}

/// All devices of an experiment.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    order: Vec<String>,
    output_devices: Vec<String>,
    rotation_stages: Vec<String>,
    daqs: HashMap<String, DaqRoute>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a described device. Names must be unique.
    pub fn insert(&mut self, spec: DeviceSpec) -> AppResult<()> {
        if self.devices.contains_key(&spec.name) {
            return Err(ExperimentorError::Configuration(format!(
                "device '{}' is already registered",
                spec.name
            )));
        }
        let name = spec.name.clone();
        if spec.has_outputs() {
            self.output_devices.push(name.clone());
        }
        if spec.is_rotation_stage() {
            self.rotation_stages.push(name.clone());
        }
        let device = Device::new(spec);
        info!("Added {} to the experiment", device);
        self.order.push(name.clone());
        self.devices.insert(name, device);
        Ok(())
    }

    pub fn get(&self, name: &str) -> AppResult<&Device> {
        self.devices
            .get(name)
            .ok_or_else(|| ExperimentorError::UnknownDevice(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> AppResult<&mut Device> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| ExperimentorError::UnknownDevice(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Device names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Devices that declare `outputs`.
    pub fn output_devices(&self) -> &[String] {
        &self.output_devices
    }

    pub fn rotation_stages(&self) -> &[String] {
        &self.rotation_stages
    }

    pub fn sensor(&self, device: &str, name: &str) -> AppResult<&ChannelSpec> {
        self.get(device)?.sensor(name)
    }

    pub fn actuator(&self, device: &str, name: &str) -> AppResult<&ChannelSpec> {
        self.get(device)?.actuator(name)
    }

    /// Create an empty route for the DAQ `name`. Existing routes are kept.
    pub fn register_daq(&mut self, name: &str) -> AppResult<()> {
        if !self.contains(name) {
            return Err(ExperimentorError::UnknownDevice(name.to_string()));
        }
        self.daqs.entry(name.to_string()).or_default();
        Ok(())
    }

    pub fn route(&self, daq: &str) -> Option<&DaqRoute> {
        self.daqs.get(daq)
    }

    pub fn route_mut(&mut self, daq: &str) -> Option<&mut DaqRoute> {
        self.daqs.get_mut(daq)
    }

    /// Registered DAQs in insertion order.
    pub fn daq_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.daqs.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    fn route_for(&mut self, device: &str, daq: &str) -> AppResult<&mut DaqRoute> {
        if !self.devices.contains_key(daq) {
            return Err(ExperimentorError::UnknownDevice(daq.to_string()));
        }
        self.daqs.get_mut(daq).ok_or_else(|| {
            ExperimentorError::Configuration(format!(
                "device '{}' is connected to '{}', which is not a registered DAQ",
                device, daq
            ))
        })
    }

    /// Rebuild every route from the device descriptions.
    ///
    /// Devices with `connection.device` go to the list selected by their
    /// `mode`; a DAQ's own sensors are inputs and its actuators outputs.
    pub fn connect_all_devices_to_daq(&mut self) -> AppResult<()> {
        for route in self.daqs.values_mut() {
            route.input.clear();
            route.output.clear();
            route.monitor.clear();
        }

        for name in self.order.clone() {
            if !self.daqs.contains_key(&name) {
                continue;
            }
            let device = self.get(&name)?;
            let sensors: Vec<String> = device.sensors.iter().map(|c| c.name.clone()).collect();
            let actuators: Vec<String> = device.actuators.iter().map(|c| c.name.clone()).collect();
            if let Some(route) = self.daqs.get_mut(&name) {
                route.input.extend(sensors);
                route.output.extend(actuators);
            }
        }

        for name in self.order.clone() {
            let device = self.get(&name)?;
            let Some(daq) = device.spec.connected_to().map(str::to_string) else {
                continue;
            };
            let mode = device.spec.mode.ok_or_else(|| {
                ExperimentorError::Configuration(format!(
                    "device '{}' is connected to '{}' but has no 'mode'",
                    name, daq
                ))
            })?;
            self.route_for(&name, &daq)?.list_mut(mode).push(name.clone());
            debug!(device = %name, daq = %daq, %mode, "appended to DAQ");
        }
        Ok(())
    }

    /// Empty every monitor list and forget the monitor tasks.
    pub fn clear_monitors(&mut self) {
        for route in self.daqs.values_mut() {
            route.monitor.clear();
            route.monitor_task = None;
        }
    }

    /// Route `device` to the monitor list of the DAQ it is plugged into.
    pub fn connect_monitor(&mut self, device: &str) -> AppResult<()> {
        let daq = self
            .get(device)?
            .spec
            .connected_to()
            .map(str::to_string)
            .ok_or_else(|| {
                ExperimentorError::Configuration(format!(
                    "detector '{}' is not connected to a DAQ",
                    device
                ))
            })?;
        let route = self.route_for(device, &daq)?;
        if !route.monitor.iter().any(|d| d == device) {
            route.monitor.push(device.to_string());
        }
        Ok(())
    }

    /// DAQs with at least one monitored channel, in insertion order.
    pub fn monitored_daqs(&self) -> Vec<&str> {
        self.daq_names()
            .into_iter()
            .filter(|name| self.daqs.get(*name).is_some_and(|r| !r.monitor.is_empty()))
            .collect()
    }

    /// Channel descriptions of a DAQ's monitored devices, in monitor order.
    pub fn monitor_channels(&self, daq: &str) -> AppResult<Vec<ChannelSpec>> {
        let route = self
            .daqs
            .get(daq)
            .ok_or_else(|| ExperimentorError::UnknownDevice(daq.to_string()))?;
        route
            .monitor
            .iter()
            .map(|name| match self.devices.get(name) {
                Some(device) => Ok(device.spec.as_channel()),
                None => self.get(daq)?.sensor(name).cloned(),
            })
            .collect()
    }

    /// Finalize every driver, last device first.
    ///
    /// All drivers are finalized even if some fail; the failures are returned together.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for name in self.order.iter().rev() {
            if let Some(device) = self.devices.get_mut(name) {
                if let Err(e) = device.finalize().await {
                    warn!(device = %name, error = %e, "failed to finalize driver");
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExperimentorError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_devices;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex as StdMutex};

    const DEVICES: &str = r#"
NI-DAQ:
  type: daq
  driver: mockup/daq
  trigger: external
  trigger_source: PFI0
  sensors:
    Internal PD: {port: 7}
Photodiode 1:
  type: analog daq
  model: ni
  mode: input
  connection: {type: daq, device: NI-DAQ, port: 0}
Piezo X:
  type: analog daq
  model: ni
  mode: output
  outputs: [position]
  connection: {type: daq, device: NI-DAQ, port: 2}
  calibration: {units: um, slope: 10}
Rotator:
  type: Rotation Stage
  driver: mockup/stage
"#;

    fn registry() -> DeviceRegistry {
        let doc = serde_yaml::from_str(DEVICES).unwrap();
        let mut registry = DeviceRegistry::new();
        for spec in parse_devices(doc, Path::new("")).unwrap() {
            registry.insert(spec).unwrap();
        }
        registry
    }

    #[test]
    fn test_insert_tracks_outputs_and_rotation_stages() {
        let registry = registry();
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            ["NI-DAQ", "Photodiode 1", "Piezo X", "Rotator"]
        );
        assert_eq!(registry.output_devices(), ["Piezo X"]);
        assert_eq!(registry.rotation_stages(), ["Rotator"]);
        assert!(registry.sensor("NI-DAQ", "Internal PD").is_ok());
        assert!(matches!(
            registry.get("Missing"),
            Err(ExperimentorError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_connect_all_devices_routes_by_mode() {
        let mut registry = registry();
        registry.register_daq("NI-DAQ").unwrap();
        registry.connect_all_devices_to_daq().unwrap();

        let route = registry.route("NI-DAQ").unwrap();
        assert_eq!(route.input, ["Internal PD", "Photodiode 1"]);
        assert_eq!(route.output, ["Piezo X"]);
        assert!(route.monitor.is_empty());

        // running it again does not duplicate entries
        registry.connect_all_devices_to_daq().unwrap();
        assert_eq!(registry.route("NI-DAQ").unwrap().output.len(), 1);
    }

    #[test]
    fn test_connection_to_unregistered_daq_fails() {
        let mut registry = registry();
        let err = registry.connect_all_devices_to_daq().unwrap_err();
        assert!(err.to_string().contains("not a registered DAQ"));
    }

    #[test]
    fn test_monitors_are_rebuilt_per_scan() {
        let mut registry = registry();
        registry.register_daq("NI-DAQ").unwrap();
        assert!(registry.monitored_daqs().is_empty());

        registry.connect_monitor("Photodiode 1").unwrap();
        registry.connect_monitor("Photodiode 1").unwrap();
        assert_eq!(registry.monitored_daqs(), ["NI-DAQ"]);
        let channels = registry.monitor_channels("NI-DAQ").unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].port.as_deref(), Some("0"));

        registry.clear_monitors();
        assert!(registry.monitored_daqs().is_empty());
        assert!(registry.connect_monitor("Rotator").is_err());
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let mut registry = registry();
        let drivers = DriverRegistry::with_mockups();

        assert!(registry
            .get_mut("NI-DAQ")
            .unwrap()
            .initialize_driver(&drivers)
            .await
            .unwrap());
        assert!(!registry
            .get_mut("Photodiode 1")
            .unwrap()
            .initialize_driver(&drivers)
            .await
            .unwrap());

        assert!(registry.get("NI-DAQ").unwrap().daq().is_ok());
        assert!(matches!(
            registry.get("NI-DAQ").unwrap().laser(),
            Err(ExperimentorError::CapabilityNotSupported { .. })
        ));
        assert!(matches!(
            registry.get("Photodiode 1").unwrap().driver(),
            Err(ExperimentorError::DriverNotInitialized(_))
        ));

        registry.shutdown().await.unwrap();
        assert!(!registry.get("NI-DAQ").unwrap().has_driver());
    }

    #[tokio::test]
    async fn test_apply_values_merges_params_without_driver() {
        let mut registry = registry();
        let device = registry.get_mut("Piezo X").unwrap();
        let mut values = Conditions::new();
        values.insert("position".to_string(), "3 um".into());
        device.apply_values(&values).await.unwrap();
        let position = device.param_quantity("position").unwrap();
        assert!((position.m_as("um").unwrap() - 3.0).abs() < 1e-9);
        assert!(device.param_quantity("speed").is_err());
    }

    /// Driver that logs its finalization into a shared list.
    struct Recorder {
        name: String,
        fail: bool,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Driver for Recorder {
        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn apply_values(&self, _values: &Conditions) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_value(&self, sensor: &ChannelSpec) -> anyhow::Result<Quantity> {
            Err(anyhow::anyhow!("no sensor '{}'", sensor.name))
        }

        async fn apply_value(&self, actuator: &ChannelSpec, _value: Quantity) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("no actuator '{}'", actuator.name))
        }

        async fn finalize(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                anyhow::bail!("connection already lost");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_and_collects_failures() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut drivers = DriverRegistry::new();
        let shared = log.clone();
        drivers.register("test/recorder", move |spec| {
            Ok(Box::new(Recorder {
                name: spec.name.clone(),
                fail: spec.name == "Laser",
                log: shared.clone(),
            }) as Box<dyn Driver>)
        });

        let doc = serde_yaml::from_str(
            "DAQ: {type: daq, driver: test/recorder}\n\
             Laser: {type: scan laser, driver: test/recorder}\n\
             Stage: {type: stage, driver: test/recorder}\n",
        )
        .unwrap();
        let mut registry = DeviceRegistry::new();
        for spec in parse_devices(doc, Path::new("")).unwrap() {
            registry.insert(spec).unwrap();
        }
        for name in ["DAQ", "Laser", "Stage"] {
            registry
                .get_mut(name)
                .unwrap()
                .initialize_driver(&drivers)
                .await
                .unwrap();
        }

        let err = registry.shutdown().await.unwrap_err();
        match err {
            ExperimentorError::ShutdownFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    &errors[0],
                    ExperimentorError::Driver { device, .. } if device == "Laser"
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), ["Stage", "Laser", "DAQ"]);
        for name in ["DAQ", "Laser", "Stage"] {
            assert!(!registry.get(name).unwrap().has_driver());
        }
    }
}
