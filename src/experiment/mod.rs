//! Measurement workflow.
//!
//! A [`Measurement`] is built from an experiment document. Every top-level
//! key of the document is available as an attribute; the workflow reads the
//! `init`, `scan` and `monitor` sections through typed views. The steps of a
//! 2-D scan (laser wavelength against one axis) are:
//!
//! 1. `load_devices` reads the devices file named in `init.devices`
//! 2. `initialize_devices` starts the drivers and applies their defaults
//! 3. `connect_all_devices_to_daq` builds the per-DAQ routes
//! 4. `setup_scan` prepares the laser and the DAQs, without triggering
//! 5. `do_scan` steps the axis and runs one `do_line_scan` per point
//! 6. `read_scans` collects the traces
//!
//! Continuous monitoring follows the same pattern with
//! `setup_continuous_scans`, `start_continuous_scans` and
//! `read_continuous_scans`.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ExperimentConfig::load("config/measurement.yml")?;
//! let mut measurement = Measurement::new(config);
//! measurement.load_devices()?;
//! measurement.initialize_devices(&DriverRegistry::with_mockups()).await?;
//! measurement.connect_all_devices_to_daq()?;
//! let plan = measurement.setup_scan().await?;
//! measurement.do_scan().await?;
//! let data = measurement.read_scans().await?;
//! measurement.finalize().await?;
//! ```

pub mod data;
pub mod plan;

pub use data::{split_blocks, ScanData, Trace};
pub use plan::{linspace, AxisPlan, ScanPlan, SweepParams, SWEEPS_KEY};

use crate::config::experiment::{ExperimentConfig, MonitorConfig, ShutterConfig};
use crate::config::loader::{load_devices_file, merge_values, read_defaults};
use crate::core::{Conditions, ParameterValue};
use crate::driver::{
    AnalogInputConditions, AnalogOutput, DriverRegistry, Sampling, SweepCondition, TaskId,
};
use crate::error::{AppResult, ExperimentorError};
use crate::registry::DeviceRegistry;
use crate::settings::{ScanSettings, Settings};
use crate::units::Quantity;
use self::plan::duration_of;
use serde_yaml::Value;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// An experiment: its document, its devices and the scan timing settings.
#[derive(Debug)]
pub struct Measurement {
    config: ExperimentConfig,
    devices: DeviceRegistry,
    settings: ScanSettings,
}

impl Measurement {
    /// Measurement with the default scan timing.
    pub fn new(config: ExperimentConfig) -> Self {
        Self::with_settings(config, &Settings::default())
    }

    pub fn with_settings(config: ExperimentConfig, settings: &Settings) -> Self {
        Self {
            config,
            devices: DeviceRegistry::new(),
            settings: settings.scan.clone(),
        }
    }

    /// A top-level attribute of the experiment document.
    pub fn attr(&self, key: &str) -> AppResult<&Value> {
        self.config
            .attribute(key)
            .ok_or_else(|| ExperimentorError::MissingAttribute(key.to_string()))
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ExperimentConfig {
        &mut self.config
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Register every device of the devices file named in `init.devices`.
    pub fn load_devices(&mut self) -> AppResult<usize> {
        let init = self.config.init()?;
        let specs = load_devices_file(&init.devices)?;
        let count = specs.len();
        for spec in specs {
            self.devices.insert(spec)?;
        }
        info!(file = %init.devices.display(), count, "devices loaded");
        Ok(count)
    }

    /// Start every driver, apply the defaults overlays and register the DAQs.
    pub async fn initialize_devices(&mut self, drivers: &DriverRegistry) -> AppResult<()> {
        let names: Vec<String> = self.devices.names().map(str::to_string).collect();
        for name in names {
            info!("Starting {}", name);
            let device = self.devices.get_mut(&name)?;
            device.initialize_driver(drivers).await?;
            if let Some(path) = device.spec.defaults.clone() {
                let defaults = read_defaults(&path, &name).await?;
                device.apply_values(&defaults).await?;
                debug!(device = %name, file = %path.display(), "defaults applied");
            }
            if device.spec.is_daq() {
                self.devices.register_daq(&name)?;
            }
        }
        Ok(())
    }

    pub fn connect_all_devices_to_daq(&mut self) -> AppResult<()> {
        self.devices.connect_all_devices_to_daq()
    }

    /// Route the scan's detectors to the monitor lists of their DAQs.
    pub fn connect_monitor_devices_to_daq(&mut self) -> AppResult<()> {
        let scan = self.config.scan()?;
        self.route_detectors(&scan.detectors)
    }

    fn route_detectors(&mut self, detectors: &[String]) -> AppResult<()> {
        self.devices.clear_monitors();
        for detector in detectors {
            self.devices.connect_monitor(detector)?;
        }
        Ok(())
    }

    /// Set values on a device.
    ///
    /// Analog channels (`model: ni`) take a single value, converted to volts
    /// through their calibration and written by the DAQ they are plugged
    /// into. Any other device receives `values` through `apply_values`.
    #[instrument(skip(self, values))]
    pub async fn set_value_to_device(&mut self, name: &str, values: &Conditions) -> AppResult<()> {
        let device = self.devices.get(name)?;
        if !device.spec.is_analog_channel() {
            return self.devices.get_mut(name)?.apply_values(values).await;
        }

        let daq_name = device
            .spec
            .connected_to()
            .ok_or_else(|| {
                ExperimentorError::Configuration(format!(
                    "analog channel '{}' is not connected to a DAQ",
                    name
                ))
            })?
            .to_string();
        let value = match values.values().collect::<Vec<_>>().as_slice() {
            [value] => value.as_quantity()?,
            _ => {
                return Err(ExperimentorError::Configuration(format!(
                    "analog channel '{}' takes exactly one value, got {}",
                    name,
                    values.len()
                )))
            }
        };
        if let Some(limits) = &device.spec.limits {
            limits.check(name, &value)?;
        }
        let volts = match &device.spec.calibration {
            Some(calibration) => calibration.to_volts(&value)?,
            None => value.m_as("V")?,
        };
        let output = AnalogOutput {
            channel: device.spec.as_channel(),
            volts,
        };

        self.devices
            .get(&daq_name)?
            .daq()?
            .analog_output_dc(&output)
            .await
            .map_err(|e| ExperimentorError::driver(&daq_name, e))?;
        debug!(device = %name, daq = %daq_name, %value, volts, "analog output set");
        merge_values(&mut self.devices.get_mut(name)?.params, values);
        Ok(())
    }

    // =========================================================================
    // Shutter
    // =========================================================================

    fn shutter_daq<'a>(&'a self, shutter: &'a ShutterConfig) -> &'a str {
        shutter
            .device
            .as_deref()
            .unwrap_or(self.settings.shutter_daq.as_str())
    }

    async fn set_shutter(&self, shutter: &ShutterConfig, open: bool) -> AppResult<()> {
        let daq = self.shutter_daq(shutter);
        self.devices
            .get(daq)?
            .daq()?
            .digital_output(&shutter.port, open)
            .await
            .map_err(|e| ExperimentorError::driver(daq, e))
    }

    /// Close, open and close the shutter so that a high line means open.
    pub async fn sync_shutter(&self) -> AppResult<()> {
        let shutter = self.config.scan()?.shutter;
        let pause = self.settings.shutter_sync();
        self.set_shutter(&shutter, false).await?;
        sleep(pause).await;
        self.set_shutter(&shutter, true).await?;
        sleep(pause).await;
        self.set_shutter(&shutter, false).await
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Set up the DAQ of every monitored detector for one acquisition.
    async fn setup_daqs(
        &mut self,
        accuracy: &Quantity,
        points: usize,
    ) -> AppResult<Vec<(String, TaskId)>> {
        let daqs: Vec<String> = self
            .devices
            .monitored_daqs()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut tasks = Vec::with_capacity(daqs.len());

        for name in daqs {
            let device = self.devices.get(&name)?;
            let property = |key: &str| device.spec.properties.get(key).and_then(ParameterValue::as_string);
            let conditions = AnalogInputConditions {
                accuracy: accuracy.clone(),
                points,
                devices: self.devices.monitor_channels(&name)?,
                trigger: property("trigger"),
                trigger_source: property("trigger_source"),
                sampling: Sampling::Continuous,
            };
            let task = device
                .daq()?
                .analog_input_setup(&conditions)
                .await
                .map_err(|e| ExperimentorError::driver(&name, e))?;
            info!(
                daq = %name,
                %task,
                channels = conditions.devices.len(),
                trigger_source = ?conditions.trigger_source,
                "analog input set up"
            );
            if let Some(route) = self.devices.route_mut(&name) {
                route.monitor_task = Some(task);
            }
            tasks.push((name, task));
        }
        Ok(tasks)
    }

    /// Prepare the laser and the DAQs for a 2-D scan without triggering anything.
    ///
    /// The laser always performs at least one sweep per line. A failure to
    /// apply the laser parameters is logged and the setup continues, sized
    /// from the requested values.
    pub async fn setup_scan(&mut self) -> AppResult<ScanPlan> {
        let scan = self.config.scan()?;
        let mut params = scan.laser.params.clone();
        let sweeps = params.get(SWEEPS_KEY).and_then(ParameterValue::as_i64);
        if sweeps.map_or(true, |n| n < 1) {
            params.insert(SWEEPS_KEY.to_string(), ParameterValue::Int(1));
        }

        let laser = self.devices.get_mut(&scan.laser.name)?;
        let mut requested = laser.params.clone();
        merge_values(&mut requested, &params);
        if let Err(e) = laser.apply_values(&params).await {
            warn!(laser = %scan.laser.name, error = %e, "Problem changing values of the laser");
        }
        let sweep = SweepParams::from_params(&scan.laser.name, &requested)?;

        self.route_detectors(&scan.detectors)?;

        let axis = AxisPlan::from_config(&scan.axis.device)?;
        let points_per_line = sweep.points_per_sweep()? * sweep.sweeps.max(1) as usize;
        let total_points = points_per_line * axis.len();
        let accuracy = sweep.accuracy()?;
        let tasks = self.setup_daqs(&accuracy, total_points).await?;

        let approx_time_to_scan = sweep.approx_time()?;
        self.config.set_nested(
            "scan",
            "approx_time_to_scan",
            Value::String(approx_time_to_scan.to_string()),
        );
        info!(
            lines = axis.len(),
            points_per_line,
            total_points,
            %accuracy,
            %approx_time_to_scan,
            "scan set up"
        );

        Ok(ScanPlan {
            axis: Some(axis),
            points_per_line,
            total_points,
            accuracy,
            approx_time_to_scan,
            tasks,
        })
    }

    /// One wavelength sweep with the shutter open.
    pub async fn do_line_scan(&self) -> AppResult<()> {
        let scan = self.config.scan()?;
        let laser = self.devices.get(&scan.laser.name)?;
        let sweep = SweepParams::from_params(&scan.laser.name, &laser.params)?;
        let poll = duration_of(
            &(sweep.approx_time()? * f64::from(sweep.sweeps.max(1))
                * (1.0 / f64::from(self.settings.monitor_read_scan))),
        )?;
        let delay = duration_of(&scan.shutter.delay)?;

        self.set_shutter(&scan.shutter, false).await?;
        sleep(delay).await;
        self.set_shutter(&scan.shutter, true).await?;

        let swept = async {
            let driver = laser.laser()?;
            let wrap = |e| ExperimentorError::driver(&scan.laser.name, e);
            driver.execute_sweep().await.map_err(wrap)?;
            while driver.sweep_condition().await.map_err(wrap)? != SweepCondition::Stop {
                sleep(poll).await;
            }
            Ok::<(), ExperimentorError>(())
        }
        .await;

        let closed = self.set_shutter(&scan.shutter, false).await;
        swept?;
        closed
    }

    /// Run the whole 2-D scan set up by `setup_scan`. Returns the number of line scans.
    pub async fn do_scan(&mut self) -> AppResult<usize> {
        let scan = self.config.scan()?;
        let axis = AxisPlan::from_config(&scan.axis.device)?;
        info!(lines = axis.len(), "scan started");

        match &axis {
            AxisPlan::Device {
                device,
                output,
                values,
            } => {
                let output = output
                    .clone()
                    .ok_or_else(|| ExperimentorError::missing(device.as_str(), "output"))?;
                for value in values {
                    let mut conditions = Conditions::new();
                    conditions.insert(output.clone(), value.clone().into());
                    self.set_value_to_device(device, &conditions).await?;
                    self.wait_until_settled(device).await?;
                    self.do_line_scan().await?;
                }
            }
            AxisPlan::Time { repeats } => {
                for _ in 0..*repeats {
                    self.do_line_scan().await?;
                }
            }
        }

        info!(lines = axis.len(), "scan finished");
        Ok(axis.len())
    }

    /// Wait for a positioner to report it stopped moving. Devices that are
    /// not positioners (analog channels, for instance) only get the settle delay.
    async fn wait_until_settled(&self, name: &str) -> AppResult<()> {
        sleep(self.settings.settle_delay()).await;
        let device = self.devices.get(name)?;
        let Some(positioner) = device.driver().ok().and_then(|d| d.as_positioner()) else {
            return Ok(());
        };
        while !positioner
            .finished_moving()
            .await
            .map_err(|e| ExperimentorError::driver(name, e))?
        {
            sleep(self.settings.settle_poll()).await;
        }
        Ok(())
    }

    /// Read every available sample from the monitored DAQs.
    pub async fn read_scans(&self) -> AppResult<ScanData> {
        let mut traces = Vec::new();
        for name in self.devices.monitored_daqs() {
            let route = self
                .devices
                .route(name)
                .ok_or_else(|| ExperimentorError::UnknownDevice(name.to_string()))?;
            let task = Self::monitor_task(name, route.monitor_task)?;
            let reading = self
                .devices
                .get(name)?
                .daq()?
                .read_analog(task, None)
                .await
                .map_err(|e| ExperimentorError::driver(name, e))?;
            debug!(daq = %name, %task, points = reading.points, "read analog data");
            traces.extend(split_blocks(name, &route.monitor, reading.points, reading.data)?);
        }
        Ok(ScanData::new(traces))
    }

    /// Same as [`Measurement::read_scans`], for continuous monitoring.
    pub async fn read_continuous_scans(&self) -> AppResult<ScanData> {
        self.read_scans().await
    }

    fn monitor_task(daq: &str, task: Option<TaskId>) -> AppResult<TaskId> {
        task.ok_or_else(|| {
            ExperimentorError::Configuration(format!("DAQ '{}' has no acquisition set up", daq))
        })
    }

    /// Stop and clear every monitor task that has not completed.
    async fn stop_incomplete_tasks(&mut self) -> AppResult<()> {
        let daqs: Vec<String> = self
            .devices
            .monitored_daqs()
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in daqs {
            let Some(task) = self.devices.route(&name).and_then(|r| r.monitor_task) else {
                continue;
            };
            let daq = self.devices.get(&name)?.daq()?;
            let wrap = |e| ExperimentorError::driver(&name, e);
            if !daq.is_task_complete(task).await.map_err(wrap)? {
                daq.stop_task(task).await.map_err(wrap)?;
                daq.clear_task(task).await.map_err(wrap)?;
                debug!(daq = %name, %task, "stopped incomplete task");
                if let Some(route) = self.devices.route_mut(&name) {
                    route.monitor_task = None;
                }
            }
        }
        Ok(())
    }

    /// Pause then stop the sweep. The stop is sent even if the pause fails.
    async fn halt_laser(&self, name: &str) -> AppResult<()> {
        let laser = self.devices.get(name)?.laser()?;
        let wrap = |e| ExperimentorError::driver(name, e);
        let paused = laser.pause_sweep().await.map_err(wrap);
        let stopped = laser.stop_sweep().await.map_err(wrap);
        paused.and(stopped)
    }

    /// Pause, then stop, the scan laser.
    pub async fn stop_laser(&self) -> AppResult<()> {
        let scan = self.config.scan()?;
        self.halt_laser(&scan.laser.name).await
    }

    /// Abort a scan: stop the laser, close the shutter and drop unfinished acquisitions.
    ///
    /// Every step runs even when an earlier one fails; the first error is returned.
    pub async fn stop_scan(&mut self) -> AppResult<()> {
        let scan = self.config.scan()?;
        let halted = self.halt_laser(&scan.laser.name).await;
        let closed = self.set_shutter(&scan.shutter, false).await;
        let cleared = self.stop_incomplete_tasks().await;
        let outcome = halted.and(closed).and(cleared);
        match &outcome {
            Ok(()) => info!("scan stopped"),
            Err(e) => warn!(error = %e, "scan stopped with errors"),
        }
        outcome
    }

    // =========================================================================
    // Continuous monitoring
    // =========================================================================

    /// Prepare endless sweeps for watching a signal.
    ///
    /// A `monitor` passed in replaces the `monitor` attribute. Unless the
    /// parameters say otherwise the laser sweeps until stopped.
    pub async fn setup_continuous_scans(
        &mut self,
        monitor: Option<MonitorConfig>,
    ) -> AppResult<ScanPlan> {
        let monitor = match monitor {
            Some(monitor) => {
                self.config
                    .set_attribute("monitor", serde_yaml::to_value(&monitor)?);
                monitor
            }
            None => self.config.monitor()?,
        };

        let mut params = monitor.laser.params.clone();
        params
            .entry(SWEEPS_KEY.to_string())
            .or_insert(ParameterValue::Int(0));
        let laser = self.devices.get_mut(&monitor.laser.name)?;
        laser.apply_values(&params).await?;
        let sweep = SweepParams::from_params(&monitor.laser.name, &laser.params)?;

        self.route_detectors(&monitor.detectors)?;

        let points = sweep.points_per_sweep()?;
        let accuracy = sweep.accuracy()? * self.settings.continuous_accuracy_factor;
        let approx_time_to_scan = sweep.approx_time()?;
        self.config.set_nested(
            "monitor",
            "approx_time_to_scan",
            Value::String(approx_time_to_scan.to_string()),
        );
        let tasks = self.setup_daqs(&accuracy, points).await?;
        info!(points, %accuracy, "continuous scans set up");

        Ok(ScanPlan {
            axis: None,
            points_per_line: points,
            total_points: points,
            accuracy,
            approx_time_to_scan,
            tasks,
        })
    }

    /// Trigger every idle monitor task and start the laser.
    pub async fn start_continuous_scans(&self) -> AppResult<()> {
        let monitor = self.config.monitor()?;
        for name in self.devices.monitored_daqs() {
            let task = Self::monitor_task(name, self.devices.route(name).and_then(|r| r.monitor_task))?;
            let daq = self.devices.get(name)?.daq()?;
            let wrap = |e| ExperimentorError::driver(name, e);
            if daq.is_task_complete(task).await.map_err(wrap)? {
                daq.trigger_analog(task).await.map_err(wrap)?;
            }
        }
        self.devices
            .get(&monitor.laser.name)?
            .laser()?
            .execute_sweep()
            .await
            .map_err(|e| ExperimentorError::driver(&monitor.laser.name, e))?;
        info!(laser = %monitor.laser.name, "continuous scans started");
        Ok(())
    }

    pub async fn stop_continuous_scans(&mut self) -> AppResult<()> {
        let monitor = self.config.monitor()?;
        let halted = self.halt_laser(&monitor.laser.name).await;
        let cleared = self.stop_incomplete_tasks().await;
        let outcome = halted.and(cleared);
        match &outcome {
            Ok(()) => info!("continuous scans stopped"),
            Err(e) => warn!(error = %e, "continuous scans stopped with errors"),
        }
        outcome
    }

    pub async fn pause_continuous_scans(&self) -> AppResult<()> {
        let monitor = self.config.monitor()?;
        self.devices
            .get(&monitor.laser.name)?
            .laser()?
            .pause_sweep()
            .await
            .map_err(|e| ExperimentorError::driver(&monitor.laser.name, e))
    }

    pub async fn resume_continuous_scans(&self) -> AppResult<()> {
        let monitor = self.config.monitor()?;
        self.devices
            .get(&monitor.laser.name)?
            .laser()?
            .execute_sweep()
            .await
            .map_err(|e| ExperimentorError::driver(&monitor.laser.name, e))
    }

    /// Shut every driver down.
    pub async fn finalize(&mut self) -> AppResult<()> {
        self.devices.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_devices;
    use crate::driver::mock::{MockDaq, MockLaser};
    use crate::driver::Driver;
    use std::path::Path;
    use tracing_test::traced_test;

    const DEVICES: &str = r#"
NI-DAQ: {type: daq, driver: mockup/daq, trigger_source: PFI0}
Laser: {type: scan laser, driver: mockup/laser}
PD: {type: analog daq, model: ni, mode: input, connection: {device: NI-DAQ, port: 0}}
"#;

    const EXPERIMENT: &str = r#"
scan:
  laser:
    name: Laser
    params: {start_wavelength: 1500 nm, stop_wavelength: 1501 nm,
             interval_trigger: 0.5 nm, wavelength_speed: 1 nm/s, wavelength_sweeps: 0}
  detectors: [PD]
  axis: {device: {name: time, range: [1, 1]}}
  shutter: {port: 0, delay: 0 s, device: NI-DAQ}
"#;

    async fn measurement(laser: MockLaser) -> Measurement {
        let mut drivers = DriverRegistry::new();
        drivers.register("mockup/daq", |spec| {
            Ok(Box::new(MockDaq::new(&spec.name)) as Box<dyn Driver>)
        });
        drivers.register("mockup/laser", move |_| {
            Ok(Box::new(laser.clone()) as Box<dyn Driver>)
        });

        let mut measurement = Measurement::new(ExperimentConfig::from_yaml_str(EXPERIMENT).unwrap());
        let doc = serde_yaml::from_str(DEVICES).unwrap();
        for spec in parse_devices(doc, Path::new("")).unwrap() {
            measurement.devices_mut().insert(spec).unwrap();
        }
        measurement.initialize_devices(&drivers).await.unwrap();
        measurement.connect_all_devices_to_daq().unwrap();
        measurement
    }

    #[tokio::test]
    #[traced_test]
    async fn test_laser_failure_during_setup_is_logged() {
        let laser = MockLaser::new();
        laser.reject_key("wavelength_speed").await;
        let mut measurement = measurement(laser.clone()).await;

        let plan = measurement.setup_scan().await.unwrap();
        assert!(logs_contain("Problem changing values of the laser"));
        // sized from the requested values, but nothing recorded as applied
        assert_eq!(plan.points_per_line, 2);
        assert!(laser.params().await.is_empty());
        assert!(!measurement
            .devices()
            .get("Laser")
            .unwrap()
            .params
            .contains_key("wavelength_speed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweeps_become_one() {
        let laser = MockLaser::with_sweep_polls(1);
        let mut measurement = measurement(laser.clone()).await;

        measurement.setup_scan().await.unwrap();
        assert_eq!(laser.params().await[SWEEPS_KEY], ParameterValue::Int(1));
        assert_eq!(measurement.do_scan().await.unwrap(), 1);
        assert_eq!(laser.polls().await, 2);
    }

    #[tokio::test]
    async fn test_read_without_setup_fails() {
        let mut measurement = measurement(MockLaser::new()).await;
        measurement.connect_monitor_devices_to_daq().unwrap();
        let err = measurement.read_scans().await.unwrap_err();
        assert!(err.to_string().contains("no acquisition set up"));
    }

    #[tokio::test]
    async fn test_attr() {
        let measurement = measurement(MockLaser::new()).await;
        assert!(measurement.attr("scan").is_ok());
        assert!(matches!(
            measurement.attr("init"),
            Err(ExperimentorError::MissingAttribute(_))
        ));
    }
}
