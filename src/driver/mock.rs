//! Simulated drivers.
//!
//! Stand-ins for real instruments, usable in tests and demos without any
//! hardware attached. Every mock is `Clone`; clones share state, so a test
//! can keep one copy for inspection and hand another to the registry:
//!
//! ```rust,ignore
//! let daq = MockDaq::new("NI-DAQ");
//! let probe = daq.clone();
//! drivers.register("mockup/daq", move |_| Ok(Box::new(daq.clone()) as Box<dyn Driver>));
//! // ... run the measurement ...
//! assert_eq!(probe.digital_log().await.len(), 3);
//! ```
//!
//! # Available Mocks
//!
//! - `MockDaq` - acquisition card returning a Gaussian trace per channel
//! - `MockLaser` - swept laser that stops after a fixed number of polls
//! - `MockStage` - positioner that moves instantly
//! - `MockGeneric` - accepts and records anything

use super::{
    AnalogInputConditions, AnalogOutput, AnalogReading, Daq, Driver, Positioner, SweepCondition,
    SweptLaser, TaskId,
};
use crate::config::devices::ChannelSpec;
use crate::core::Conditions;
use crate::units::Quantity;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Condition polls a `MockLaser` sweep lasts unless configured otherwise.
pub const DEFAULT_SWEEP_POLLS: u32 = 3;

/// `exp(-x²)` sampled at `points` values of `linspace(-10, 10, points)`.
pub fn gaussian_trace(points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![(-100.0f64).exp()],
        n => {
            let step = 20.0 / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    let x = -10.0 + step * i as f64;
                    (-x * x).exp()
                })
                .collect()
        }
    }
}

/// Volts for `value` on `channel`: through its calibration, or read directly in V.
fn channel_volts(channel: &ChannelSpec, value: &Quantity) -> Result<f64> {
    match &channel.calibration {
        Some(calibration) => Ok(calibration.to_volts(value)?),
        None => Ok(value.m_as("V")?),
    }
}

// =============================================================================
// MockDaq
// =============================================================================

/// One acquisition task held by a `MockDaq`.
#[derive(Clone, Debug)]
pub struct MockTask {
    pub conditions: AnalogInputConditions,
    pub triggered: u32,
    pub stopped: bool,
    pub cleared: bool,
}

#[derive(Debug)]
struct DaqState {
    next_task: u32,
    tasks: HashMap<TaskId, MockTask>,
    task_complete: bool,
    digital: Vec<(String, bool)>,
    analog: Vec<AnalogOutput>,
    applied: Vec<Conditions>,
    resets: u32,
    initialized: bool,
    finalized: bool,
}

/// Simulated DAQ card.
#[derive(Clone, Debug)]
pub struct MockDaq {
    name: String,
    state: Arc<Mutex<DaqState>>,
}

impl MockDaq {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(DaqState {
                next_task: 1,
                tasks: HashMap::new(),
                task_complete: true,
                digital: Vec::new(),
                analog: Vec::new(),
                applied: Vec::new(),
                resets: 0,
                initialized: false,
                finalized: false,
            })),
        }
    }

    /// Make `is_task_complete` report `complete` from now on.
    pub async fn set_task_complete(&self, complete: bool) {
        self.state.lock().await.task_complete = complete;
    }

    pub async fn task(&self, task: TaskId) -> Option<MockTask> {
        self.state.lock().await.tasks.get(&task).cloned()
    }

    /// Every digital write, oldest first.
    pub async fn digital_log(&self) -> Vec<(String, bool)> {
        self.state.lock().await.digital.clone()
    }

    /// Every analog DC write, oldest first.
    pub async fn analog_log(&self) -> Vec<AnalogOutput> {
        self.state.lock().await.analog.clone()
    }

    pub async fn applied(&self) -> Vec<Conditions> {
        self.state.lock().await.applied.clone()
    }

    pub async fn is_finalized(&self) -> bool {
        self.state.lock().await.finalized
    }
}

#[async_trait]
impl Driver for MockDaq {
    async fn initialize(&self) -> Result<()> {
        debug!(daq = %self.name, "mock DAQ initialized");
        self.state.lock().await.initialized = true;
        Ok(())
    }

    async fn apply_values(&self, values: &Conditions) -> Result<()> {
        self.state.lock().await.applied.push(values.clone());
        Ok(())
    }

    async fn read_value(&self, _sensor: &ChannelSpec) -> Result<Quantity> {
        Ok(Quantity::new(0.0, "V")?)
    }

    async fn apply_value(&self, actuator: &ChannelSpec, value: Quantity) -> Result<()> {
        let volts = channel_volts(actuator, &value)?;
        self.analog_output_dc(&AnalogOutput {
            channel: actuator.clone(),
            volts,
        })
        .await
    }

    async fn finalize(&self) -> Result<()> {
        self.state.lock().await.finalized = true;
        Ok(())
    }

    fn as_daq(&self) -> Option<&dyn Daq> {
        Some(self)
    }
}

#[async_trait]
impl Daq for MockDaq {
    async fn analog_input_setup(&self, conditions: &AnalogInputConditions) -> Result<TaskId> {
        let mut state = self.state.lock().await;
        let task = TaskId(state.next_task);
        state.next_task += 1;
        state.tasks.insert(
            task,
            MockTask {
                conditions: conditions.clone(),
                triggered: 0,
                stopped: false,
                cleared: false,
            },
        );
        debug!(daq = %self.name, %task, points = conditions.points, "mock analog input set up");
        Ok(task)
    }

    async fn trigger_analog(&self, task: TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&task)
            .ok_or_else(|| anyhow!("{} does not exist on {}", task, self.name))?;
        entry.triggered += 1;
        Ok(())
    }

    async fn read_analog(&self, task: TaskId, points: Option<usize>) -> Result<AnalogReading> {
        let state = self.state.lock().await;
        let entry = state
            .tasks
            .get(&task)
            .ok_or_else(|| anyhow!("{} does not exist on {}", task, self.name))?;
        if entry.cleared {
            return Err(anyhow!("{} on {} was cleared", task, self.name));
        }
        let points = points.unwrap_or(entry.conditions.points);
        let trace = gaussian_trace(points);
        let channels = entry.conditions.devices.len().max(1);
        let mut data = Vec::with_capacity(points * channels);
        for _ in 0..channels {
            data.extend_from_slice(&trace);
        }
        Ok(AnalogReading { points, data })
    }

    async fn analog_output_dc(&self, output: &AnalogOutput) -> Result<()> {
        debug!(daq = %self.name, channel = %output.channel.name, volts = output.volts, "mock analog output");
        self.state.lock().await.analog.push(output.clone());
        Ok(())
    }

    async fn digital_output(&self, port: &str, level: bool) -> Result<()> {
        self.state.lock().await.digital.push((port.to_string(), level));
        Ok(())
    }

    async fn is_task_complete(&self, task: TaskId) -> Result<bool> {
        let state = self.state.lock().await;
        if !state.tasks.contains_key(&task) {
            return Err(anyhow!("{} does not exist on {}", task, self.name));
        }
        Ok(state.task_complete)
    }

    async fn stop_task(&self, task: TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(&task) {
            entry.stopped = true;
        }
        Ok(())
    }

    async fn clear_task(&self, task: TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(&task) {
            entry.cleared = true;
        }
        Ok(())
    }

    async fn reset_device(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.resets += 1;
        state.tasks.clear();
        Ok(())
    }
}

// =============================================================================
// MockLaser
// =============================================================================

/// Calls received by a `MockLaser`, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaserEvent {
    Execute,
    Pause,
    Stop,
}

#[derive(Debug)]
struct LaserState {
    condition: SweepCondition,
    remaining_polls: u32,
    polls: u32,
    events: Vec<LaserEvent>,
    params: Conditions,
    fail_keys: Vec<String>,
    fail_events: Vec<LaserEvent>,
}

impl LaserState {
    fn record(&mut self, event: LaserEvent) -> Result<()> {
        self.events.push(event);
        if self.fail_events.contains(&event) {
            return Err(anyhow!("laser did not acknowledge {:?}", event));
        }
        Ok(())
    }
}

/// Simulated swept laser.
///
/// A sweep reports `Run` for `sweep_polls` calls of `sweep_condition`, then `Stop`.
#[derive(Clone, Debug)]
pub struct MockLaser {
    sweep_polls: u32,
    state: Arc<Mutex<LaserState>>,
}

impl Default for MockLaser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLaser {
    pub fn new() -> Self {
        Self::with_sweep_polls(DEFAULT_SWEEP_POLLS)
    }

    pub fn with_sweep_polls(sweep_polls: u32) -> Self {
        Self {
            sweep_polls,
            state: Arc::new(Mutex::new(LaserState {
                condition: SweepCondition::Stop,
                remaining_polls: 0,
                polls: 0,
                events: Vec::new(),
                params: Conditions::new(),
                fail_keys: Vec::new(),
                fail_events: Vec::new(),
            })),
        }
    }

    /// Make `apply_values` fail whenever it receives `key`.
    pub async fn reject_key(&self, key: impl Into<String>) {
        self.state.lock().await.fail_keys.push(key.into());
    }

    /// Make the sweep command behind `event` fail. The call is still recorded.
    pub async fn fail_on(&self, event: LaserEvent) {
        self.state.lock().await.fail_events.push(event);
    }

    pub async fn events(&self) -> Vec<LaserEvent> {
        self.state.lock().await.events.clone()
    }

    /// Number of `sweep_condition` calls so far.
    pub async fn polls(&self) -> u32 {
        self.state.lock().await.polls
    }

    /// Parameters accepted so far, merged.
    pub async fn params(&self) -> Conditions {
        self.state.lock().await.params.clone()
    }
}

#[async_trait]
impl Driver for MockLaser {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_values(&self, values: &Conditions) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(key) = state.fail_keys.iter().find(|k| values.contains_key(*k)) {
            return Err(anyhow!("laser rejected parameter '{}'", key));
        }
        for (key, value) in values {
            state.params.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn read_value(&self, sensor: &ChannelSpec) -> Result<Quantity> {
        let state = self.state.lock().await;
        let value = state
            .params
            .get(&sensor.name)
            .ok_or_else(|| anyhow!("laser has no value for '{}'", sensor.name))?;
        Ok(value.as_quantity()?)
    }

    async fn apply_value(&self, actuator: &ChannelSpec, value: Quantity) -> Result<()> {
        self.state
            .lock()
            .await
            .params
            .insert(actuator.name.clone(), value.into());
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.condition = SweepCondition::Stop;
        Ok(())
    }

    fn as_laser(&self) -> Option<&dyn SweptLaser> {
        Some(self)
    }
}

#[async_trait]
impl SweptLaser for MockLaser {
    async fn execute_sweep(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(LaserEvent::Execute)?;
        state.condition = SweepCondition::Run;
        state.remaining_polls = self.sweep_polls;
        Ok(())
    }

    async fn pause_sweep(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(LaserEvent::Pause)?;
        if state.condition == SweepCondition::Run {
            state.condition = SweepCondition::Pause;
        }
        Ok(())
    }

    async fn stop_sweep(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(LaserEvent::Stop)?;
        state.condition = SweepCondition::Stop;
        Ok(())
    }

    async fn sweep_condition(&self) -> Result<SweepCondition> {
        let mut state = self.state.lock().await;
        state.polls += 1;
        if state.condition == SweepCondition::Run {
            if state.remaining_polls == 0 {
                state.condition = SweepCondition::Stop;
            } else {
                state.remaining_polls -= 1;
            }
        }
        Ok(state.condition)
    }
}

// =============================================================================
// MockStage
// =============================================================================

#[derive(Debug, Default)]
struct StageState {
    position: Option<Quantity>,
    moves: Vec<Quantity>,
    settle_polls: u32,
}

/// Simulated positioner. Moves are instantaneous.
#[derive(Clone, Debug, Default)]
pub struct MockStage {
    state: Arc<Mutex<StageState>>,
}

impl MockStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn position(&self) -> Option<Quantity> {
        self.state.lock().await.position.clone()
    }

    /// Every commanded position, oldest first.
    pub async fn moves(&self) -> Vec<Quantity> {
        self.state.lock().await.moves.clone()
    }

    /// Number of `finished_moving` calls so far.
    pub async fn settle_polls(&self) -> u32 {
        self.state.lock().await.settle_polls
    }

    async fn move_to(&self, target: Quantity) {
        let mut state = self.state.lock().await;
        state.moves.push(target.clone());
        state.position = Some(target);
    }
}

#[async_trait]
impl Driver for MockStage {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_values(&self, values: &Conditions) -> Result<()> {
        if let Some(target) = values.get("position") {
            self.move_to(target.as_quantity()?).await;
        }
        Ok(())
    }

    async fn read_value(&self, _sensor: &ChannelSpec) -> Result<Quantity> {
        self.position()
            .await
            .ok_or_else(|| anyhow!("stage has not been moved yet"))
    }

    async fn apply_value(&self, _actuator: &ChannelSpec, value: Quantity) -> Result<()> {
        self.move_to(value).await;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }

    fn as_positioner(&self) -> Option<&dyn Positioner> {
        Some(self)
    }
}

#[async_trait]
impl Positioner for MockStage {
    async fn finished_moving(&self) -> Result<bool> {
        self.state.lock().await.settle_polls += 1;
        Ok(true)
    }
}

// =============================================================================
// MockGeneric
// =============================================================================

#[derive(Debug, Default)]
struct GenericState {
    applied: Vec<Conditions>,
    channels: HashMap<String, Quantity>,
    finalized: bool,
}

/// Accepts any value and records it.
#[derive(Clone, Debug, Default)]
pub struct MockGeneric {
    state: Arc<Mutex<GenericState>>,
}

impl MockGeneric {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied(&self) -> Vec<Conditions> {
        self.state.lock().await.applied.clone()
    }

    pub async fn is_finalized(&self) -> bool {
        self.state.lock().await.finalized
    }
}

#[async_trait]
impl Driver for MockGeneric {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_values(&self, values: &Conditions) -> Result<()> {
        self.state.lock().await.applied.push(values.clone());
        Ok(())
    }

    /// The last value applied to the channel, or zero in its units.
    async fn read_value(&self, sensor: &ChannelSpec) -> Result<Quantity> {
        if let Some(value) = self.state.lock().await.channels.get(&sensor.name) {
            return Ok(value.clone());
        }
        match sensor.units.as_deref() {
            Some(units) => Ok(Quantity::new(0.0, units)?),
            None => Ok(Quantity::dimensionless(0.0)),
        }
    }

    async fn apply_value(&self, actuator: &ChannelSpec, value: Quantity) -> Result<()> {
        self.state
            .lock()
            .await
            .channels
            .insert(actuator.name.clone(), value);
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.state.lock().await.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Sampling;

    fn conditions(channels: &[&str], points: usize) -> AnalogInputConditions {
        AnalogInputConditions {
            accuracy: Quantity::parse("1 ms").unwrap(),
            points,
            devices: channels
                .iter()
                .map(|name| ChannelSpec {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            trigger: None,
            trigger_source: None,
            sampling: Sampling::Continuous,
        }
    }

    #[test]
    fn test_gaussian_peaks_in_the_middle() {
        let trace = gaussian_trace(201);
        assert_eq!(trace.len(), 201);
        assert!((trace[100] - 1.0).abs() < 1e-12);
        assert!(trace[0] < 1e-40);
    }

    #[tokio::test]
    async fn test_daq_reads_one_block_per_channel() {
        let daq = MockDaq::new("NI-DAQ");
        let task = daq
            .analog_input_setup(&conditions(&["PD1", "PD2"], 5))
            .await
            .unwrap();
        assert_eq!(task, TaskId(1));

        let reading = daq.read_analog(task, None).await.unwrap();
        assert_eq!(reading.points, 5);
        assert_eq!(reading.data.len(), 10);
        assert_eq!(reading.data[..5], reading.data[5..]);
    }

    #[tokio::test]
    async fn test_daq_task_ids_increase() {
        let daq = MockDaq::new("NI-DAQ");
        let first = daq.analog_input_setup(&conditions(&["A"], 1)).await.unwrap();
        let second = daq.analog_input_setup(&conditions(&["A"], 1)).await.unwrap();
        assert!(second.0 > first.0);
        assert!(daq.read_analog(TaskId(99), None).await.is_err());
    }

    #[tokio::test]
    async fn test_daq_apply_value_uses_calibration() {
        let daq = MockDaq::new("NI-DAQ");
        let channel = ChannelSpec {
            name: "Piezo".to_string(),
            calibration: Some(crate::units::Calibration {
                units: "um".to_string(),
                slope: 10.0,
                offset: 0.0,
            }),
            ..Default::default()
        };
        daq.apply_value(&channel, Quantity::parse("25 um").unwrap())
            .await
            .unwrap();
        let log = daq.analog_log().await;
        assert!((log[0].volts - 2.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_laser_sweep_stops_after_polls() {
        let laser = MockLaser::with_sweep_polls(2);
        laser.execute_sweep().await.unwrap();
        assert_eq!(laser.sweep_condition().await.unwrap(), SweepCondition::Run);
        assert_eq!(laser.sweep_condition().await.unwrap(), SweepCondition::Run);
        assert_eq!(laser.sweep_condition().await.unwrap(), SweepCondition::Stop);
        assert_eq!(laser.polls().await, 3);
    }

    #[tokio::test]
    async fn test_laser_pause_then_resume() {
        let laser = MockLaser::with_sweep_polls(5);
        laser.execute_sweep().await.unwrap();
        laser.pause_sweep().await.unwrap();
        assert_eq!(laser.sweep_condition().await.unwrap(), SweepCondition::Pause);
        laser.execute_sweep().await.unwrap();
        assert_eq!(laser.sweep_condition().await.unwrap(), SweepCondition::Run);
        assert_eq!(
            laser.events().await,
            [LaserEvent::Execute, LaserEvent::Pause, LaserEvent::Execute]
        );
    }

    #[tokio::test]
    async fn test_stage_records_moves() {
        let stage = MockStage::new();
        let mut values = Conditions::new();
        values.insert("position".to_string(), "3 um".into());
        stage.apply_values(&values).await.unwrap();
        assert_eq!(stage.position().await.unwrap().to_string(), "3 um");
        assert!(stage.finished_moving().await.unwrap());
    }
}
