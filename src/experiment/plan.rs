//! Scan arithmetic: sweep parameters, axis points and the resulting plan.

use crate::config::experiment::{AxisDevice, TIME_AXIS};
use crate::core::{Conditions, ParameterValue};
use crate::driver::TaskId;
use crate::error::{AppResult, ExperimentorError};
use crate::units::Quantity;
use serde::Serialize;
use std::time::Duration;

/// Laser key holding the number of sweeps per line scan.
pub const SWEEPS_KEY: &str = "wavelength_sweeps";

/// Ratios within this distance of an integer count as that integer.
const COUNT_TOLERANCE: f64 = 1e-9;

/// The laser parameters that shape an acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepParams {
    pub start_wavelength: Quantity,
    pub stop_wavelength: Quantity,
    pub interval_trigger: Quantity,
    pub wavelength_speed: Quantity,
    /// `0` means sweep until stopped.
    pub sweeps: u32,
}

impl SweepParams {
    /// Read the sweep parameters applied to the laser `owner`.
    pub fn from_params(owner: &str, params: &Conditions) -> AppResult<Self> {
        let quantity = |key: &str| -> AppResult<Quantity> {
            params
                .get(key)
                .ok_or_else(|| ExperimentorError::missing(owner, key))?
                .as_quantity()
        };
        let sweeps = match params.get(SWEEPS_KEY) {
            None | Some(ParameterValue::Null) => 1,
            Some(value) => value
                .as_i64()
                .filter(|n| *n >= 0)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    ExperimentorError::Configuration(format!(
                        "'{}' of '{}' must be a non-negative integer, got {}",
                        SWEEPS_KEY, owner, value
                    ))
                })?,
        };
        Ok(Self {
            start_wavelength: quantity("start_wavelength")?,
            stop_wavelength: quantity("stop_wavelength")?,
            interval_trigger: quantity("interval_trigger")?,
            wavelength_speed: quantity("wavelength_speed")?,
            sweeps,
        })
    }

    /// `stop - start`, in the units of `stop`.
    pub fn span(&self) -> AppResult<Quantity> {
        self.stop_wavelength.checked_sub(&self.start_wavelength)
    }

    /// Trigger pulses in one sweep: `floor(span / interval_trigger)`.
    pub fn points_per_sweep(&self) -> AppResult<usize> {
        let ratio = pure_number(
            self.span()?.checked_div(&self.interval_trigger)?,
            "span / interval_trigger",
        )?;
        if ratio < 0.0 {
            return Err(ExperimentorError::Configuration(format!(
                "stop_wavelength {} is below start_wavelength {}",
                self.stop_wavelength, self.start_wavelength
            )));
        }
        Ok((ratio + COUNT_TOLERANCE).floor() as usize)
    }

    /// Time between trigger pulses: `interval_trigger / wavelength_speed`.
    pub fn accuracy(&self) -> AppResult<Quantity> {
        self.interval_trigger
            .checked_div(&self.wavelength_speed)?
            .to("s")
    }

    /// Duration of one sweep: `span / wavelength_speed`.
    pub fn approx_time(&self) -> AppResult<Quantity> {
        self.span()?.checked_div(&self.wavelength_speed)?.to("s")
    }
}

fn pure_number(quantity: Quantity, what: &str) -> AppResult<f64> {
    if !quantity.is_dimensionless() {
        return Err(ExperimentorError::Units(format!(
            "{} should be a pure number, got {}",
            what, quantity
        )));
    }
    Ok(quantity.magnitude())
}

/// `n` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// What changes between consecutive line scans.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisPlan {
    /// Step `device` through `values`, sent under the key `output`.
    Device {
        device: String,
        output: Option<String>,
        values: Vec<Quantity>,
    },
    /// Repeat the line scan in place.
    Time { repeats: usize },
}

impl AxisPlan {
    /// Expand the axis of a scan section.
    ///
    /// A device range is `[start, stop, step]` and yields
    /// `round((stop - start) / step) + 1` values, both ends included. The
    /// time axis takes `[start, count]` and repeats the line scan `count` times.
    pub fn from_config(axis: &AxisDevice) -> AppResult<Self> {
        if axis.name == TIME_AXIS {
            let count = axis.range.get(1).ok_or_else(|| {
                ExperimentorError::Configuration(
                    "time axis range must be [start, count]".to_string(),
                )
            })?;
            let count = pure_number(count.clone(), "time axis count")?;
            if count < 0.0 {
                return Err(ExperimentorError::Configuration(format!(
                    "time axis count {} is negative",
                    count
                )));
            }
            return Ok(AxisPlan::Time {
                repeats: count.round() as usize,
            });
        }

        let [start, stop, step] = axis.range.as_slice() else {
            return Err(ExperimentorError::Configuration(format!(
                "range of '{}' must be [start, stop, step], got {} values",
                axis.name,
                axis.range.len()
            )));
        };
        let units = start.units().to_string();
        let stop = stop.m_as(&units)?;
        let step = step.m_as(&units)?;
        let start = start.magnitude();
        if step == 0.0 {
            return Err(ExperimentorError::Configuration(format!(
                "range of '{}' has a zero step",
                axis.name
            )));
        }
        let steps = (stop - start) / step;
        if steps < -COUNT_TOLERANCE {
            return Err(ExperimentorError::Configuration(format!(
                "step of '{}' points away from stop",
                axis.name
            )));
        }
        let n = steps.round() as usize + 1;
        let values = linspace(start, stop, n)
            .into_iter()
            .map(|v| Quantity::new(v, &units))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(AxisPlan::Device {
            device: axis.name.clone(),
            output: axis.output.clone(),
            values,
        })
    }

    /// Number of line scans.
    pub fn len(&self) -> usize {
        match self {
            AxisPlan::Device { values, .. } => values.len(),
            AxisPlan::Time { repeats } => *repeats,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What `setup_scan` (or `setup_continuous_scans`) prepared.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanPlan {
    /// `None` for continuous monitoring.
    pub axis: Option<AxisPlan>,
    /// Samples per channel acquired during one line scan.
    pub points_per_line: usize,
    /// Samples per channel the DAQ tasks were set up for.
    pub total_points: usize,
    pub accuracy: Quantity,
    pub approx_time_to_scan: Quantity,
    /// Acquisition task per monitored DAQ.
    pub tasks: Vec<(String, TaskId)>,
}

/// A non-negative time quantity as a `Duration`.
pub(crate) fn duration_of(quantity: &Quantity) -> AppResult<Duration> {
    let seconds = quantity.m_as("s")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ExperimentorError::Units(format!(
            "{} is not a valid delay",
            quantity
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}
