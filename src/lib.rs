//! Core library for experimentor.
//!
//! A laboratory experiment is described in YAML: a devices file lists the
//! instruments (type, driver, connection, attached sensors and actuators),
//! per-device defaults files hold the settings applied at start-up, and an
//! experiment file describes what to do with them. This library loads those
//! documents into a device registry and runs the measurement workflow on top
//! of it, dispatching parameter dictionaries to the drivers.
//!
//! - [`config`]: YAML documents and their loaders
//! - [`registry`]: devices, their drivers and the per-DAQ routes
//! - [`driver`]: driver traits, the driver factory and simulated drivers
//! - [`experiment`]: the [`Measurement`] workflow
//! - [`units`]: physical quantities and linear calibrations
//! - [`settings`] / [`logging`]: application settings and tracing setup

pub mod config;
pub mod core;
pub mod driver;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod registry;
pub mod settings;
pub mod units;

pub use crate::core::{Conditions, ParameterValue};
pub use driver::{Driver, DriverRegistry};
pub use error::{AppResult, ExperimentorError};
pub use experiment::{Measurement, ScanData, ScanPlan};
pub use registry::{Device, DeviceRegistry};
pub use settings::Settings;
pub use units::Quantity;
