//! Configuration documents: device topology, defaults overlays and experiments.
//!
//! All documents are YAML and parsed with `serde_yaml`:
//!
//! - **devices file**: named devices with type, driver reference, connection
//!   descriptor, attached sensors/actuators and free-form properties
//!   ([`DeviceSpec`]).
//! - **defaults file**: per-device parameter dictionaries applied once the
//!   driver is up ([`load_defaults`]).
//! - **experiment file**: the top-level dictionary of a measurement
//!   ([`ExperimentConfig`]).
//!
//! Application settings (log level, scan timing) are not part of these
//! documents; see [`crate::settings`].

pub mod devices;
pub mod experiment;
pub mod loader;

pub use devices::{ChannelMode, ChannelSpec, ConnectionSpec, DeviceSpec, Limits};
pub use experiment::{
    load_experiment_file, AxisConfig, AxisDevice, ExperimentConfig, InitConfig, LaserSettings,
    MonitorConfig, ScanConfig, ShutterConfig, TIME_AXIS,
};
pub use loader::{
    load_defaults, load_devices_file, load_yaml_dict, merge_values, parse_devices, read_defaults,
};
