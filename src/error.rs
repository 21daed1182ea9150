//! Custom error types for the library.
//!
//! `ExperimentorError` is the single error type returned by the loaders, the
//! device registry and the measurement workflow. It is built with `thiserror`.
//!
//! ## Error Hierarchy
//!
//! - **`Io`** / **`Yaml`** / **`Settings`**: wrapped errors from reading files,
//!   parsing YAML documents and extracting the figment settings.
//! - **`Configuration`**: a document parsed fine but is semantically wrong
//!   (a channel connected to a DAQ without a `mode`, a duplicate name, ...).
//! - **`UnknownDevice`**, **`UnknownChannel`**, **`UnknownDriver`**: name lookups
//!   that failed.
//! - **`MissingAttribute`** / **`MissingParameter`**: the experiment dictionary or a
//!   device's parameters lack a key the workflow needs.
//! - **`Driver`**: a driver call failed. Drivers report through `anyhow`, and the
//!   failure is wrapped together with the device name.
//! - **`Units`**: a value could not be parsed or converted as a physical quantity.
//! - **`ShortRead`**: a DAQ returned fewer samples than its monitored channels need.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, ExperimentorError>;

#[derive(Error, Debug)]
pub enum ExperimentorError {
    #[error("I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{device}' has no channel named '{channel}'")]
    UnknownChannel { device: String, channel: String },

    #[error("No driver registered for reference '{0}'")]
    UnknownDriver(String),

    #[error("Device '{0}' has no initialized driver")]
    DriverNotInitialized(String),

    #[error("Device '{device}' does not support {capability}")]
    CapabilityNotSupported {
        device: String,
        capability: &'static str,
    },

    #[error("Experiment has no '{0}' attribute")]
    MissingAttribute(String),

    #[error("Missing parameter '{parameter}' for '{owner}'")]
    MissingParameter { owner: String, parameter: String },

    #[error("Units error: {0}")]
    Units(String),

    #[error("Value {value} for '{channel}' is outside its limits")]
    OutOfLimits { channel: String, value: String },

    #[error("DAQ '{daq}' returned {got} samples, expected {expected}")]
    ShortRead {
        daq: String,
        expected: usize,
        got: usize,
    },

    #[error("Driver error on '{device}': {source}")]
    Driver {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<ExperimentorError>),
}

impl From<figment::Error> for ExperimentorError {
    fn from(err: figment::Error) -> Self {
        ExperimentorError::Settings(Box::new(err))
    }
}

impl ExperimentorError {
    /// Wrap a driver failure with the name of the device that raised it.
    pub fn driver(device: impl Into<String>, source: anyhow::Error) -> Self {
        ExperimentorError::Driver {
            device: device.into(),
            source,
        }
    }

    pub(crate) fn missing(owner: impl Into<String>, parameter: impl Into<String>) -> Self {
        ExperimentorError::MissingParameter {
            owner: owner.into(),
            parameter: parameter.into(),
        }
    }
}
