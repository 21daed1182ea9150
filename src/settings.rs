//! Application settings using Figment.
//!
//! Settings are merged from (lowest to highest precedence):
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `EXPERIMENTOR_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! EXPERIMENTOR_APPLICATION__LOG_LEVEL=debug
//! EXPERIMENTOR_SCAN__MONITOR_READ_SCAN=20
//! EXPERIMENTOR_SCAN__SHUTTER_DAQ="NI-DAQ 2"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use experimentor::settings::Settings;
//!
//! let settings = Settings::load_from("config/experimentor.toml")?;
//! println!("Log level: {}", settings.application.log_level);
//! # Ok::<(), experimentor::error::ExperimentorError>(())
//! ```

use crate::error::{AppResult, ExperimentorError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "EXPERIMENTOR_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub scan: ScanSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,
}

/// Timing knobs of the measurement workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// How many times per sweep the laser's state is polled.
    pub monitor_read_scan: u32,
    /// Wait after commanding the scanned device, before polling it.
    pub settle_delay_ms: u64,
    /// Interval between `finished_moving` polls.
    pub settle_poll_ms: u64,
    /// Pause between shutter toggles in `sync_shutter`.
    pub shutter_sync_ms: u64,
    /// DAQ card owning the shutter line when the scan does not name one.
    pub shutter_daq: String,
    /// Fraction of the trigger interval used as DAQ accuracy in continuous mode.
    pub continuous_accuracy_factor: f64,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "experimentor".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            monitor_read_scan: 10,
            settle_delay_ms: 100,
            settle_poll_ms: 200,
            shutter_sync_ms: 200,
            shutter_daq: "NI-DAQ".to_string(),
            continuous_accuracy_factor: 0.85,
        }
    }
}

impl ScanSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }

    pub fn shutter_sync(&self) -> Duration {
        Duration::from_millis(self.shutter_sync_ms)
    }
}

impl Settings {
    /// Defaults overridden by `EXPERIMENTOR_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then the TOML file at `path`, then environment variables.
    ///
    /// A missing file is not an error; Figment treats it as empty.
    pub fn load_from(path: impl AsRef<Path>) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ExperimentorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.monitor_read_scan == 0 {
            return Err(ExperimentorError::Configuration(
                "scan.monitor_read_scan must be > 0".to_string(),
            ));
        }

        let factor = self.scan.continuous_accuracy_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(ExperimentorError::Configuration(format!(
                "scan.continuous_accuracy_factor {} must be in (0, 1]",
                factor
            )));
        }

        if self.scan.shutter_daq.trim().is_empty() {
            return Err(ExperimentorError::Configuration(
                "scan.shutter_daq cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scan.shutter_daq, "NI-DAQ");
        assert_eq!(settings.scan.settle_poll(), Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let result = settings.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_monitor_read_scan_is_rejected() {
        let mut settings = Settings::default();
        settings.scan.monitor_read_scan = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[application]\nname = \"Pharos\"\nlog_level = \"debug\"\n\n[scan]\nmonitor_read_scan = 25"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "Pharos");
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.scan.monitor_read_scan, 25);
        // untouched keys keep their defaults
        assert_eq!(settings.scan.shutter_sync_ms, 200);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        std::env::set_var("EXPERIMENTOR_SCAN__SHUTTER_DAQ", "Dev2");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("EXPERIMENTOR_SCAN__SHUTTER_DAQ");

        assert_eq!(settings.unwrap().scan.shutter_daq, "Dev2");
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value_fails_validation() {
        std::env::set_var("EXPERIMENTOR_APPLICATION__LOG_LEVEL", "loud");
        let result = Settings::load();
        std::env::remove_var("EXPERIMENTOR_APPLICATION__LOG_LEVEL");

        assert!(result.is_err());
    }
}
