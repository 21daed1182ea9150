//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; binaries and demos call
//! [`init_tracing`] once at startup. `RUST_LOG` takes precedence over the
//! configured level.

use crate::error::{AppResult, ExperimentorError};
use crate::settings::Settings;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG` or `settings.application.log_level`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(settings: &Settings) -> AppResult<()> {
    let filter = env_filter(&settings.application.log_level);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if settings.application.json_logs {
        builder.json().try_init()
    } else {
        builder.with_target(true).try_init()
    };

    result.map_err(|e| {
        ExperimentorError::Configuration(format!("failed to install tracing subscriber: {}", e))
    })
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_configured_level_used_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter("debug");
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        std::env::set_var("RUST_LOG", "experimentor=trace");
        let filter = env_filter("warn");
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "experimentor=trace");
    }
}
