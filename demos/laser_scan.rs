//! Laser scan against a piezo axis, on simulated hardware.
//!
//! Run with:
//!
//! ```text
//! cargo run --example laser_scan
//! RUST_LOG=experimentor=debug cargo run --example laser_scan
//! ```

use anyhow::Result;
use experimentor::config::ExperimentConfig;
use experimentor::logging::init_tracing;
use experimentor::{DriverRegistry, Measurement, Settings};
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join("config");
    let settings = Settings::load_from(dir.join("experimentor.toml"))?;
    init_tracing(&settings)?;

    let config = ExperimentConfig::load(dir.join("measurement.yml"))?;
    let mut measurement = Measurement::with_settings(config, &settings);

    measurement.load_devices()?;
    measurement
        .initialize_devices(&DriverRegistry::with_mockups())
        .await?;
    measurement.connect_all_devices_to_daq()?;
    measurement.sync_shutter().await?;

    let plan = measurement.setup_scan().await?;
    info!(
        lines = plan.axis.as_ref().map_or(0, |a| a.len()),
        points = plan.total_points,
        approx_time_per_line = %plan.approx_time_to_scan,
        "starting scan"
    );

    let outcome = async {
        measurement.do_scan().await?;
        measurement.read_scans().await
    }
    .await;

    let data = match outcome {
        Ok(data) => data,
        Err(e) => {
            measurement.stop_scan().await?;
            measurement.finalize().await?;
            return Err(e.into());
        }
    };

    for trace in &data.traces {
        let peak = trace.data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        println!(
            "{:<14} {:>5} samples on {}, peak {:.3}",
            trace.device,
            trace.data.len(),
            trace.daq,
            peak
        );
    }

    measurement.finalize().await?;
    Ok(())
}
