//! Loading the fixture documents from disk.

use experimentor::config::{
    load_defaults, load_devices_file, load_experiment_file, load_yaml_dict, ChannelMode,
};
use experimentor::units::Quantity;
use experimentor::ParameterValue;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn test_devices_fixture() {
    let specs = load_devices_file(fixture("devices.yml")).unwrap();
    let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "NI-DAQ",
            "Santec",
            "Photodiode 1",
            "Photodiode 2",
            "Piezo X",
            "Stage",
            "Oscilloscope"
        ]
    );

    let santec = &specs[1];
    assert_eq!(santec.defaults.as_ref(), Some(&fixture("devices_defaults.yml")));
    assert_eq!(santec.connection.kind.as_deref(), Some("GPIB"));

    let piezo = &specs[4];
    assert!(piezo.is_analog_channel());
    assert_eq!(piezo.mode, Some(ChannelMode::Output));
    assert_eq!(piezo.connected_to(), Some("NI-DAQ"));
    assert!(piezo.has_outputs());

    let scope = &specs[6];
    assert_eq!(scope.sensors[0].name, "PD3");
    assert_eq!(scope.actuators[0].name, "Offset");
    assert!(scope.actuators[0].limits.is_some());
}

#[test]
fn test_defaults_fixture() {
    let defaults = load_defaults(fixture("devices_defaults.yml"), "Santec").unwrap();
    let speed = defaults["wavelength_speed"].as_quantity().unwrap();
    assert_eq!(speed, Quantity::parse("10 nm/s").unwrap());
    assert_eq!(defaults["power"], ParameterValue::from("5 mW"));
}

#[test]
fn test_experiment_fixture() {
    let experiment = load_experiment_file(fixture("measurement.yml")).unwrap();
    let keys: Vec<_> = experiment.keys().collect();
    assert_eq!(keys, ["init", "scan", "monitor", "operator"]);
    assert_eq!(experiment.init().unwrap().devices, fixture("devices.yml"));

    let scan = experiment.scan().unwrap();
    assert_eq!(scan.detectors, ["Photodiode 1", "Photodiode 2"]);
    assert_eq!(scan.axis.device.output.as_deref(), Some("position"));
    assert_eq!(scan.shutter.port, "port0/line0");
    assert!(scan.shutter.device.is_none());

    let monitor = experiment.monitor().unwrap();
    assert_eq!(monitor.laser.name, "Santec");
    assert_eq!(monitor.detectors.len(), 1);
}

#[test]
fn test_raw_dictionary() {
    let dict = load_yaml_dict(fixture("measurement.yml")).unwrap();
    assert_eq!(dict.len(), 4);
    assert!(load_yaml_dict(fixture("missing.yml")).is_err());
}
