//! File loaders for device, defaults and experiment documents.

use super::devices::DeviceSpec;
use crate::core::{conditions_from_yaml, yaml_key, Conditions, ParameterValue};
use crate::error::{AppResult, ExperimentorError};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read a YAML file whose top level must be a mapping.
pub fn load_yaml_dict(path: impl AsRef<Path>) -> AppResult<Mapping> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ExperimentorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_yaml_dict(&raw, path)
}

fn parse_yaml_dict(raw: &str, path: &Path) -> AppResult<Mapping> {
    let value: Value = serde_yaml::from_str(raw).map_err(|e| {
        ExperimentorError::Configuration(format!("parsing yaml {}: {}", path.display(), e))
    })?;
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ExperimentorError::Configuration(format!(
            "{} must contain a mapping at the top level",
            path.display()
        ))),
    }
}

/// Load every device described in a devices file, in document order.
///
/// The mapping key becomes the device name unless the entry overrides it with
/// `name:`. Relative `defaults` paths are resolved against the directory of
/// the devices file.
pub fn load_devices_file(path: impl AsRef<Path>) -> AppResult<Vec<DeviceSpec>> {
    let path = path.as_ref();
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let specs = parse_devices(load_yaml_dict(path)?, &base_dir)?;
    debug!(file = %path.display(), count = specs.len(), "loaded device descriptions");
    Ok(specs)
}

/// Parse a devices mapping that has already been read.
pub fn parse_devices(document: Mapping, base_dir: &Path) -> AppResult<Vec<DeviceSpec>> {
    let mut specs = Vec::with_capacity(document.len());
    let mut names = HashSet::new();

    for (key, value) in document {
        let key = yaml_key(&key);
        let mut spec: DeviceSpec = serde_yaml::from_value(value)
            .map_err(|e| ExperimentorError::Configuration(format!("device '{}': {}", key, e)))?;
        if spec.name.is_empty() {
            spec.name = key;
        }
        if let Some(defaults) = spec.defaults.take() {
            spec.defaults = Some(resolve(base_dir, defaults));
        }
        spec.validate()?;
        if !names.insert(spec.name.clone()) {
            return Err(ExperimentorError::Configuration(format!(
                "duplicate device name '{}'",
                spec.name
            )));
        }
        specs.push(spec);
    }
    Ok(specs)
}

/// The defaults overlay for one device: the entry keyed by its name.
pub fn load_defaults(path: impl AsRef<Path>, device: &str) -> AppResult<Conditions> {
    let path = path.as_ref();
    defaults_entry(load_yaml_dict(path)?, path, device)
}

/// [`load_defaults`] reading the file through `tokio::fs`, for use on the async path.
pub async fn read_defaults(path: impl AsRef<Path>, device: &str) -> AppResult<Conditions> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ExperimentorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    defaults_entry(parse_yaml_dict(&raw, path)?, path, device)
}

fn defaults_entry(mut document: Mapping, path: &Path, device: &str) -> AppResult<Conditions> {
    let entry = document.remove(device).ok_or_else(|| {
        ExperimentorError::Configuration(format!(
            "{} has no defaults for device '{}'",
            path.display(),
            device
        ))
    })?;
    conditions_from_yaml(entry)
}

/// Deep-merge `overlay` into `base`. Overlay values win; nested mappings merge key by key.
pub fn merge_values(base: &mut Conditions, overlay: &Conditions) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(ParameterValue::Object(existing)), ParameterValue::Object(incoming)) => {
                merge_values(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

pub(crate) fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() || base_dir.as_os_str().is_empty() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_devices_keep_document_order_and_resolve_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "devices.yml",
            r#"
Santec:
  type: scan laser
  driver: mockup/laser
  defaults: defaults.yml
NI-DAQ:
  type: daq
  driver: mockup/daq
Renamed:
  name: Photodiode
  type: analog daq
  mode: input
  connection: {device: NI-DAQ, port: 0}
"#,
        );

        let specs = load_devices_file(&path).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Santec", "NI-DAQ", "Photodiode"]);
        assert_eq!(
            specs[0].defaults.as_deref(),
            Some(dir.path().join("defaults.yml").as_path())
        );
    }

    #[test]
    fn test_name_override_collision_is_an_error() {
        let mut doc = Mapping::new();
        doc.insert("A".into(), serde_yaml::from_str("{type: daq}").unwrap());
        doc.insert("B".into(), serde_yaml::from_str("{type: daq, name: A}").unwrap());
        let err = parse_devices(doc, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("duplicate device name 'A'"));
    }

    #[test]
    fn test_missing_type_names_the_device() {
        let mut doc = Mapping::new();
        doc.insert("Laser".into(), serde_yaml::from_str("{driver: x}").unwrap());
        let err = parse_devices(doc, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("device 'Laser'"));
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "list.yml", "- a\n- b\n");
        let err = load_yaml_dict(&path).unwrap_err();
        assert!(err.to_string().contains("mapping at the top level"));
    }

    #[test]
    fn test_load_defaults_selects_device_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "defaults.yml",
            "Santec:\n  power: 5 mW\nOther:\n  power: 1 mW\n",
        );
        let defaults = load_defaults(&path, "Santec").unwrap();
        assert_eq!(defaults["power"], ParameterValue::from("5 mW"));
        assert!(load_defaults(&path, "Missing").is_err());
    }

    #[tokio::test]
    async fn test_read_defaults_matches_blocking_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "defaults.yml", "Santec:\n  power: 5 mW\n");
        assert_eq!(
            read_defaults(&path, "Santec").await.unwrap(),
            load_defaults(&path, "Santec").unwrap()
        );
        assert!(matches!(
            read_defaults(dir.path().join("missing.yml"), "Santec").await,
            Err(ExperimentorError::Io { .. })
        ));
    }

    #[test]
    fn test_unreadable_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yml");
        let err = load_yaml_dict(&missing).unwrap_err();
        match &err {
            ExperimentorError::Io { path, .. } => assert_eq!(path, &missing),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("missing.yml"));
    }

    #[test]
    fn test_merge_values_is_deep() {
        let mut base: Conditions = conditions_from_yaml(
            serde_yaml::from_str("{speed: 10 nm/s, trigger: {mode: step, interval: 1 nm}}")
                .unwrap(),
        )
        .unwrap();
        let overlay = conditions_from_yaml(
            serde_yaml::from_str("{trigger: {interval: 0.1 nm}, sweeps: 2}").unwrap(),
        )
        .unwrap();

        merge_values(&mut base, &overlay);
        let trigger = base["trigger"].as_object().unwrap();
        assert_eq!(trigger["mode"], ParameterValue::from("step"));
        assert_eq!(trigger["interval"], ParameterValue::from("0.1 nm"));
        assert_eq!(base["sweeps"], ParameterValue::Int(2));
        assert_eq!(base["speed"], ParameterValue::from("10 nm/s"));
    }
}
