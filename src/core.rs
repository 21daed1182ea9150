//! Core value types shared by the loaders, the registry and the drivers.
//!
//! Drivers are configured with *conditions*: ad hoc key/value bags whose
//! accepted keys vary per vendor and device type. Values come straight out of
//! YAML documents, so [`ParameterValue`] mirrors the YAML data model and offers
//! lenient accessors (`"5"` reads as an integer, `"10 nm"` as a quantity).
//!
//! # Data Flow
//!
//! ```text
//! devices.yml / defaults.yml / measurement.yml
//!        │ serde_yaml::Value
//!        ▼
//!   ParameterValue ──► Conditions ──► Driver::apply_values
//! ```

use crate::error::{AppResult, ExperimentorError};
use crate::units::Quantity;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key/value bag passed to a driver's setup call.
pub type Conditions = HashMap<String, ParameterValue>;

/// Loosely-typed parameter value, as written in a configuration document.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
    Array(Vec<ParameterValue>),
    Object(HashMap<String, ParameterValue>),
    Null,
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::FloatArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::IntArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::Array(arr) => write!(f, "{:?}", arr),
            ParameterValue::Object(obj) => write!(f, "{:?}", obj),
            ParameterValue::Null => write!(f, "null"),
        }
    }
}

impl ParameterValue {
    /// Extract value as a string, parsing from various types
    pub fn as_string(&self) -> Option<String> {
        match self {
            ParameterValue::String(s) => Some(s.clone()),
            ParameterValue::Bool(b) => Some(b.to_string()),
            ParameterValue::Int(i) => Some(i.to_string()),
            ParameterValue::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }

    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) => Some(*f as i64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a physical quantity. Numbers are dimensionless.
    pub fn as_quantity(&self) -> AppResult<Quantity> {
        match self {
            ParameterValue::Int(i) => Ok(Quantity::dimensionless(*i as f64)),
            ParameterValue::Float(f) => Ok(Quantity::dimensionless(*f)),
            ParameterValue::String(s) => Quantity::parse(s),
            other => Err(ExperimentorError::Units(format!(
                "'{}' is not a quantity",
                other
            ))),
        }
    }

    /// Borrow the nested mapping, if this value is one.
    pub fn as_object(&self) -> Option<&HashMap<String, ParameterValue>> {
        match self {
            ParameterValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParameterValue::Null)
    }
}

impl From<serde_yaml::Value> for ParameterValue {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;

        match value {
            Value::Null => ParameterValue::Null,
            Value::Bool(b) => ParameterValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParameterValue::Int(i),
                None => ParameterValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ParameterValue::String(s),
            Value::Sequence(items) => sequence_value(items),
            Value::Mapping(map) => ParameterValue::Object(
                map.into_iter()
                    .map(|(k, v)| (yaml_key(&k), ParameterValue::from(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => ParameterValue::from(tagged.value),
        }
    }
}

impl<'de> Deserialize<'de> for ParameterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_yaml::Value::deserialize(deserializer).map(ParameterValue::from)
    }
}

fn sequence_value(items: Vec<serde_yaml::Value>) -> ParameterValue {
    let values: Vec<ParameterValue> = items.into_iter().map(ParameterValue::from).collect();
    if !values.is_empty() && values.iter().all(|v| matches!(v, ParameterValue::Int(_))) {
        return ParameterValue::IntArray(values.iter().filter_map(ParameterValue::as_i64).collect());
    }
    if !values.is_empty()
        && values
            .iter()
            .all(|v| matches!(v, ParameterValue::Int(_) | ParameterValue::Float(_)))
    {
        return ParameterValue::FloatArray(values.iter().filter_map(ParameterValue::as_f64).collect());
    }
    ParameterValue::Array(values)
}

/// Mapping keys are usually strings, but YAML allows numbers and booleans too.
pub(crate) fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Convert a YAML mapping into a conditions dictionary.
pub fn conditions_from_yaml(value: serde_yaml::Value) -> AppResult<Conditions> {
    match ParameterValue::from(value) {
        ParameterValue::Object(map) => Ok(map),
        ParameterValue::Null => Ok(Conditions::new()),
        other => Err(ExperimentorError::Configuration(format!(
            "expected a mapping of parameters, found '{}'",
            other
        ))),
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Int(i64::from(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Quantity> for ParameterValue {
    fn from(value: Quantity) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::FloatArray(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_mapping_becomes_conditions() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
start_wavelength: 1490 nm
wavelength_sweeps: 2
power: 1.5
enabled: true
limits: {min: 0, max: 10}
"#,
        )
        .unwrap();

        let conditions = conditions_from_yaml(yaml).unwrap();
        assert_eq!(conditions["wavelength_sweeps"], ParameterValue::Int(2));
        assert_eq!(conditions["power"], ParameterValue::Float(1.5));
        assert_eq!(conditions["enabled"].as_bool(), Some(true));
        assert_eq!(
            conditions["start_wavelength"].as_quantity().unwrap().m_as("nm").unwrap(),
            1490.0
        );
        let limits = conditions["limits"].as_object().unwrap();
        assert_eq!(limits["max"].as_i64(), Some(10));
    }

    #[test]
    fn test_sequences_pick_the_narrowest_array() {
        let ints: serde_yaml::Value = serde_yaml::from_str("[1, 2, 3]").unwrap();
        assert_eq!(ParameterValue::from(ints), ParameterValue::IntArray(vec![1, 2, 3]));

        let floats: serde_yaml::Value = serde_yaml::from_str("[1, 2.5]").unwrap();
        assert_eq!(ParameterValue::from(floats), ParameterValue::FloatArray(vec![1.0, 2.5]));

        let mixed: serde_yaml::Value = serde_yaml::from_str("[1 mm, 2 mm]").unwrap();
        assert!(matches!(ParameterValue::from(mixed), ParameterValue::Array(_)));
    }

    #[test]
    fn test_non_mapping_is_rejected() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        assert!(conditions_from_yaml(yaml).is_err());
    }

    #[test]
    fn test_lenient_accessors() {
        assert_eq!(ParameterValue::from("42").as_i64(), Some(42));
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert!(ParameterValue::Bool(true).as_quantity().is_err());
        assert_eq!(ParameterValue::from(4u32).to_string(), "4");
    }
}
