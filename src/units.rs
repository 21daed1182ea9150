//! Physical quantities for scan parameters.
//!
//! Experiment and device documents express values as strings such as
//! `"1490 nm"`, `"10 nm/s"` or `"0.2 s"`. [`Quantity`] parses those strings,
//! keeps the unit the value was written in, and supports the arithmetic the
//! measurement workflow needs (sweep lengths, trigger accuracy, scan times)
//! with dimension checking.
//!
//! # Supported units
//!
//! Base symbols `m`, `s`, `min`, `h`, `V`, `A`, `W`, `Hz`, `deg`, `rad`, with the
//! SI prefixes `p n u µ m c k M G`. Units combine with `*` and `/` and take
//! integer powers with `^`. Everything after the first `/` divides, so
//! `nm/s/s` is a length per time squared:
//!
//! ```rust
//! use experimentor::units::Quantity;
//!
//! let start = Quantity::parse("1490 nm").unwrap();
//! let stop = Quantity::parse("1.6 um").unwrap();
//! let speed = Quantity::parse("10 nm/s").unwrap();
//!
//! let span = stop.checked_sub(&start).unwrap();
//! let duration = span.checked_div(&speed).unwrap();
//! assert!((duration.m_as("s").unwrap() - 11.0).abs() < 1e-9);
//! ```

use crate::error::{AppResult, ExperimentorError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Mul;

/// Exponents of the base dimensions: length, time, voltage, current, power, angle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Dimension([i8; 6]);

impl Dimension {
    const LENGTH: Dimension = Dimension([1, 0, 0, 0, 0, 0]);
    const TIME: Dimension = Dimension([0, 1, 0, 0, 0, 0]);
    const VOLTAGE: Dimension = Dimension([0, 0, 1, 0, 0, 0]);
    const CURRENT: Dimension = Dimension([0, 0, 0, 1, 0, 0]);
    const POWER: Dimension = Dimension([0, 0, 0, 0, 1, 0]);
    const ANGLE: Dimension = Dimension([0, 0, 0, 0, 0, 1]);
    const FREQUENCY: Dimension = Dimension([0, -1, 0, 0, 0, 0]);

    /// Dimension of a pure number.
    pub const NONE: Dimension = Dimension([0; 6]);

    /// `self * other^sign`, or `None` when an exponent leaves the `i8` range.
    fn combine(self, other: Dimension, sign: i8) -> Option<Dimension> {
        let mut out = self.0;
        for (slot, exp) in out.iter_mut().zip(other.0) {
            *slot = slot.checked_add(sign.checked_mul(exp)?)?;
        }
        Some(Dimension(out))
    }

    fn powi(self, power: i8) -> Option<Dimension> {
        let mut out = self.0;
        for slot in out.iter_mut() {
            *slot = slot.checked_mul(power)?;
        }
        Some(Dimension(out))
    }

    /// True for a pure number.
    pub fn is_none(&self) -> bool {
        *self == Dimension::NONE
    }
}

/// A unit expression: scale to SI, dimension and the symbol it was written as.
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    factor: f64,
    dim: Dimension,
    symbol: String,
}

const BASE_UNITS: &[(&str, f64, Dimension)] = &[
    ("m", 1.0, Dimension::LENGTH),
    ("s", 1.0, Dimension::TIME),
    ("min", 60.0, Dimension::TIME),
    ("h", 3600.0, Dimension::TIME),
    ("V", 1.0, Dimension::VOLTAGE),
    ("A", 1.0, Dimension::CURRENT),
    ("W", 1.0, Dimension::POWER),
    ("Hz", 1.0, Dimension::FREQUENCY),
    ("rad", 1.0, Dimension::ANGLE),
    ("deg", std::f64::consts::PI / 180.0, Dimension::ANGLE),
];

const PREFIXES: &[(&str, f64)] = &[
    ("p", 1e-12),
    ("n", 1e-9),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("m", 1e-3),
    ("c", 1e-2),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
];

impl Unit {
    /// The unit of a pure number.
    pub fn dimensionless() -> Self {
        Self {
            factor: 1.0,
            dim: Dimension::NONE,
            symbol: String::new(),
        }
    }

    /// Parse a unit expression such as `nm`, `nm/s`, `V*s` or `m^2`.
    pub fn parse(expr: &str) -> AppResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "dimensionless" {
            return Ok(Self::dimensionless());
        }

        let mut factor = 1.0;
        let mut dim = Dimension::NONE;
        for (index, group) in expr.split('/').enumerate() {
            let sign = if index == 0 { 1 } else { -1 };
            for term in group.split('*') {
                let (term_factor, term_dim) = parse_term(term.trim(), expr)?;
                factor *= term_factor.powi(i32::from(sign));
                dim = dim.combine(term_dim, sign).ok_or_else(|| exponent_overflow(expr))?;
            }
        }

        Ok(Self {
            factor,
            dim,
            symbol: expr.to_string(),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn dimension(&self) -> Dimension {
        self.dim
    }
}

fn parse_term(term: &str, expr: &str) -> AppResult<(f64, Dimension)> {
    let (symbol, power) = match term.split_once('^') {
        Some((symbol, power)) => {
            let power: i8 = power.trim().parse().map_err(|_| {
                ExperimentorError::Units(format!("invalid power '{}' in unit '{}'", power, expr))
            })?;
            (symbol.trim(), power)
        }
        None => (term, 1),
    };

    let (factor, dim) = lookup_symbol(symbol)
        .ok_or_else(|| ExperimentorError::Units(format!("unknown unit '{}' in '{}'", symbol, expr)))?;
    let dim = dim.powi(power).ok_or_else(|| exponent_overflow(expr))?;
    Ok((factor.powi(i32::from(power)), dim))
}

fn exponent_overflow(expr: &str) -> ExperimentorError {
    ExperimentorError::Units(format!("exponent out of range in unit '{}'", expr))
}

/// Split a unit symbol into numerator and denominator terms, the way
/// [`Unit::parse`] reads it: everything after the first `/` divides.
fn symbol_terms(symbol: &str) -> (Vec<&str>, Vec<&str>) {
    let mut numerator = Vec::new();
    let mut denominator = Vec::new();
    if symbol.is_empty() {
        return (numerator, denominator);
    }
    for (index, group) in symbol.split('/').enumerate() {
        let side = if index == 0 { &mut numerator } else { &mut denominator };
        side.extend(group.split('*').map(str::trim).filter(|t| !t.is_empty() && *t != "1"));
    }
    (numerator, denominator)
}

/// Flat `a*b/c/d` form of a product, with identical terms cancelled.
fn join_symbol(mut numerator: Vec<&str>, mut denominator: Vec<&str>) -> String {
    numerator.retain(|term| match denominator.iter().position(|d| d == term) {
        Some(at) => {
            denominator.remove(at);
            false
        }
        None => true,
    });
    let mut symbol = if numerator.is_empty() {
        "1".to_string()
    } else {
        numerator.join("*")
    };
    for term in denominator {
        symbol.push('/');
        symbol.push_str(term);
    }
    symbol
}

fn lookup_symbol(symbol: &str) -> Option<(f64, Dimension)> {
    if symbol == "1" {
        return Some((1.0, Dimension::NONE));
    }
    if let Some(&(_, factor, dim)) = BASE_UNITS.iter().find(|(s, _, _)| *s == symbol) {
        return Some((factor, dim));
    }
    PREFIXES.iter().find_map(|&(prefix, scale)| {
        let base = symbol.strip_prefix(prefix)?;
        BASE_UNITS
            .iter()
            .find(|(s, _, _)| *s == base)
            .map(|&(_, factor, dim)| (scale * factor, dim))
    })
}

/// A magnitude together with the unit it is expressed in.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantity {
    magnitude: f64,
    unit: Unit,
}

impl Quantity {
    /// Build a quantity from a magnitude and a unit expression.
    pub fn new(magnitude: f64, unit: &str) -> AppResult<Self> {
        Ok(Self {
            magnitude,
            unit: Unit::parse(unit)?,
        })
    }

    /// A pure number.
    pub fn dimensionless(magnitude: f64) -> Self {
        Self {
            magnitude,
            unit: Unit::dimensionless(),
        }
    }

    /// Parse `"<number> <unit>"`; the unit may be omitted or glued to the number.
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.trim();
        let split = number_prefix_len(text);
        if split == 0 {
            return Err(ExperimentorError::Units(format!(
                "'{}' does not start with a number",
                text
            )));
        }
        let (number, unit) = text.split_at(split);
        let magnitude: f64 = number
            .parse()
            .map_err(|_| ExperimentorError::Units(format!("invalid magnitude in '{}'", text)))?;
        Self::new(magnitude, unit)
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn units(&self) -> &str {
        self.unit.symbol()
    }

    pub fn dimension(&self) -> Dimension {
        self.unit.dim
    }

    pub fn is_dimensionless(&self) -> bool {
        self.unit.dim.is_none()
    }

    /// Value expressed in SI base units.
    pub fn si_value(&self) -> f64 {
        self.magnitude * self.unit.factor
    }

    /// Convert to another unit of the same dimension.
    pub fn to(&self, unit: &str) -> AppResult<Quantity> {
        let target = Unit::parse(unit)?;
        if target.dim != self.unit.dim {
            return Err(ExperimentorError::Units(format!(
                "cannot convert '{}' to '{}'",
                self, unit
            )));
        }
        Ok(Quantity {
            magnitude: self.si_value() / target.factor,
            unit: target,
        })
    }

    /// Magnitude after conversion to `unit`.
    pub fn m_as(&self, unit: &str) -> AppResult<f64> {
        self.to(unit).map(|q| q.magnitude)
    }

    /// Sum expressed in the units of `self`.
    pub fn checked_add(&self, other: &Quantity) -> AppResult<Quantity> {
        let other = other.to(self.unit.symbol())?;
        Ok(Quantity {
            magnitude: self.magnitude + other.magnitude,
            unit: self.unit.clone(),
        })
    }

    /// Difference expressed in the units of `self`.
    pub fn checked_sub(&self, other: &Quantity) -> AppResult<Quantity> {
        let other = other.to(self.unit.symbol())?;
        Ok(Quantity {
            magnitude: self.magnitude - other.magnitude,
            unit: self.unit.clone(),
        })
    }

    /// Product with dimension checking of the resulting exponents.
    pub fn checked_mul(&self, other: &Quantity) -> AppResult<Quantity> {
        self.combine(other, 1)
    }

    /// Quotient with dimension checking of the resulting exponents.
    pub fn checked_div(&self, other: &Quantity) -> AppResult<Quantity> {
        self.combine(other, -1)
    }

    fn combine(&self, other: &Quantity, sign: i8) -> AppResult<Quantity> {
        let dim = self.unit.dim.combine(other.unit.dim, sign).ok_or_else(|| {
            ExperimentorError::Units(format!(
                "exponent out of range combining '{}' and '{}'",
                self, other
            ))
        })?;
        let (factor, other_magnitude) = if sign > 0 {
            (self.unit.factor * other.unit.factor, other.magnitude)
        } else {
            (self.unit.factor / other.unit.factor, 1.0 / other.magnitude)
        };
        let magnitude = self.magnitude * other_magnitude;

        if dim.is_none() {
            return Ok(Quantity::dimensionless(magnitude * factor));
        }
        let (mut numerator, mut denominator) = symbol_terms(&self.unit.symbol);
        let (other_num, other_den) = symbol_terms(&other.unit.symbol);
        if sign > 0 {
            numerator.extend(other_num);
            denominator.extend(other_den);
        } else {
            numerator.extend(other_den);
            denominator.extend(other_num);
        }
        Ok(Quantity {
            magnitude,
            unit: Unit {
                factor,
                dim,
                symbol: join_symbol(numerator, denominator),
            },
        })
    }
}

fn number_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        let c = bytes[end];
        let accept = match c {
            b'0'..=b'9' | b'.' => true,
            b'+' | b'-' => end == 0 || matches!(bytes[end - 1], b'e' | b'E'),
            b'e' | b'E' => {
                end > 0
                    && bytes
                        .get(end + 1)
                        .is_some_and(|n| n.is_ascii_digit() || *n == b'-' || *n == b'+')
            }
            _ => false,
        };
        if !accept {
            break;
        }
        end += 1;
    }
    end
}

impl Mul<f64> for Quantity {
    type Output = Quantity;

    fn mul(mut self, rhs: f64) -> Quantity {
        self.magnitude *= rhs;
        self
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.symbol.is_empty() {
            write!(f, "{}", self.magnitude)
        } else {
            write!(f, "{} {}", self.magnitude, self.unit.symbol)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl serde::de::Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number or a string such as \"10 nm\"")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Quantity, E> {
                Quantity::parse(v).map_err(E::custom)
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Quantity, E> {
                Ok(Quantity::dimensionless(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::dimensionless(v as f64))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::dimensionless(v as f64))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// Linear calibration between an actuator's physical units and DAQ volts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Units the slope and offset are expressed in (e.g. `"um"` for a piezo).
    pub units: String,
    /// Physical units per volt.
    pub slope: f64,
    /// Physical value at zero volts.
    #[serde(default)]
    pub offset: f64,
}

impl Calibration {
    /// Volts to write for the physical value `value`.
    pub fn to_volts(&self, value: &Quantity) -> AppResult<f64> {
        if self.slope == 0.0 {
            return Err(ExperimentorError::Units(format!(
                "calibration in '{}' has a zero slope",
                self.units
            )));
        }
        let magnitude = value.m_as(&self.units)?;
        Ok((magnitude - self.offset) / self.slope)
    }

    /// Physical value read back from `volts`.
    pub fn from_volts(&self, volts: f64) -> AppResult<Quantity> {
        Quantity::new(volts * self.slope + self.offset, &self.units)
    }
}
