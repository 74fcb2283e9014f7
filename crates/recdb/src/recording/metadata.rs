//! Typed, immutable-once-published recording metadata.
//!
//! Keys follow the axis naming convention downstream viewers rely on:
//!
//! | key                          | value                 |
//! |------------------------------|-----------------------|
//! | `ande_array-axis{N}_coord`   | string, axis name     |
//! | `ande_array-axis{N}_units`   | string, axis units    |
//! | `ande_array-axis{N}_offset`  | double with units     |
//! | `ande_array-axis{N}_scale`   | double with units     |
//! | `ande_array-ampl_coord`      | string, sample name   |
//! | `ande_array-ampl_units`      | string, sample units  |

use std::collections::BTreeMap;
use std::fmt;

/// Key naming the quantity stored in the array samples.
pub const AMPL_COORD_KEY: &str = "ande_array-ampl_coord";

/// Key naming the units of the array samples.
pub const AMPL_UNITS_KEY: &str = "ande_array-ampl_units";

/// Key naming the coordinate along `axis`.
pub fn axis_coord_key(axis: usize) -> String {
    format!("ande_array-axis{axis}_coord")
}

/// Key naming the units along `axis`.
pub fn axis_units_key(axis: usize) -> String {
    format!("ande_array-axis{axis}_units")
}

/// Key for the coordinate of the first element along `axis`.
pub fn axis_offset_key(axis: usize) -> String {
    format!("ande_array-axis{axis}_offset")
}

/// Key for the coordinate step between elements along `axis`.
pub fn axis_scale_key(axis: usize) -> String {
    format!("ande_array-axis{axis}_scale")
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// UTF-8 string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Unsigned(u64),
    /// Boolean flag.
    Bool(bool),
    /// Double precision value with a unit string (empty when unitless).
    Dbl {
        /// Numeric value.
        value: f64,
        /// Units of `value`.
        units: String,
    },
}

impl MetaValue {
    /// Creates a double with units.
    pub fn dbl_units(value: f64, units: impl Into<String>) -> Self {
        MetaValue::Dbl {
            value,
            units: units.into(),
        }
    }

    /// Returns the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the signed integer value, if this is a signed integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the unsigned integer value, if this is an unsigned integer.
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            MetaValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns value and units, if this is a double.
    pub fn as_dbl(&self) -> Option<(f64, &str)> {
        match self {
            MetaValue::Dbl { value, units } => Some((*value, units)),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => write!(f, "{s}"),
            MetaValue::Int(v) => write!(f, "{v}"),
            MetaValue::Unsigned(v) => write!(f, "{v}"),
            MetaValue::Bool(v) => write!(f, "{v}"),
            MetaValue::Dbl { value, units } if units.is_empty() => write!(f, "{value}"),
            MetaValue::Dbl { value, units } => write!(f, "{value} {units}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<u64> for MetaValue {
    fn from(value: u64) -> Self {
        MetaValue::Unsigned(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::dbl_units(value, "")
    }
}

/// Ordered key/value metadata attached to a recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: BTreeMap<String, MetaValue>,
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, returning the previous value for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetaValue>,
    ) -> Option<MetaValue> {
        self.entries.insert(key.into(), value.into())
    }

    /// Builder form of [`Metadata::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Describes one array axis using the naming convention.
    pub fn with_axis(
        mut self,
        axis: usize,
        coord: &str,
        units: &str,
        offset: f64,
        scale: f64,
    ) -> Self {
        self.insert(axis_coord_key(axis), coord);
        self.insert(axis_units_key(axis), units);
        self.insert(axis_offset_key(axis), MetaValue::dbl_units(offset, units));
        self.insert(axis_scale_key(axis), MetaValue::dbl_units(scale, units));
        self
    }

    /// Describes the sampled quantity using the naming convention.
    pub fn with_amplitude(mut self, coord: &str, units: &str) -> Self {
        self.insert(AMPL_COORD_KEY, coord);
        self.insert(AMPL_UNITS_KEY, units);
        self
    }

    /// Copies every entry of `other` over this metadata.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Looks up an entry.
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    /// Looks up a string entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    /// Looks up a signed integer entry.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(MetaValue::as_int)
    }

    /// Looks up an unsigned integer entry.
    pub fn get_unsigned(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetaValue::as_unsigned)
    }

    /// Looks up a boolean entry.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(MetaValue::as_bool)
    }

    /// Looks up a double entry with its units.
    pub fn get_dbl(&self, key: &str) -> Option<(f64, &str)> {
        self.get(key).and_then(MetaValue::as_dbl)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<MetaValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}
