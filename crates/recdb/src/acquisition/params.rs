//! Camera parameter table.
//!
//! Each [`CameraParameter`] maps to one [`ParameterSpec`] row: the native
//! control id of the frame source, how to decode the raw control value, how
//! to encode a requested value and how to describe it in recording metadata.
//!
//! | name          | control id | kind  | units  |
//! |---------------|-----------:|-------|--------|
//! | `width`       | 3          | int   | pixels |
//! | `height`      | 4          | int   | pixels |
//! | `fps`         | 5          | float | Hz     |
//! | `brightness`  | 10         | float |        |
//! | `contrast`    | 11         | float |        |
//! | `gain`        | 14         | float |        |
//! | `exposure`    | 15         | float |        |

use crate::error::{RecDbError, Result};
use crate::recording::metadata::MetaValue;
use std::fmt;

/// A camera parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    /// Integral setting.
    Int(i64),
    /// Continuous setting.
    Float(f64),
}

impl ParameterValue {
    /// Numeric value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            ParameterValue::Int(v) => v as f64,
            ParameterValue::Float(v) => v,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

/// Camera settings exposed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraParameter {
    /// Frame width in pixels.
    FrameWidth,
    /// Frame height in pixels.
    FrameHeight,
    /// Frame rate.
    Fps,
    /// Brightness.
    Brightness,
    /// Contrast.
    Contrast,
    /// Sensor gain.
    Gain,
    /// Exposure.
    Exposure,
}

/// One row of the parameter table.
#[derive(Debug, Clone, Copy)]
pub struct ParameterSpec {
    /// Parameter kind.
    pub kind: CameraParameter,
    /// Lookup name.
    pub name: &'static str,
    /// Native control identifier of the frame source.
    pub control_id: i32,
    /// Units recorded in metadata.
    pub units: &'static str,
    /// Raw control value to typed value.
    pub decode: fn(f64) -> ParameterValue,
    /// Typed value to raw control value.
    pub encode: fn(ParameterValue) -> Result<f64>,
    /// Typed value to metadata value.
    pub metadata: fn(ParameterValue, &'static str) -> MetaValue,
}

impl ParameterSpec {
    /// Metadata key under which the parameter is recorded.
    pub fn metadata_key(&self) -> String {
        format!("camera-{}", self.name)
    }
}

fn decode_int(raw: f64) -> ParameterValue {
    ParameterValue::Int(raw.round() as i64)
}

fn decode_float(raw: f64) -> ParameterValue {
    ParameterValue::Float(raw)
}

fn encode_dimension(value: ParameterValue) -> Result<f64> {
    match value {
        ParameterValue::Int(v) if v > 0 => Ok(v as f64),
        other => Err(RecDbError::InvalidParameter(format!(
            "frame dimension must be a positive integer, got {other}"
        ))),
    }
}

fn encode_positive(value: ParameterValue) -> Result<f64> {
    let raw = value.as_f64();
    if raw.is_finite() && raw > 0.0 {
        Ok(raw)
    } else {
        Err(RecDbError::InvalidParameter(format!(
            "value must be positive, got {value}"
        )))
    }
}

fn encode_finite(value: ParameterValue) -> Result<f64> {
    let raw = value.as_f64();
    if raw.is_finite() {
        Ok(raw)
    } else {
        Err(RecDbError::InvalidParameter(format!(
            "value must be finite, got {value}"
        )))
    }
}

fn metadata_int(value: ParameterValue, _units: &'static str) -> MetaValue {
    match value {
        ParameterValue::Int(v) => MetaValue::Int(v),
        ParameterValue::Float(v) => MetaValue::Int(v.round() as i64),
    }
}

fn metadata_dbl(value: ParameterValue, units: &'static str) -> MetaValue {
    MetaValue::dbl_units(value.as_f64(), units)
}

const fn row(
    kind: CameraParameter,
    name: &'static str,
    control_id: i32,
    units: &'static str,
    integral: bool,
    encode: fn(ParameterValue) -> Result<f64>,
) -> ParameterSpec {
    ParameterSpec {
        kind,
        name,
        control_id,
        units,
        decode: if integral { decode_int } else { decode_float },
        encode,
        metadata: if integral { metadata_int } else { metadata_dbl },
    }
}

static PARAMETERS: [ParameterSpec; 7] = [
    row(CameraParameter::FrameWidth, "width", 3, "pixels", true, encode_dimension),
    row(CameraParameter::FrameHeight, "height", 4, "pixels", true, encode_dimension),
    row(CameraParameter::Fps, "fps", 5, "Hz", false, encode_positive),
    row(CameraParameter::Brightness, "brightness", 10, "", false, encode_finite),
    row(CameraParameter::Contrast, "contrast", 11, "", false, encode_finite),
    row(CameraParameter::Gain, "gain", 14, "", false, encode_finite),
    row(CameraParameter::Exposure, "exposure", 15, "", false, encode_finite),
];

impl CameraParameter {
    /// Every parameter in table order.
    pub const ALL: [CameraParameter; 7] = [
        CameraParameter::FrameWidth,
        CameraParameter::FrameHeight,
        CameraParameter::Fps,
        CameraParameter::Brightness,
        CameraParameter::Contrast,
        CameraParameter::Gain,
        CameraParameter::Exposure,
    ];

    /// Table row of this parameter.
    pub fn spec(self) -> &'static ParameterSpec {
        let index = match self {
            CameraParameter::FrameWidth => 0,
            CameraParameter::FrameHeight => 1,
            CameraParameter::Fps => 2,
            CameraParameter::Brightness => 3,
            CameraParameter::Contrast => 4,
            CameraParameter::Gain => 5,
            CameraParameter::Exposure => 6,
        };
        &PARAMETERS[index]
    }

    /// Lookup name.
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Finds a parameter by name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::InvalidParameter` for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        PARAMETERS
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(name))
            .map(|spec| spec.kind)
            .ok_or_else(|| {
                RecDbError::InvalidParameter(format!("unknown camera parameter '{name}'"))
            })
    }
}

impl fmt::Display for CameraParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows_match_kinds() {
        for kind in CameraParameter::ALL {
            assert_eq!(kind.spec().kind, kind);
            assert_eq!(CameraParameter::from_name(kind.name()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(
            CameraParameter::from_name("zoom"),
            Err(RecDbError::InvalidParameter(_))
        ));
        assert_eq!(CameraParameter::from_name("Exposure").unwrap(), CameraParameter::Exposure);
    }

    #[test]
    fn test_decode_encode() {
        let width = CameraParameter::FrameWidth.spec();
        assert_eq!((width.decode)(639.6), ParameterValue::Int(640));
        assert_eq!((width.encode)(ParameterValue::Int(640)).unwrap(), 640.0);
        assert!((width.encode)(ParameterValue::Int(0)).is_err());

        let fps = CameraParameter::Fps.spec();
        assert!((fps.encode)(ParameterValue::Float(-1.0)).is_err());
        assert_eq!(
            (fps.metadata)(ParameterValue::Float(30.0), fps.units),
            MetaValue::dbl_units(30.0, "Hz")
        );
        assert_eq!(fps.metadata_key(), "camera-fps");
    }
}
