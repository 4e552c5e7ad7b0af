//! Payload decoding for parameter values.
//!
//! Broker payloads are plain ASCII text. Every byte is mapped to the code point
//! of the same value before parsing, so payloads are effectively read as
//! Latin-1; multi-byte encodings are not supported.

use strum::{Display, EnumString};

use crate::topic::format_value;

/// Kind of value a parameter holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Bool,
}

/// Errors that can occur while decoding a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload text is not a valid literal of the expected kind
    Format { expected: ParamKind, input: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Format { expected, input } => {
                write!(f, "Payload {:?} is not a valid {} literal", input, expected)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Convert a raw payload into a string, one character per byte.
pub fn ascii_string(payload: &[u8]) -> String {
    payload.iter().map(|&b| char::from(b)).collect()
}

/// Decode an integer. Only the part left of the first `.` is parsed, so
/// `42.9` decodes to `42`.
pub fn decode_int(payload: &[u8]) -> Result<i64, DecodeError> {
    let s = ascii_string(payload);
    let integral = s.split('.').next().unwrap_or_default();
    integral.trim().parse::<i64>().map_err(|_| DecodeError::Format {
        expected: ParamKind::Int,
        input: s.clone(),
    })
}

/// Decode a floating point literal.
pub fn decode_float(payload: &[u8]) -> Result<f64, DecodeError> {
    let s = ascii_string(payload);
    s.trim().parse::<f64>().map_err(|_| DecodeError::Format {
        expected: ParamKind::Float,
        input: s.clone(),
    })
}

/// Decode a boolean. Only `TRUE` (any case, surrounding whitespace ignored)
/// is true; everything else is false.
pub fn decode_bool(payload: &[u8]) -> bool {
    ascii_string(payload).trim().eq_ignore_ascii_case("TRUE")
}

/// A value type a [`Parameter`](crate::Parameter) can hold.
pub trait ParamValue: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const KIND: ParamKind;

    fn decode(payload: &[u8]) -> Result<Self, DecodeError>;

    /// Numeric form used for control publishes
    fn as_f64(&self) -> f64;

    /// Text published for this value: fixed-point, three fraction digits
    fn encode(&self) -> String {
        format_value(self.as_f64())
    }
}

impl ParamValue for i64 {
    const KIND: ParamKind = ParamKind::Int;

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        decode_int(payload)
    }

    fn as_f64(&self) -> f64 {
        *self as f64
    }
}

impl ParamValue for f64 {
    const KIND: ParamKind = ParamKind::Float;

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        decode_float(payload)
    }

    fn as_f64(&self) -> f64 {
        *self
    }
}

impl ParamValue for bool {
    const KIND: ParamKind = ParamKind::Bool;

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(decode_bool(payload))
    }

    fn as_f64(&self) -> f64 {
        if *self { 1.0 } else { 0.0 }
    }
}
