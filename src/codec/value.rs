//! Value sizes and decoded values.
//!
//! A data request declares either a typed scalar (encoded as a small
//! negative number in the unsigned size field) or a raw byte count.

use std::fmt;

use crate::error::{Result, WasimError};

pub const DATA_TYPE_INT8: u32 = -1i32 as u32;
pub const DATA_TYPE_INT16: u32 = -2i32 as u32;
pub const DATA_TYPE_INT32: u32 = -3i32 as u32;
pub const DATA_TYPE_INT64: u32 = -4i32 as u32;
pub const DATA_TYPE_FLOAT: u32 = -5i32 as u32;
pub const DATA_TYPE_DOUBLE: u32 = -6i32 as u32;

/// Declared size/type of a data request's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueSize {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    #[default]
    Float64,
    /// Raw byte count, decoded as a NUL-terminated string.
    Bytes(u32),
}

impl ValueSize {
    /// Encode into the descriptor's `valueSize` field.
    pub fn to_wire(self) -> u32 {
        match self {
            ValueSize::Int8 => DATA_TYPE_INT8,
            ValueSize::Int16 => DATA_TYPE_INT16,
            ValueSize::Int32 => DATA_TYPE_INT32,
            ValueSize::Int64 => DATA_TYPE_INT64,
            ValueSize::Float32 => DATA_TYPE_FLOAT,
            ValueSize::Float64 => DATA_TYPE_DOUBLE,
            ValueSize::Bytes(n) => n,
        }
    }

    /// Decode the descriptor's `valueSize` field.
    pub fn from_wire(value: u32) -> Self {
        match value {
            DATA_TYPE_INT8 => ValueSize::Int8,
            DATA_TYPE_INT16 => ValueSize::Int16,
            DATA_TYPE_INT32 => ValueSize::Int32,
            DATA_TYPE_INT64 => ValueSize::Int64,
            DATA_TYPE_FLOAT => ValueSize::Float32,
            DATA_TYPE_DOUBLE => ValueSize::Float64,
            n => ValueSize::Bytes(n),
        }
    }

    /// Number of bytes a value of this size occupies.
    pub fn byte_len(self) -> u32 {
        match self {
            ValueSize::Int8 => 1,
            ValueSize::Int16 => 2,
            ValueSize::Int32 | ValueSize::Float32 => 4,
            ValueSize::Int64 | ValueSize::Float64 => 8,
            ValueSize::Bytes(n) => n,
        }
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueSize::Int8 | ValueSize::Int16 | ValueSize::Int32 | ValueSize::Int64
        )
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueSize::Bytes(_))
    }
}

/// A decoded value update.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl DataValue {
    /// Decode `raw` according to the declared size.
    ///
    /// `raw` must hold at least `size.byte_len()` bytes; extra bytes are
    /// ignored.
    pub fn decode(size: ValueSize, raw: &[u8]) -> Result<Self> {
        let need = size.byte_len() as usize;
        if raw.len() < need {
            return Err(WasimError::Protocol(format!(
                "Value is {} bytes, expected {}",
                raw.len(),
                need
            )));
        }
        let raw = &raw[..need];
        Ok(match size {
            ValueSize::Int8 => DataValue::I8(raw[0] as i8),
            ValueSize::Int16 => DataValue::I16(i16::from_le_bytes([raw[0], raw[1]])),
            ValueSize::Int32 => DataValue::I32(i32::from_le_bytes(array4(raw))),
            ValueSize::Int64 => DataValue::I64(i64::from_le_bytes(array8(raw))),
            ValueSize::Float32 => DataValue::F32(f32::from_le_bytes(array4(raw))),
            ValueSize::Float64 => DataValue::F64(f64::from_le_bytes(array8(raw))),
            ValueSize::Bytes(_) => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                DataValue::String(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
        })
    }

    /// Numeric value as `f64`, `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            DataValue::I8(v) => v as f64,
            DataValue::I16(v) => v as f64,
            DataValue::I32(v) => v as f64,
            DataValue::I64(v) => v as f64,
            DataValue::F32(v) => v as f64,
            DataValue::F64(v) => v,
            DataValue::String(_) => return None,
        })
    }

    /// Integer value, `None` for floats and strings.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            DataValue::I8(v) => Some(v as i64),
            DataValue::I16(v) => Some(v as i64),
            DataValue::I32(v) => Some(v as i64),
            DataValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::I8(v) => write!(f, "{}", v),
            DataValue::I16(v) => write!(f, "{}", v),
            DataValue::I32(v) => write!(f, "{}", v),
            DataValue::I64(v) => write!(f, "{}", v),
            DataValue::F32(v) => write!(f, "{}", v),
            DataValue::F64(v) => write!(f, "{}", v),
            DataValue::String(v) => f.write_str(v),
        }
    }
}

fn array4(raw: &[u8]) -> [u8; 4] {
    [raw[0], raw[1], raw[2], raw[3]]
}

fn array8(raw: &[u8]) -> [u8; 8] {
    [raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_wrap_negative() {
        assert_eq!(DATA_TYPE_INT8, 0xFFFF_FFFF);
        assert_eq!(DATA_TYPE_DOUBLE, 0xFFFF_FFFA);
        assert_eq!(ValueSize::from_wire(DATA_TYPE_FLOAT), ValueSize::Float32);
        assert_eq!(ValueSize::from_wire(12), ValueSize::Bytes(12));
        assert_eq!(ValueSize::Int16.to_wire(), -2i32 as u32);
    }

    #[test]
    fn test_byte_len() {
        assert_eq!(ValueSize::Int8.byte_len(), 1);
        assert_eq!(ValueSize::Int16.byte_len(), 2);
        assert_eq!(ValueSize::Float32.byte_len(), 4);
        assert_eq!(ValueSize::Int64.byte_len(), 8);
        assert_eq!(ValueSize::Bytes(40).byte_len(), 40);
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(
            DataValue::decode(ValueSize::Float64, &1.5f64.to_le_bytes()).unwrap(),
            DataValue::F64(1.5)
        );
        assert_eq!(
            DataValue::decode(ValueSize::Int32, &(-7i32).to_le_bytes()).unwrap(),
            DataValue::I32(-7)
        );
        assert_eq!(
            DataValue::decode(ValueSize::Int8, &[0xFF]).unwrap(),
            DataValue::I8(-1)
        );
    }

    #[test]
    fn test_decode_string_stops_at_nul() {
        let value = DataValue::decode(ValueSize::Bytes(8), b"N123\0\0\0\0").unwrap();
        assert_eq!(value.as_str(), Some("N123"));
        assert_eq!(value.as_f64(), None);
    }

    #[test]
    fn test_decode_short_payload() {
        assert!(DataValue::decode(ValueSize::Float64, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(DataValue::I16(300).as_f64(), Some(300.0));
        assert_eq!(DataValue::I16(300).as_i64(), Some(300));
        assert_eq!(DataValue::F32(0.5).as_i64(), None);
        assert_eq!(DataValue::F64(2.25).to_string(), "2.25");
    }
}
