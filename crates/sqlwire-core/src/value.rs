//! Dynamic SQL values.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeErrorKind, Error, Result};

/// One decoded column or bound parameter. Temporal columns arrive as
/// ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    /// Columns carrying the unsigned flag
    UnsignedBigInt(u64),
    Float(f32),
    Double(f64),
    /// Exact decimal kept as its text rendering
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL-ish name of the variant, used in conversion errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::UnsignedBigInt(_) => "BIGINT UNSIGNED",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Json(_) => "JSON",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Text(s) if s == "0" || s == "1" => Some(s == "1"),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    /// Signed view of any integer variant that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::UnsignedBigInt(v) => i64::try_from(*v).ok(),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Text(s) | Value::Decimal(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert this value to a u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UnsignedBigInt(v) => Some(*v),
            Value::Text(s) | Value::Decimal(s) => s.trim().parse().ok(),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::UnsignedBigInt(v) => Some(*v as f64),
            Value::Decimal(s) | Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) | Value::Decimal(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UnsignedBigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a decoded column value into a Rust type.
pub trait FromValue: Sized {
    /// Convert, failing with a `Conversion` decode error.
    fn from_value(value: &Value) -> Result<Self>;
}

fn conversion_error(value: &Value, rust_type: &str) -> Error {
    Error::Decode(DecodeError::new(
        DecodeErrorKind::Conversion,
        format!("cannot convert {} to {rust_type}", value.type_name()),
    ))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| conversion_error(value, "bool"))
    }
}

macro_rules! impl_from_value_signed {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    value
                        .as_i64()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .ok_or_else(|| conversion_error(value, stringify!($ty)))
                }
            }
        )*
    };
}

impl_from_value_signed!(i8, i16, i32, i64);

macro_rules! impl_from_value_unsigned {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    value
                        .as_u64()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .ok_or_else(|| conversion_error(value, stringify!($ty)))
                }
            }
        )*
    };
}

impl_from_value_unsigned!(u8, u16, u32, u64);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| conversion_error(value, "f64"))
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            other => other
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| conversion_error(other, "f32")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| {
                Error::Decode(DecodeError::new(
                    DecodeErrorKind::Conversion,
                    "column bytes are not valid UTF-8",
                ))
            }),
            Value::Bool(v) => Ok(v.to_string()),
            Value::TinyInt(v) => Ok(v.to_string()),
            Value::SmallInt(v) => Ok(v.to_string()),
            Value::Int(v) => Ok(v.to_string()),
            Value::BigInt(v) => Ok(v.to_string()),
            Value::UnsignedBigInt(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::Json(v) => Ok(v.to_string()),
            Value::Null => Err(conversion_error(value, "String")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| conversion_error(value, "Vec<u8>"))
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| {
                Error::Decode(DecodeError::new(
                    DecodeErrorKind::Conversion,
                    format!("invalid JSON text: {e}"),
                ))
            }),
            Value::Bytes(b) => serde_json::from_slice(b).map_err(|e| {
                Error::Decode(DecodeError::new(
                    DecodeErrorKind::Conversion,
                    format!("invalid JSON bytes: {e}"),
                ))
            }),
            other => Err(conversion_error(other, "serde_json::Value")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_integers_convert() {
        let v = Value::Text("42".to_string());
        assert_eq!(i32::from_value(&v).unwrap(), 42);
        assert_eq!(u64::from_value(&v).unwrap(), 42);
        assert_eq!(f64::from_value(&v).unwrap(), 42.0);
    }

    #[test]
    fn test_unsigned_range() {
        let v = Value::UnsignedBigInt(u64::MAX);
        assert_eq!(u64::from_value(&v).unwrap(), u64::MAX);
        let err = i64::from_value(&v).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::Conversion));
    }

    #[test]
    fn test_narrowing_overflow_fails() {
        let v = Value::Int(300);
        assert!(i8::from_value(&v).is_err());
        assert_eq!(i16::from_value(&v).unwrap(), 300);
    }

    #[test]
    fn test_option_null() {
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(
            Option::<String>::from_value(&Value::Text("x".into())).unwrap(),
            Some("x".to_string())
        );
        assert!(String::from_value(&Value::Null).is_err());
    }

    #[test]
    fn test_string_from_numeric() {
        assert_eq!(String::from_value(&Value::BigInt(-7)).unwrap(), "-7");
        assert_eq!(
            String::from_value(&Value::Decimal("1.50".into())).unwrap(),
            "1.50"
        );
    }

    #[test]
    fn test_json_from_text() {
        let v = Value::Text(r#"{"a":1}"#.to_string());
        let json = serde_json::Value::from_value(&v).unwrap();
        assert_eq!(json["a"], 1);
    }

    #[test]
    fn test_bool_conversions() {
        assert!(bool::from_value(&Value::TinyInt(1)).unwrap());
        assert!(!bool::from_value(&Value::Text("0".into())).unwrap());
        assert!(bool::from_value(&Value::Bytes(vec![1])).is_err());
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(5_i32)), Value::Int(5));
    }
}
