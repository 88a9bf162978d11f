//! Column type system and value conversion.
//!
//! This module provides:
//! - Column type ids and their binary widths
//! - Column definition parsing
//! - Decoding of text and binary column bytes into [`Value`]
//! - Binary encoding of [`Value`] parameters

use sqlwire_core::{DecodeError, DecodeErrorKind, Error, Result, Value};

use crate::protocol::{PacketReader, PacketWriter};

/// Column type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

/// How a present column is laid out in a binary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryWidth {
    /// Exactly this many bytes
    Fixed(usize),
    /// A length-encoded integer followed by that many bytes
    LengthPrefixed,
}

impl FieldType {
    /// Parse a type id. Ids outside the known table yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        };
        Some(ty)
    }

    /// Layout of this type in a binary row.
    ///
    /// Temporal values carry a one byte length (0, 4, 7, 8, 11 or 12), which
    /// is a valid length-encoded integer, so they share the prefixed layout.
    pub const fn binary_width(self) -> BinaryWidth {
        match self {
            FieldType::Null => BinaryWidth::Fixed(0),
            FieldType::Tiny => BinaryWidth::Fixed(1),
            FieldType::Short | FieldType::Year => BinaryWidth::Fixed(2),
            FieldType::Long | FieldType::Int24 | FieldType::Float => BinaryWidth::Fixed(4),
            FieldType::LongLong | FieldType::Double => BinaryWidth::Fixed(8),
            _ => BinaryWidth::LengthPrefixed,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
                | FieldType::Bit
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
}

/// Per-column metadata of a result set or statement parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set number
    pub charset: u16,
    /// Maximum display length
    pub column_length: u32,
    /// Raw type id as sent by the server
    pub type_id: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Convenience constructor used for locally built result sets.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(crate::protocol::charset::DEFAULT_CHARSET),
            column_length: 0,
            type_id: field_type as u8,
            flags: 0,
            decimals: 0,
        }
    }

    /// Set column flags.
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Parse a column definition payload.
    ///
    /// Layout: catalog, schema, table, org_table, name, org_name (all
    /// length-encoded strings), length of fixed fields (lenenc, 0x0C),
    /// charset u16, column_length u32, type u8, flags u16, decimals u8.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = || {
            Error::Decode(DecodeError::new(
                DecodeErrorKind::Malformed,
                "truncated column definition",
            ))
        };
        let mut reader = PacketReader::new(payload);
        let _catalog = reader.read_lenenc_string().ok_or_else(malformed)?;
        let schema = reader.read_lenenc_string().ok_or_else(malformed)?;
        let table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let _fixed_len = reader.read_lenenc_int().ok_or_else(malformed)?;
        let charset = reader.read_u16_le().ok_or_else(malformed)?;
        let column_length = reader.read_u32_le().ok_or_else(malformed)?;
        let type_id = reader.read_u8().ok_or_else(malformed)?;
        let flags = reader.read_u16_le().ok_or_else(malformed)?;
        let decimals = reader.read_u8().ok_or_else(malformed)?;

        Ok(Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            type_id,
            flags,
            decimals,
        })
    }

    /// Encode as a column definition payload (inverse of [`parse`](Self::parse)).
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(64);
        writer.write_lenenc_string("def");
        writer.write_lenenc_string(&self.schema);
        writer.write_lenenc_string(&self.table);
        writer.write_lenenc_string(&self.org_table);
        writer.write_lenenc_string(&self.name);
        writer.write_lenenc_string(&self.org_name);
        writer.write_lenenc_int(0x0C);
        writer.write_u16_le(self.charset);
        writer.write_u32_le(self.column_length);
        writer.write_u8(self.type_id);
        writer.write_u16_le(self.flags);
        writer.write_u8(self.decimals);
        writer.write_zeros(2);
        writer.into_bytes()
    }

    /// Known type, or `None` for an id outside the table.
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u8(self.type_id)
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

fn parse_or_text<T: std::str::FromStr>(text: &str, wrap: impl FnOnce(T) -> Value) -> Value {
    text.parse::<T>()
        .map_or_else(|_| Value::Text(text.to_string()), wrap)
}

/// Decode a text-encoded column.
///
/// Every text column is a string; it is parsed according to the column type.
/// Unparseable numerics fall back to `Value::Text`.
pub fn decode_text_value(column: &ColumnDefinition, data: &[u8]) -> Value {
    let Some(field_type) = column.field_type() else {
        return Value::Bytes(data.to_vec());
    };
    let unsigned = column.is_unsigned();
    let text = String::from_utf8_lossy(data);

    match field_type {
        FieldType::Tiny if unsigned => parse_or_text(&text, |v: u8| Value::SmallInt(i16::from(v))),
        FieldType::Tiny => parse_or_text(&text, Value::TinyInt),
        FieldType::Short | FieldType::Year if unsigned => {
            parse_or_text(&text, |v: u16| Value::Int(i32::from(v)))
        }
        FieldType::Short | FieldType::Year => parse_or_text(&text, Value::SmallInt),
        FieldType::Long | FieldType::Int24 if unsigned => {
            parse_or_text(&text, |v: u32| Value::BigInt(i64::from(v)))
        }
        FieldType::Long | FieldType::Int24 => parse_or_text(&text, Value::Int),
        FieldType::LongLong if unsigned => parse_or_text(&text, Value::UnsignedBigInt),
        FieldType::LongLong => parse_or_text(&text, Value::BigInt),
        FieldType::Float => parse_or_text(&text, Value::Float),
        FieldType::Double => parse_or_text(&text, Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Json),
        FieldType::Null => Value::Null,
        ft if ft.is_blob() || column.is_binary() => Value::Bytes(data.to_vec()),
        _ => Value::Text(text.into_owned()),
    }
}

fn fixed<const N: usize>(data: &[u8], column: usize) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| {
            Error::Decode(
                DecodeError::new(
                    DecodeErrorKind::Malformed,
                    format!("expected {N} bytes, found {}", data.len()),
                )
                .at_column(column),
            )
        })
}

/// Decode a binary-encoded column. `data` is the column's bytes without any
/// length prefix.
pub fn decode_binary_value(column: &ColumnDefinition, index: usize, data: &[u8]) -> Result<Value> {
    let field_type = column.field_type().ok_or_else(|| {
        Error::Decode(
            DecodeError::new(
                DecodeErrorKind::UnknownColumnWidth,
                format!("column type 0x{:02X} has no binary layout", column.type_id),
            )
            .at_column(index),
        )
    })?;
    let unsigned = column.is_unsigned();

    let value = match field_type {
        FieldType::Tiny => {
            let [b] = fixed::<1>(data, index)?;
            if unsigned {
                Value::SmallInt(i16::from(b))
            } else {
                Value::TinyInt(b as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let raw = fixed::<2>(data, index)?;
            if unsigned {
                Value::Int(i32::from(u16::from_le_bytes(raw)))
            } else {
                Value::SmallInt(i16::from_le_bytes(raw))
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let raw = fixed::<4>(data, index)?;
            if unsigned {
                Value::BigInt(i64::from(u32::from_le_bytes(raw)))
            } else {
                Value::Int(i32::from_le_bytes(raw))
            }
        }
        FieldType::LongLong => {
            let raw = fixed::<8>(data, index)?;
            if unsigned {
                Value::UnsignedBigInt(u64::from_le_bytes(raw))
            } else {
                Value::BigInt(i64::from_le_bytes(raw))
            }
        }
        FieldType::Float => Value::Float(f32::from_le_bytes(fixed::<4>(data, index)?)),
        FieldType::Double => Value::Double(f64::from_le_bytes(fixed::<8>(data, index)?)),
        FieldType::Null => Value::Null,
        FieldType::Decimal | FieldType::NewDecimal => {
            Value::Decimal(String::from_utf8_lossy(data).into_owned())
        }
        FieldType::Json => serde_json::from_slice(data)
            .map_or_else(|_| Value::Bytes(data.to_vec()), Value::Json),
        ft if ft.is_temporal() => Value::Text(decode_binary_temporal(ft, index, data)?),
        ft if ft.is_blob() || column.is_binary() => Value::Bytes(data.to_vec()),
        _ => Value::Text(String::from_utf8_lossy(data).into_owned()),
    };
    Ok(value)
}

/// Render binary temporal values as ISO-8601 text.
fn decode_binary_temporal(field_type: FieldType, column: usize, data: &[u8]) -> Result<String> {
    let ymd = |d: &[u8]| {
        let year = u16::from_le_bytes([d[0], d[1]]);
        format!("{year:04}-{:02}-{:02}", d[2], d[3])
    };
    let text = match field_type {
        FieldType::Date | FieldType::NewDate => {
            if data.len() >= 4 {
                ymd(data)
            } else {
                "0000-00-00".to_string()
            }
        }

        FieldType::Time | FieldType::Time2 => {
            if data.len() >= 8 {
                let sign = if data[0] != 0 { "-" } else { "" };
                let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                let hours = days
                    .checked_mul(24)
                    .and_then(|h| h.checked_add(u32::from(data[5])))
                    .ok_or_else(|| {
                        Error::Decode(
                            DecodeError::new(
                                DecodeErrorKind::Malformed,
                                format!("TIME day count {days} out of range"),
                            )
                            .at_column(column),
                        )
                    })?;
                let base = format!("{sign}{hours:02}:{:02}:{:02}", data[6], data[7]);
                if data.len() >= 12 {
                    let micros = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
                    format!("{base}.{micros:06}")
                } else {
                    base
                }
            } else {
                "00:00:00".to_string()
            }
        }

        _ => {
            if data.len() >= 7 {
                let base = format!("{} {:02}:{:02}:{:02}", ymd(data), data[4], data[5], data[6]);
                if data.len() >= 11 {
                    let micros = u32::from_le_bytes([data[7], data[8], data[9], data[10]]);
                    format!("{base}.{micros:06}")
                } else {
                    base
                }
            } else if data.len() >= 4 {
                format!("{} 00:00:00", ymd(data))
            } else {
                "0000-00-00 00:00:00".to_string()
            }
        }
    };
    Ok(text)
}

/// Wire type id and unsigned flag used to send a parameter.
pub fn parameter_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
    }
}

/// Append the binary encoding of a non-NULL parameter.
pub fn encode_binary_value(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::SmallInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::BigInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(ft: FieldType) -> ColumnDefinition {
        ColumnDefinition::new("c", ft)
    }

    #[test]
    fn test_field_type_from_u8() {
        assert_eq!(FieldType::from_u8(0x01), Some(FieldType::Tiny));
        assert_eq!(FieldType::from_u8(0xFC), Some(FieldType::Blob));
        assert_eq!(FieldType::from_u8(0x42), None);
    }

    #[test]
    fn test_binary_widths() {
        assert_eq!(FieldType::Tiny.binary_width(), BinaryWidth::Fixed(1));
        assert_eq!(FieldType::Year.binary_width(), BinaryWidth::Fixed(2));
        assert_eq!(FieldType::Float.binary_width(), BinaryWidth::Fixed(4));
        assert_eq!(FieldType::Double.binary_width(), BinaryWidth::Fixed(8));
        assert_eq!(FieldType::Null.binary_width(), BinaryWidth::Fixed(0));
        assert_eq!(FieldType::VarString.binary_width(), BinaryWidth::LengthPrefixed);
        assert_eq!(FieldType::DateTime.binary_width(), BinaryWidth::LengthPrefixed);
    }

    #[test]
    fn test_column_definition_roundtrip() {
        let mut def = ColumnDefinition::new("id", FieldType::LongLong)
            .with_flags(column_flags::UNSIGNED | column_flags::NOT_NULL);
        def.table = "users".to_string();
        def.column_length = 20;
        let parsed = ColumnDefinition::parse(&def.encode()).unwrap();
        assert_eq!(parsed, def);
        assert!(parsed.is_unsigned());
        assert!(parsed.is_not_null());
    }

    #[test]
    fn test_column_definition_truncated() {
        let bytes = ColumnDefinition::new("id", FieldType::Long).encode();
        let err = ColumnDefinition::parse(&bytes[..10]).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::Malformed));
    }

    #[test]
    fn test_decode_text_integers() {
        assert_eq!(decode_text_value(&col(FieldType::Long), b"42"), Value::Int(42));
        assert_eq!(
            decode_text_value(&col(FieldType::LongLong), b"-9"),
            Value::BigInt(-9)
        );
        let unsigned = col(FieldType::LongLong).with_flags(column_flags::UNSIGNED);
        assert_eq!(
            decode_text_value(&unsigned, b"18446744073709551615"),
            Value::UnsignedBigInt(u64::MAX)
        );
        let unsigned_tiny = col(FieldType::Tiny).with_flags(column_flags::UNSIGNED);
        assert_eq!(decode_text_value(&unsigned_tiny, b"200"), Value::SmallInt(200));
    }

    #[test]
    fn test_decode_text_misc() {
        assert_eq!(
            decode_text_value(&col(FieldType::NewDecimal), b"1.50"),
            Value::Decimal("1.50".to_string())
        );
        assert_eq!(
            decode_text_value(&col(FieldType::VarString), b"hello"),
            Value::Text("hello".to_string())
        );
        assert_eq!(
            decode_text_value(&col(FieldType::Blob), &[0, 1]),
            Value::Bytes(vec![0, 1])
        );
        assert_eq!(
            decode_text_value(&col(FieldType::Double), b"2.5"),
            Value::Double(2.5)
        );
    }

    #[test]
    fn test_decode_binary_integers() {
        assert_eq!(
            decode_binary_value(&col(FieldType::Tiny), 0, &[0xFF]).unwrap(),
            Value::TinyInt(-1)
        );
        let unsigned = col(FieldType::Tiny).with_flags(column_flags::UNSIGNED);
        assert_eq!(
            decode_binary_value(&unsigned, 0, &[0xFF]).unwrap(),
            Value::SmallInt(255)
        );
        assert_eq!(
            decode_binary_value(&col(FieldType::Long), 0, &42_i32.to_le_bytes()).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn test_decode_binary_short_data() {
        let err = decode_binary_value(&col(FieldType::LongLong), 4, &[1, 2]).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::Malformed));
        match err {
            Error::Decode(e) => assert_eq!(e.column, Some(4)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_binary_unknown_type() {
        let mut def = col(FieldType::Long);
        def.type_id = 0x42;
        let err = decode_binary_value(&def, 1, &[0]).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::UnknownColumnWidth));
    }

    #[test]
    fn test_decode_binary_temporal() {
        let date = [0xE8, 0x07, 3, 9];
        assert_eq!(
            decode_binary_value(&col(FieldType::Date), 0, &date).unwrap(),
            Value::Text("2024-03-09".to_string())
        );
        let datetime = [0xE8, 0x07, 3, 9, 13, 5, 7, 0x20, 0xA1, 0x07, 0x00];
        assert_eq!(
            decode_binary_value(&col(FieldType::DateTime), 0, &datetime).unwrap(),
            Value::Text("2024-03-09 13:05:07.500000".to_string())
        );
        let time = [1, 1, 0, 0, 0, 2, 3, 4];
        assert_eq!(
            decode_binary_value(&col(FieldType::Time), 0, &time).unwrap(),
            Value::Text("-26:03:04".to_string())
        );
    }

    #[test]
    fn test_decode_binary_time_day_overflow() {
        let time = [0, 0xFF, 0xFF, 0xFF, 0xFF, 23, 0, 0];
        let err = decode_binary_value(&col(FieldType::Time), 2, &time).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::Malformed));
        match err {
            Error::Decode(e) => assert_eq!(e.column, Some(2)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parameter_encoding() {
        let mut writer = PacketWriter::new();
        encode_binary_value(&mut writer, &Value::Int(7));
        encode_binary_value(&mut writer, &Value::Text("ab".to_string()));
        assert_eq!(writer.as_bytes(), &[7, 0, 0, 0, 2, b'a', b'b']);
        assert_eq!(
            parameter_type(&Value::UnsignedBigInt(1)),
            (FieldType::LongLong, true)
        );
    }
}
