//! Lazy row decoding.
//!
//! A [`RowDecoder`] owns one row frame's payload and decodes a column only
//! when it is asked for. Reaching column `k` means stepping over columns
//! `0..k` using the column metadata, so the decoder remembers where the last
//! located column started and resumes from there on in-order access.
//!
//! Rows produced by a streaming source share the source's [`RowArena`]. When
//! the arena is refilled with the next frame every row handed out before is
//! stale and any access fails with [`DecodeErrorKind::StaleRow`].

use std::cell::Cell;
use std::collections::HashMap;
use std::mem;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlwire_core::{DecodeError, DecodeErrorKind, Error, FromValue, Result, Value};

use crate::protocol::PacketWriter;
use crate::protocol::reader::lenenc_int_width;
use crate::types::{
    BinaryWidth, ColumnDefinition, decode_binary_value, decode_text_value, encode_binary_value,
};

/// Text rows mark a NULL column with this byte in place of a length.
pub const NULL_MARKER: u8 = 0xFB;

/// Binary rows reserve the first two bits of the null bitmap.
const BITMAP_OFFSET: usize = 2;

/// Null bitmap length of a binary row with `columns` columns.
pub const fn binary_bitmap_len(columns: usize) -> usize {
    (columns + 7 + BITMAP_OFFSET) / 8
}

/// Column metadata shared by every row of a result.
#[derive(Debug, Clone, Default)]
pub struct ColumnDefinitions {
    columns: Arc<[ColumnDefinition]>,
    name_to_index: Arc<HashMap<String, usize>>,
}

impl ColumnDefinitions {
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        let mut name_to_index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            // First occurrence wins for duplicated labels.
            name_to_index.entry(column.name.clone()).or_insert(i);
        }
        Self {
            columns: columns.into(),
            name_to_index: Arc::new(name_to_index),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ColumnDefinition> {
        self.columns.get(index)
    }

    /// Index of the column labelled `name`.
    ///
    /// An exact match is preferred; otherwise the first ASCII
    /// case-insensitive match is returned.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied().or_else(|| {
            self.columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColumnDefinition> {
        self.columns.iter()
    }

    /// Column labels in order.
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

impl From<Vec<ColumnDefinition>> for ColumnDefinitions {
    fn from(columns: Vec<ColumnDefinition>) -> Self {
        Self::new(columns)
    }
}

impl PartialEq for ColumnDefinitions {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

impl<'a> IntoIterator for &'a ColumnDefinitions {
    type Item = &'a ColumnDefinition;
    type IntoIter = std::slice::Iter<'a, ColumnDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}

/// Wire encoding of a row frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// Every column is a length-encoded string, NULL is [`NULL_MARKER`]
    Text,
    /// Null bitmap followed by the type-specific encoding of present columns
    Binary,
}

#[derive(Debug, Clone)]
struct Generation {
    tag: u64,
    current: Arc<AtomicU64>,
}

/// Where a column's encoding ends and, if it is not NULL, where its value is.
#[derive(Debug, Clone)]
struct Extent {
    value: Option<Range<usize>>,
    end: usize,
}

/// One row, decoded on demand.
///
/// Access is idempotent: any order of `get_*` calls returns the same values
/// as a fresh decoder would.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    columns: ColumnDefinitions,
    format: RowFormat,
    bytes: Arc<Vec<u8>>,
    generation: Option<Generation>,
    /// (column, offset) of the most recently located column
    cursor: Cell<Option<(usize, usize)>>,
}

impl RowDecoder {
    /// Wrap an owned row payload.
    pub fn new(columns: ColumnDefinitions, format: RowFormat, bytes: Vec<u8>) -> Self {
        Self {
            columns,
            format,
            bytes: Arc::new(bytes),
            generation: None,
            cursor: Cell::new(None),
        }
    }

    pub fn text(columns: ColumnDefinitions, bytes: Vec<u8>) -> Self {
        Self::new(columns, RowFormat::Text, bytes)
    }

    pub fn binary(columns: ColumnDefinitions, bytes: Vec<u8>) -> Self {
        Self::new(columns, RowFormat::Binary, bytes)
    }

    pub fn columns(&self) -> &ColumnDefinitions {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }

    /// The raw row payload.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.check_live()?;
        Ok(&self.bytes)
    }

    /// Has the arena this row came from moved on to a newer frame?
    pub fn is_stale(&self) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|g| g.current.load(Ordering::Acquire) != g.tag)
    }

    /// The undecoded bytes of column `index`, or `None` for NULL.
    pub fn get_bytes(&self, index: usize) -> Result<Option<&[u8]>> {
        let (_, extent) = self.locate(index)?;
        Ok(extent.value.and_then(|range| self.bytes.get(range)))
    }

    pub fn is_null(&self, index: usize) -> Result<bool> {
        match self.format {
            RowFormat::Binary => {
                self.check_live()?;
                self.check_index(index)?;
                self.null_bit(index)
            }
            RowFormat::Text => Ok(self.locate(index)?.1.value.is_none()),
        }
    }

    /// Decode column `index` into a [`Value`] according to its metadata.
    pub fn get_raw_value(&self, index: usize) -> Result<Value> {
        let Some(data) = self.get_bytes(index)? else {
            return Ok(Value::Null);
        };
        let column = self.column(index)?;
        match self.format {
            RowFormat::Text => Ok(decode_text_value(column, data)),
            RowFormat::Binary => decode_binary_value(column, index, data),
        }
    }

    /// Decode column `index` and convert it to `T`.
    pub fn get_value<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get_raw_value(index)?;
        T::from_value(&value).map_err(|e| match e {
            Error::Decode(d) if d.column.is_none() => Error::Decode(d.at_column(index)),
            other => other,
        })
    }

    /// Decode the column labelled `name` and convert it to `T`.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self.column_index(name).ok_or_else(|| {
            Error::Decode(DecodeError::new(
                DecodeErrorKind::ColumnOutOfRange,
                format!("no column named '{name}'"),
            ))
        })?;
        self.get_value(index)
    }

    /// Decode every column.
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.column_count())
            .map(|i| self.get_raw_value(i))
            .collect()
    }

    /// Replace the encoded bytes of column `index`, `None` meaning NULL.
    ///
    /// Later columns move to make room. The payload is copied first if it is
    /// shared with other rows or an arena, after which this row no longer
    /// goes stale when the arena is refilled.
    pub fn set_bytes(&mut self, index: usize, value: Option<&[u8]>) -> Result<()> {
        let (offset, extent) = self.locate(index)?;

        let mut encoded = PacketWriter::new();
        match (self.format, value) {
            (RowFormat::Text, None) => encoded.write_u8(NULL_MARKER),
            (RowFormat::Text, Some(data)) => encoded.write_lenenc_bytes(data),
            (RowFormat::Binary, None) => {}
            (RowFormat::Binary, Some(data)) => match self.binary_width(index)? {
                BinaryWidth::Fixed(width) if data.len() != width => {
                    return Err(malformed(
                        index,
                        format!("column is {width} bytes wide, got {}", data.len()),
                    ));
                }
                BinaryWidth::Fixed(_) => encoded.write_bytes(data),
                BinaryWidth::LengthPrefixed => encoded.write_lenenc_bytes(data),
            },
        }

        let bytes = Arc::make_mut(&mut self.bytes);
        bytes.splice(offset..extent.end, encoded.into_bytes());
        if self.format == RowFormat::Binary {
            let bit = index + BITMAP_OFFSET;
            let mask = 1u8 << (bit % 8);
            if let Some(byte) = bytes.get_mut(bit / 8) {
                if value.is_none() {
                    *byte |= mask;
                } else {
                    *byte &= !mask;
                }
            }
        }
        self.generation = None;
        self.cursor.set(Some((index, offset)));
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        if self.is_stale() {
            return Err(Error::Decode(DecodeError::new(
                DecodeErrorKind::StaleRow,
                "row was invalidated by a later fetch",
            )));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.columns.len() {
            return Err(Error::Decode(
                DecodeError::new(
                    DecodeErrorKind::ColumnOutOfRange,
                    format!("row has {} columns", self.columns.len()),
                )
                .at_column(index),
            ));
        }
        Ok(())
    }

    fn column(&self, index: usize) -> Result<&ColumnDefinition> {
        self.check_index(index)?;
        self.columns
            .get(index)
            .ok_or_else(|| malformed(index, "missing column definition"))
    }

    fn home_offset(&self) -> usize {
        match self.format {
            RowFormat::Text => 0,
            RowFormat::Binary => binary_bitmap_len(self.columns.len()),
        }
    }

    fn null_bit(&self, index: usize) -> Result<bool> {
        let bit = index + BITMAP_OFFSET;
        let byte = self
            .bytes
            .get(bit / 8)
            .ok_or_else(|| malformed(index, "row is shorter than its null bitmap"))?;
        Ok(byte & (1 << (bit % 8)) != 0)
    }

    fn binary_width(&self, index: usize) -> Result<BinaryWidth> {
        let column = self.column(index)?;
        column.field_type().map(|ft| ft.binary_width()).ok_or_else(|| {
            Error::Decode(
                DecodeError::new(
                    DecodeErrorKind::UnknownColumnWidth,
                    format!("column type 0x{:02X} has no binary layout", column.type_id),
                )
                .at_column(index),
            )
        })
    }

    /// Find column `index`, resuming from the cached column when it is not
    /// past the target. Returns the column's start offset and extent.
    fn locate(&self, index: usize) -> Result<(usize, Extent)> {
        self.check_live()?;
        self.check_index(index)?;

        let (mut column, mut offset) = match self.cursor.get() {
            Some((cached, cached_offset)) if cached <= index => (cached, cached_offset),
            _ => (0, self.home_offset()),
        };
        while column < index {
            offset = self.extent(column, offset)?.end;
            column += 1;
        }
        let extent = self.extent(index, offset)?;
        self.cursor.set(Some((index, offset)));
        Ok((offset, extent))
    }

    fn extent(&self, index: usize, offset: usize) -> Result<Extent> {
        match self.format {
            RowFormat::Text => {
                let first = *self
                    .bytes
                    .get(offset)
                    .ok_or_else(|| malformed(index, "row ends before column"))?;
                if first == NULL_MARKER {
                    return Ok(Extent {
                        value: None,
                        end: offset + 1,
                    });
                }
                self.length_prefixed(index, offset)
            }
            RowFormat::Binary => {
                if self.null_bit(index)? {
                    return Ok(Extent {
                        value: None,
                        end: offset,
                    });
                }
                match self.binary_width(index)? {
                    BinaryWidth::Fixed(width) => {
                        let end = self.checked_end(index, offset, width)?;
                        Ok(Extent {
                            value: Some(offset..end),
                            end,
                        })
                    }
                    BinaryWidth::LengthPrefixed => self.length_prefixed(index, offset),
                }
            }
        }
    }

    fn length_prefixed(&self, index: usize, offset: usize) -> Result<Extent> {
        let first = *self
            .bytes
            .get(offset)
            .ok_or_else(|| malformed(index, "row ends before column"))?;
        let prefix = lenenc_int_width(first)
            .ok_or_else(|| malformed(index, format!("invalid length prefix 0x{first:02X}")))?;
        let prefix_end = self.checked_end(index, offset, prefix)?;
        let len = match prefix {
            1 => u64::from(first),
            _ => {
                let mut raw = [0u8; 8];
                raw[..prefix - 1].copy_from_slice(&self.bytes[offset + 1..prefix_end]);
                u64::from_le_bytes(raw)
            }
        };
        let len = usize::try_from(len)
            .map_err(|_| malformed(index, format!("column length {len} overflows")))?;
        let end = self.checked_end(index, prefix_end, len)?;
        Ok(Extent {
            value: Some(prefix_end..end),
            end,
        })
    }

    fn checked_end(&self, index: usize, start: usize, len: usize) -> Result<usize> {
        start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                malformed(
                    index,
                    format!(
                        "column needs {len} bytes at offset {start}, row has {}",
                        self.bytes.len()
                    ),
                )
            })
    }
}

fn malformed(index: usize, message: impl Into<String>) -> Error {
    Error::Decode(DecodeError::new(DecodeErrorKind::Malformed, message).at_column(index))
}

/// Reusable payload buffer for forward-only streaming.
///
/// Every refill bumps the generation before touching the buffer, so rows
/// handed out earlier observe that they are stale. The allocation is reused
/// when no row still holds it.
#[derive(Debug, Default)]
pub struct RowArena {
    bytes: Arc<Vec<u8>>,
    generation: Arc<AtomicU64>,
}

impl RowArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate all outstanding rows.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Invalidate outstanding rows, then let `fill` write the next payload.
    pub fn refill<T>(&mut self, fill: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        self.invalidate();
        let mut buffer = Arc::try_unwrap(mem::take(&mut self.bytes)).unwrap_or_default();
        buffer.clear();
        let result = fill(&mut buffer);
        self.bytes = Arc::new(buffer);
        result
    }

    /// A row view over the current payload, tagged with the current generation.
    pub fn row(&self, columns: ColumnDefinitions, format: RowFormat) -> RowDecoder {
        RowDecoder {
            columns,
            format,
            bytes: Arc::clone(&self.bytes),
            generation: Some(Generation {
                tag: self.generation(),
                current: Arc::clone(&self.generation),
            }),
            cursor: Cell::new(None),
        }
    }
}

/// Encode a text row payload.
pub fn encode_text_row<'a, I>(values: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
{
    let mut writer = PacketWriter::new();
    for value in values {
        match value {
            Some(data) => writer.write_lenenc_bytes(data),
            None => writer.write_u8(NULL_MARKER),
        }
    }
    writer.into_bytes()
}

/// Encode a binary row payload. Column types must match
/// [`parameter_type`](crate::types::parameter_type) of each value.
pub fn encode_binary_row(values: &[Value]) -> Vec<u8> {
    let mut bitmap = vec![0u8; binary_bitmap_len(values.len())];
    let mut body = PacketWriter::new();
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            let bit = i + BITMAP_OFFSET;
            bitmap[bit / 8] |= 1 << (bit % 8);
        } else {
            encode_binary_value(&mut body, value);
        }
    }
    bitmap.extend_from_slice(body.as_bytes());
    bitmap
}
