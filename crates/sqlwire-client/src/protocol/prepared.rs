//! Prepared statement (binary protocol) payloads.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: `StmtPrepare` frame carrying the SQL text
//!    - `PREPARE_OK` with statement id, column count, parameter count
//!    - parameter column definitions, then result column definitions
//! 2. **Execute**: `StmtExecute` with the statement id, cursor flag and
//!    binary parameters; answered by a result set or OK
//! 3. **Fetch**: `StmtFetch` pulls the next batch from an open cursor
//! 4. **Close**: `StmtClose`, no server response

use super::{PacketReader, PacketWriter};
use crate::row::ColumnDefinitions;
use crate::types::{ColumnDefinition, encode_binary_value, parameter_type};
use sqlwire_core::Value;

/// Cursor flag values for `StmtExecute`.
pub mod cursor_type {
    pub const NO_CURSOR: u8 = 0x00;
    pub const READ_ONLY: u8 = 0x01;
}

/// Header of a `PREPARE_OK` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Unique statement identifier (used in execute/close)
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    pub warnings: u16,
}

/// A server-side prepared statement and its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned statement ID
    pub statement_id: u32,
    pub sql: String,
    /// Parameter column definitions
    pub params: Vec<ColumnDefinition>,
    /// Result column definitions
    pub columns: ColumnDefinitions,
}

impl PreparedStatement {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Parse a `PREPARE_OK` payload.
///
/// Layout: statement id u32, columns u16, params u16, reserved u8,
/// warnings u16 (optional).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Build a `StmtExecute` payload.
///
/// Layout:
/// - statement id u32
/// - cursor flag u8
/// - iteration count u32 (always 1)
/// - when there are parameters: NULL bitmap `(n + 7) / 8` bytes,
///   new-params-bound flag (1), type pairs (type, 0x80 if unsigned), values
pub fn build_stmt_execute_payload(statement_id: u32, params: &[Value], cursor: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);
    writer.write_u32_le(statement_id);
    writer.write_u8(cursor);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);
        writer.write_u8(1);

        for param in params {
            let (field_type, unsigned) = parameter_type(param);
            writer.write_u8(field_type as u8);
            writer.write_u8(if unsigned { 0x80 } else { 0x00 });
        }
        for param in params.iter().filter(|p| !p.is_null()) {
            encode_binary_value(&mut writer, param);
        }
    }

    writer.into_bytes()
}

/// Build a `StmtFetch` payload: statement id u32, row count u32.
pub fn build_stmt_fetch_payload(statement_id: u32, rows: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(8);
    writer.write_u32_le(statement_id);
    writer.write_u32_le(rows);
    writer.into_bytes()
}
