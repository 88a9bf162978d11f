//! Frame payload reading utilities.
//!
//! Readers never fail loudly: every accessor returns `None` when the payload
//! is too short, and callers turn that into the error that fits their layer.

use crate::protocol::{EofPacket, ErrPacket, OkPacket, server_status};

/// Marker for a NULL column in text rows.
pub const LENENC_NULL: u8 = 0xFB;

/// A cursor over one frame payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.read_array()?;
        Some(u32::from(a) | (u32::from(b) << 8) | (u32::from(c) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Length-encoded integer: values up to 250 sit in the first byte,
    /// `0xFC`, `0xFD` and `0xFE` prefix 2, 3 and 8 byte values. `0xFB` (text
    /// NULL) and `0xFF` are not integers.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_string(len)
    }

    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a null-terminated string. A missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        Some(s)
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Everything after the current offset.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Advance `n` bytes; false when fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// OK payload: affected rows and last insert id (both length-encoded),
    /// status and warnings (u16 each), then an optional info string and, with
    /// `SERVER_SESSION_STATE_CHANGED`, the session-state block.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = if self.is_empty() {
            String::new()
        } else {
            self.read_lenenc_string()?
        };
        let session_state = if status_flags & server_status::SERVER_SESSION_STATE_CHANGED != 0
            && !self.is_empty()
        {
            Some(self.read_lenenc_bytes()?.to_vec())
        } else {
            None
        };

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state,
        })
    }

    /// Error payload: code u16, then `#` and a 5 byte SQL state when the
    /// server sends one, then the message.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        let error_code = self.read_u16_le()?;

        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };

        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF payload: warnings u16, status u16.
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

/// Total encoded size of a length-encoded integer given its first byte.
///
/// Returns `None` for the NULL marker and the reserved 0xFF byte.
pub fn lenenc_int_width(first: u8) -> Option<usize> {
    match first {
        0x00..=0xFA => Some(1),
        0xFC => Some(3),
        0xFD => Some(4),
        0xFE => Some(9),
        0xFB | 0xFF => None,
    }
}
