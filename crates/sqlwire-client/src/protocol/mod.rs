//! sqlwire protocol constants and status payloads.
//!
//! Every frame on the wire has a 5-byte header:
//! - 4 bytes: length (little-endian), covering the tag byte and the payload
//! - 1 byte: type tag
//!
//! Server frames fall in two families: status frames (OK / EOF / ERR) and
//! data frames (handshake, column metadata, rows, auth data).

pub mod prepared;
pub mod reader;
pub mod writer;

pub use prepared::{
    PreparedStatement, StmtPrepareOk, build_stmt_execute_payload, build_stmt_fetch_payload,
    parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

use sqlwire_core::ServerError;

/// Default upper bound on a single frame's length field (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame type tags.
pub mod tag {
    // Server to client
    pub const OK: u8 = 0x00;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const HANDSHAKE: u8 = 0x0A;
    pub const RESULTSET_HEADER: u8 = 0x40;
    pub const COLUMN_DEFINITION: u8 = 0x41;
    pub const TEXT_ROW: u8 = 0x42;
    pub const BINARY_ROW: u8 = 0x43;
    pub const PREPARE_OK: u8 = 0x44;
    pub const LOCAL_INFILE: u8 = 0xFB;
    /// EOF in a result stream, auth-method-switch during authentication.
    pub const EOF: u8 = 0xFE;
    pub const AUTH_SWITCH: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;

    // Client to server (command codes occupy 0x00..=0x1F)
    pub const SSL_REQUEST: u8 = 0x20;
    pub const HANDSHAKE_RESPONSE: u8 = 0x21;
    pub const AUTH_DATA: u8 = 0x22;
}

/// Capability flags (client and server).
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities the client always asks for.
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;

    /// Names for the bits worth logging.
    pub fn describe(flags: u32) -> Vec<&'static str> {
        const NAMES: &[(u32, &str)] = &[
            (CLIENT_CONNECT_WITH_DB, "connect_with_db"),
            (CLIENT_COMPRESS, "compress"),
            (CLIENT_SSL, "ssl"),
            (CLIENT_SECURE_CONNECTION, "secure_connection"),
            (CLIENT_MULTI_STATEMENTS, "multi_statements"),
            (CLIENT_PLUGIN_AUTH, "plugin_auth"),
            (CLIENT_CONNECT_ATTRS, "connect_attrs"),
            (CLIENT_SESSION_TRACK, "session_track"),
            (CLIENT_DEPRECATE_EOF, "deprecate_eof"),
        ];
        NAMES
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Command codes; each is sent as the type tag of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Statistics
    Statistics = 0x09,
    /// Ping server
    Ping = 0x0e,
    /// Change user
    ChangeUser = 0x11,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement (closes an open cursor)
    StmtReset = 0x1a,
    /// Fetch cursor rows
    StmtFetch = 0x1c,
    /// Reset connection
    ResetConnection = 0x1f,
}

impl Command {
    /// Does the server answer this command?
    pub const fn expects_response(self) -> bool {
        !matches!(self, Command::Quit | Command::StmtClose)
    }
}

/// Server status flags.
pub mod server_status {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Character set codes.
pub mod charset {
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default charset for new connections (utf8mb4).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_0900_AI_CI;
}

/// Parsed OK payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
    /// Raw session-state-change block, present when the server flags it
    pub session_state: Option<Vec<u8>>,
}

impl OkPacket {
    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Parsed error payload.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters, empty when omitted)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl From<ErrPacket> for ServerError {
    fn from(err: ErrPacket) -> Self {
        ServerError {
            code: err.error_code,
            sql_state: err.sql_state,
            message: err.error_message,
        }
    }
}

/// Parsed EOF payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

/// Terminal status of a row stream (EOF or OK, whichever the server used).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamEnd {
    pub warnings: u16,
    pub status_flags: u16,
}

impl StreamEnd {
    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn cursor_exists(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_CURSOR_EXISTS != 0
    }

    pub fn last_row_sent(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_LAST_ROW_SENT != 0
    }
}

impl From<EofPacket> for StreamEnd {
    fn from(eof: EofPacket) -> Self {
        Self {
            warnings: eof.warnings,
            status_flags: eof.status_flags,
        }
    }
}

impl From<&OkPacket> for StreamEnd {
    fn from(ok: &OkPacket) -> Self {
        Self {
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        }
    }
}
