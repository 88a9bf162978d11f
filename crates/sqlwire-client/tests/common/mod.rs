//! Scripted server traffic for the integration tests.
//!
//! A [`ScriptedTransport`] replays pre-encoded server frames and records
//! everything the client writes, so a whole session can be driven through
//! the public API without a live server.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use sqlwire_client::handshake::{PROTOCOL_VERSION, ServerHandshake};
use sqlwire_client::protocol::{PacketWriter, capabilities, tag};
use sqlwire_client::row::encode_text_row;
use sqlwire_client::{
    ClientConfig, ColumnDefinition, Frame, Session, SslMode, TlsConfig, Transport,
};
use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, Result};

/// Seed carried by every scripted challenge.
pub const SEED: [u8; 20] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x08, 0x19, 0x2a, 0x3b, 0x4c, 0x5d, 0x6e, 0x7f,
    0x01, 0x12, 0x23, 0x34, 0x45,
];

/// What the scripted server offers unless a test says otherwise.
pub const SERVER_CAPS: u32 = capabilities::BASE_CLIENT_FLAGS
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_MULTI_STATEMENTS;

pub const CONNECTION_ID: u32 = 42;

/// Bytes written by the client, shared with the test after the transport
/// moved into a session.
#[derive(Debug, Clone, Default)]
pub struct Written(Arc<Mutex<Vec<u8>>>);

impl Written {
    /// Every frame the client wrote, in order.
    pub fn frames(&self) -> Vec<Frame> {
        let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut frames = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let (frame, tail) = Frame::decode(rest).unwrap();
            frames.push(frame);
            rest = tail;
        }
        frames
    }

    pub fn tags(&self) -> Vec<u8> {
        self.frames().iter().map(|f| f.tag).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// In-memory channel replaying scripted server frames.
#[derive(Debug)]
pub struct ScriptedTransport {
    input: io::Cursor<Vec<u8>>,
    written: Written,
    secure: bool,
    tls_available: bool,
}

impl ScriptedTransport {
    pub fn new(frames: &[Frame]) -> (Self, Written) {
        let written = Written::default();
        let transport = Self {
            input: io::Cursor::new(frames.iter().flat_map(Frame::encode).collect()),
            written: written.clone(),
            secure: false,
            tls_available: false,
        };
        (transport, written)
    }

    /// Accept a TLS upgrade and report the channel as encrypted afterwards.
    pub fn with_tls(mut self) -> Self {
        self.tls_available = true;
        self
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn is_secure(&self) -> bool {
        self.secure
    }

    fn upgrade_tls(
        self: Box<Self>,
        _server_name: &str,
        _tls_config: &TlsConfig,
        _ssl_mode: SslMode,
    ) -> Result<Box<dyn Transport>> {
        if !self.tls_available {
            return Err(Error::Connection(ConnectionError::new(
                ConnectionErrorKind::Ssl,
                "scripted channel has no TLS",
            )));
        }
        let mut upgraded = *self;
        upgraded.secure = true;
        Ok(Box::new(upgraded))
    }
}

/// Configuration used by the scripted sessions.
pub fn config() -> ClientConfig {
    ClientConfig::new()
        .user("app")
        .password("secret")
        .ssl_mode(SslMode::Disable)
        .fetch_size(2)
}

/// A session that completed a native password handshake, followed by
/// `frames` as the server's later traffic.
pub fn established(frames: &[Frame]) -> (Session, Written) {
    let mut script = vec![challenge("mysql_native_password", SERVER_CAPS), ok_frame(2)];
    script.extend_from_slice(frames);
    let (transport, written) = ScriptedTransport::new(&script);
    let session = Session::handshake(Box::new(transport), config()).unwrap();
    (session, written)
}

/// Frames the client wrote after the handshake response.
pub fn commands(written: &Written) -> Vec<Frame> {
    written.frames().into_iter().skip(1).collect()
}

pub fn challenge(plugin: &str, server_capabilities: u32) -> Frame {
    let handshake = ServerHandshake {
        protocol_version: PROTOCOL_VERSION,
        server_version: "8.0.36-log".to_string(),
        connection_id: CONNECTION_ID,
        capabilities: server_capabilities,
        charset: 255,
        status_flags: 2,
        auth_plugin: plugin.to_string(),
        seed: SEED.to_vec(),
    };
    Frame::new(tag::HANDSHAKE, handshake.encode())
}

pub fn ok_frame(status_flags: u16) -> Frame {
    ok_with(0, status_flags)
}

pub fn ok_with(affected_rows: u64, status_flags: u16) -> Frame {
    let mut w = PacketWriter::new();
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(0);
    w.write_u16_le(status_flags);
    w.write_u16_le(0);
    Frame::new(tag::OK, w.into_bytes())
}

pub fn err_frame(code: u16, message: &str) -> Frame {
    let mut w = PacketWriter::new();
    w.write_u16_le(code);
    w.write_bytes(b"#28000");
    w.write_bytes(message.as_bytes());
    Frame::new(tag::ERR, w.into_bytes())
}

pub fn more_data(data: &[u8]) -> Frame {
    Frame::new(tag::AUTH_MORE_DATA, data)
}

pub fn auth_switch(plugin: &str, seed: &[u8]) -> Frame {
    let mut w = PacketWriter::new();
    w.write_null_string(plugin);
    w.write_bytes(seed);
    w.write_u8(0);
    Frame::new(tag::AUTH_SWITCH, w.into_bytes())
}

/// Header and column definitions of a result set. The session agrees on
/// dropping the separate EOF frame, so none follows the block.
pub fn result_header(columns: &[ColumnDefinition]) -> Vec<Frame> {
    let mut w = PacketWriter::new();
    w.write_lenenc_int(columns.len() as u64);
    let mut frames = vec![Frame::new(tag::RESULTSET_HEADER, w.into_bytes())];
    frames.extend(
        columns
            .iter()
            .map(|c| Frame::new(tag::COLUMN_DEFINITION, c.encode())),
    );
    frames
}

pub fn text_row(values: &[Option<&str>]) -> Frame {
    Frame::new(
        tag::TEXT_ROW,
        encode_text_row(values.iter().map(|v| v.map(str::as_bytes))),
    )
}

/// A complete text result set closed by an OK status frame.
pub fn text_result(
    columns: &[ColumnDefinition],
    rows: &[&[Option<&str>]],
    status_flags: u16,
) -> Vec<Frame> {
    let mut frames = result_header(columns);
    frames.extend(rows.iter().map(|row| text_row(row)));
    frames.push(ok_frame(status_flags));
    frames
}

/// Offsets of the client auth response inside a `HANDSHAKE_RESPONSE`.
///
/// Returns `(user, auth_response, plugin)`, assuming length-encoded auth
/// data shorter than 251 bytes.
pub fn parse_handshake_response(payload: &[u8]) -> (String, Vec<u8>, String) {
    let flags = u32::from_le_bytes(payload[..4].try_into().unwrap());
    let mut rest = &payload[32..];
    let user_end = rest.iter().position(|&b| b == 0).unwrap();
    let user = String::from_utf8(rest[..user_end].to_vec()).unwrap();
    rest = &rest[user_end + 1..];
    let len = usize::from(rest[0]);
    let auth = rest[1..=len].to_vec();
    rest = &rest[len + 1..];
    if flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        let db_end = rest.iter().position(|&b| b == 0).unwrap();
        rest = &rest[db_end + 1..];
    }
    let plugin_end = rest.iter().position(|&b| b == 0).unwrap();
    let plugin = String::from_utf8(rest[..plugin_end].to_vec()).unwrap();
    (user, auth, plugin)
}
