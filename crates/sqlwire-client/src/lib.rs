//! Protocol engine for sqlwire database servers.
//!
//! This crate speaks the sqlwire wire protocol over any blocking byte
//! channel. It provides:
//!
//! - Length-prefixed framing
//! - The authentication handshake, with pluggable auth mechanisms
//!   (native hash, clear text, RSA challenge, cached RSA) and TLS upgrade
//! - Text and binary statement protocols, prepared statements
//! - Lazy row decoding with buffered, cursor and streaming row sources
//!
//! # Protocol Overview
//!
//! Every frame is a 4-byte little-endian length, a 1-byte type tag and the
//! payload. The length covers the tag byte. A connection first completes the
//! handshake; afterwards each command frame is answered by status frames
//! (OK, EOF, ERR) or by a result set.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_client::{ClientConfig, RowSource, Session};
//!
//! let config = ClientConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("app")
//!     .password("secret")
//!     .database("shop");
//!
//! let session = Session::connect(config)?;
//! let mut rows = session.query("SELECT id, name FROM items")?;
//! while let Some(row) = rows.next_row()? {
//!     let id: i64 = row.get_value(0)?;
//!     let name: Option<String> = row.get_value(1)?;
//! }
//! ```
//!
//! # Features
//!
//! - `tls`: TLS upgrade through rustls. Without it, a configuration that
//!   requires SSL fails when the server offers it.

pub mod auth;
pub mod config;
pub mod framer;
pub mod handshake;
pub mod protocol;
pub mod resultset;
pub mod row;
pub mod session;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthExchange, AuthPlugin, BuiltinPlugin, PluginFactory, PluginRegistry};
pub use config::{ClientConfig, SslMode, TlsConfig};
pub use framer::{Frame, Framer};
pub use handshake::{HandshakeStage, ServerVersion, SessionCapabilities};
pub use protocol::{Command, OkPacket, PreparedStatement, StreamEnd};
pub use resultset::{BufferedRows, CursorRows, RowSource, Rows, StreamingRows};
pub use row::{ColumnDefinitions, RowArena, RowDecoder, RowFormat};
pub use session::Session;
pub use transport::Transport;
pub use types::{ColumnDefinition, FieldType};

pub use sqlwire_core::{Error, FromValue, Result, Value};
