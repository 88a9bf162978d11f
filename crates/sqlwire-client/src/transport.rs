//! The raw duplex channel under the framer.
//!
//! A [`Transport`] is any blocking byte stream that can report whether it is
//! encrypted and hand itself over to a TLS upgrade. `TcpStream` is the
//! production implementation; tests drive the engine with in-memory scripts.

use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::config::{SslMode, TlsConfig};
use crate::tls;

/// A byte channel the protocol engine can run over.
pub trait Transport: Read + Write + Send + fmt::Debug {
    /// Is traffic on this channel encrypted?
    fn is_secure(&self) -> bool {
        false
    }

    /// Consume the plain channel and return an encrypted one.
    fn upgrade_tls(
        self: Box<Self>,
        server_name: &str,
        tls_config: &TlsConfig,
        ssl_mode: SslMode,
    ) -> Result<Box<dyn Transport>>;
}

impl Transport for TcpStream {
    fn upgrade_tls(
        self: Box<Self>,
        server_name: &str,
        tls_config: &TlsConfig,
        ssl_mode: SslMode,
    ) -> Result<Box<dyn Transport>> {
        tls::upgrade(*self, server_name, tls_config, ssl_mode)
    }
}

/// Open a TCP channel, trying each resolved address in turn.
pub fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let addrs = addr.to_socket_addrs().map_err(|e| {
        connect_error(format!("failed to resolve '{addr}': {e}"), Box::new(e))
    })?;

    let mut last_error = None;
    for socket_addr in addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(Error::Io)?;
                tracing::debug!(addr = %socket_addr, "TCP connection established");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(addr = %socket_addr, error = %e, "TCP connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => connect_error(format!("failed to connect to {addr}: {e}"), Box::new(e)),
        None => Error::Connection(ConnectionError::new(
            ConnectionErrorKind::Connect,
            format!("'{addr}' did not resolve to any address"),
        )),
    })
}

fn connect_error(message: String, source: Box<dyn std::error::Error + Send + Sync>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: Some(source),
    })
}
