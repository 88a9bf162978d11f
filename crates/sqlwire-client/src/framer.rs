//! Length-prefixed frame I/O.
//!
//! Every frame on the wire is:
//!
//! ```text
//! +-------------------+--------+----------------------+
//! | length: u32 (LE)  | tag u8 | payload: length - 1  |
//! +-------------------+--------+----------------------+
//! ```
//!
//! The length counts the tag byte, so the smallest valid frame announces a
//! length of 1. A [`Framer`] never hands out a partial frame: the stream
//! ending mid-frame is [`FramingErrorKind::Truncated`], ending between
//! frames is [`FramingErrorKind::Closed`].

use std::io::{ErrorKind, Read, Write};

use sqlwire_core::{
    ConnectionError, ConnectionErrorKind, Error, FramingError, FramingErrorKind, Result,
};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, tag};
use crate::transport::Transport;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Length field value for this frame.
    pub fn wire_length(&self) -> usize {
        self.payload.len() + 1
    }

    pub fn is_ok(&self) -> bool {
        self.tag == tag::OK
    }

    pub fn is_err(&self) -> bool {
        self.tag == tag::ERR
    }

    /// Serialize header, tag and payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.wire_length());
        out.extend_from_slice(&(self.wire_length() as u32).to_le_bytes());
        out.push(self.tag);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one frame from the front of `bytes`, returning the rest.
    pub fn decode(bytes: &[u8]) -> Result<(Frame, &[u8])> {
        let Some((header, rest)) = bytes.split_first_chunk::<HEADER_LEN>() else {
            return Err(truncated(format!(
                "need {HEADER_LEN} header bytes, have {}",
                bytes.len()
            )));
        };
        let length = u32::from_le_bytes(*header) as usize;
        if length == 0 {
            return Err(FramingError::new(FramingErrorKind::Empty, "zero length frame").into());
        }
        if rest.len() < length {
            return Err(truncated(format!(
                "frame announces {length} bytes, have {}",
                rest.len()
            )));
        }
        let (body, rest) = rest.split_at(length);
        Ok((Frame::new(body[0], &body[1..]), rest))
    }
}

/// Reads and writes frames over a [`Transport`].
#[derive(Debug)]
pub struct Framer {
    transport: Option<Box<dyn Transport>>,
    max_frame_size: usize,
}

impl Framer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_max_frame_size(transport, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(transport: Box<dyn Transport>, max_frame_size: usize) -> Self {
        Self {
            transport: Some(transport),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Is the underlying channel encrypted?
    pub fn is_secure(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_secure())
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or_else(|| {
            Error::Connection(ConnectionError::new(
                ConnectionErrorKind::Disconnected,
                "channel is no longer available",
            ))
        })
    }

    /// Read one complete frame.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut payload = Vec::new();
        let tag = self.read_frame_into(&mut payload)?;
        Ok(Frame { tag, payload })
    }

    /// Read one complete frame into `buf`, returning its tag.
    ///
    /// `buf` is cleared first and keeps its allocation, so a caller can reuse
    /// one buffer for a whole result set.
    pub fn read_frame_into(&mut self, buf: &mut Vec<u8>) -> Result<u8> {
        let max = self.max_frame_size;
        let transport = self.transport()?;

        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match transport.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => {
                    return Err(FramingError::new(
                        FramingErrorKind::Closed,
                        "channel closed on a frame boundary",
                    )
                    .into());
                }
                Ok(0) => {
                    return Err(truncated(format!(
                        "channel closed after {filled} of {HEADER_LEN} header bytes"
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let length = u32::from_le_bytes(header) as usize;
        if length == 0 {
            return Err(FramingError::new(FramingErrorKind::Empty, "zero length frame").into());
        }
        if length > max {
            return Err(FramingError::new(
                FramingErrorKind::Oversized,
                format!("frame of {length} bytes exceeds the {max} byte limit"),
            )
            .into());
        }

        let mut tag = [0u8; 1];
        read_body(transport.as_mut(), &mut tag, length)?;
        buf.clear();
        buf.resize(length - 1, 0);
        read_body(transport.as_mut(), buf, length)?;

        tracing::trace!(tag = tag[0], len = length - 1, "Read frame");
        Ok(tag[0])
    }

    /// Write one frame and flush.
    pub fn write_frame(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let length = payload.len() + 1;
        if length > self.max_frame_size {
            return Err(FramingError::new(
                FramingErrorKind::Oversized,
                format!(
                    "outbound frame of {length} bytes exceeds the {} byte limit",
                    self.max_frame_size
                ),
            )
            .into());
        }

        let mut out = Vec::with_capacity(HEADER_LEN + length);
        out.extend_from_slice(&(length as u32).to_le_bytes());
        out.push(tag);
        out.extend_from_slice(payload);

        let transport = self.transport()?;
        transport.write_all(&out)?;
        transport.flush()?;
        tracing::trace!(tag, len = payload.len(), "Wrote frame");
        Ok(())
    }

    /// Hand the channel to a TLS upgrade and continue on the result.
    ///
    /// A failed upgrade leaves the framer without a channel.
    pub fn upgrade_tls(
        &mut self,
        server_name: &str,
        tls_config: &TlsConfig,
        ssl_mode: SslMode,
    ) -> Result<()> {
        let transport = self.transport.take().ok_or_else(|| {
            Error::Connection(ConnectionError::new(
                ConnectionErrorKind::Disconnected,
                "channel is no longer available",
            ))
        })?;
        self.transport = Some(transport.upgrade_tls(server_name, tls_config, ssl_mode)?);
        Ok(())
    }

    /// Drop the channel; later calls fail with `Disconnected`.
    pub fn shutdown(&mut self) {
        self.transport = None;
    }
}

fn read_body(transport: &mut dyn Transport, buf: &mut [u8], length: usize) -> Result<()> {
    transport.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            let mut err = FramingError::new(
                FramingErrorKind::Truncated,
                format!("channel closed inside a {length} byte frame"),
            );
            err.source = Some(e);
            Error::Framing(err)
        } else {
            Error::Io(e)
        }
    })
}

fn truncated(message: String) -> Error {
    FramingError::new(FramingErrorKind::Truncated, message).into()
}
