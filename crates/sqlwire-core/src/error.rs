//! Error types for sqlwire operations.
//!
//! Every failure the protocol engine can surface is one variant of [`Error`].
//! Variants carry a categorized payload with enough context (handshake stage,
//! plugin name, column index) to be logged without re-deriving state.
//!
//! Whether an error leaves the connection usable is decided by
//! [`Error::poisons_connection`].

use thiserror::Error as ThisError;

/// The primary error type for all sqlwire operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Frame-level failure (truncated, oversized, closed channel)
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// Authentication handshake failure
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
    /// Column data could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// Error reported by the server for a statement
    #[error("server error: {0}")]
    Server(#[from] ServerError),
    /// The server sent a frame the client did not expect
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Connection lifecycle errors (connect, busy, poisoned, closed)
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// Backward or absolute movement on a forward-only row source
    #[error("forward-only result set does not support {operation}")]
    ForwardOnlyViolation {
        /// The navigation operation that was attempted
        operation: &'static str,
    },
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Raw I/O error from the underlying channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout sqlwire.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingErrorKind {
    /// The stream ended in the middle of a frame
    Truncated,
    /// The announced frame length exceeds the configured maximum
    Oversized,
    /// The stream ended cleanly on a frame boundary
    Closed,
    /// A zero length frame (no type tag) was announced
    Empty,
}

#[derive(Debug, ThisError)]
#[error("{kind:?}: {message}")]
pub struct FramingError {
    pub kind: FramingErrorKind,
    pub message: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl FramingError {
    pub fn new(kind: FramingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// The server declined the credentials
    Rejected,
    /// SSL was required but the server does not offer it
    SslUnavailable,
    /// A plugin that sends secrets in clear text was used without TLS
    ConfidentialityRequired,
    /// The plugin exchange exceeded the configured round bound
    TooManyRounds,
    /// A capability the client requires is missing on the server
    UnsupportedCapability,
    /// No plugin is registered (or enabled) for the requested name
    UnknownPlugin,
    /// RSA exchange needs a public key but none is available
    PublicKeyUnavailable,
    /// Hashing or encryption of credential material failed
    Crypto,
}

#[derive(Debug, ThisError)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
    /// Protocol name of the plugin active when the error occurred
    pub plugin: Option<String>,
    /// Handshake stage at the time of failure
    pub stage: Option<&'static str>,
    /// Server error code for `Rejected`
    pub server_code: Option<u16>,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            plugin: None,
            stage: None,
            server_code: None,
        }
    }

    /// Attach the active plugin name.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Attach the handshake stage.
    pub fn at_stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(plugin) = &self.plugin {
            write!(f, " (plugin {plugin})")?;
        }
        if let Some(stage) = self.stage {
            write!(f, " [stage {stage}]")?;
        }
        if let Some(code) = self.server_code {
            write!(f, " [server code {code}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The column type id has no defined binary width
    UnknownColumnWidth,
    /// The row payload is shorter or shaped differently than the metadata says
    Malformed,
    /// The column value cannot be converted to the requested Rust type
    Conversion,
    /// Column index beyond the column definition set
    ColumnOutOfRange,
    /// The row buffer was refilled with a newer frame
    StaleRow,
}

#[derive(Debug, ThisError)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
    /// Zero-based column index, when the failure is column specific
    pub column: Option<usize>,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            column: None,
        }
    }

    /// Attach the column index.
    pub fn at_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(column) => write!(f, "{:?} in column {}: {}", self.kind, column, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Error reported by the server in an error frame.
#[derive(Debug, Clone, ThisError)]
pub struct ServerError {
    pub code: u16,
    /// Five character SQL state, empty when the server omitted it
    pub sql_state: String,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{} ({})", self.message, self.code)
        } else {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, self.sql_state)
        }
    }
}

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct ProtocolError {
    pub message: String,
    /// The offending frame tag, if any
    pub tag: Option<u8>,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tag: None,
        }
    }

    pub fn unexpected_tag(tag: u8, context: &str) -> Self {
        Self {
            message: format!("unexpected frame tag 0x{tag:02X} while {context}"),
            tag: Some(tag),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the transport
    Connect,
    /// The peer went away during an operation
    Disconnected,
    /// TLS negotiation failed
    Ssl,
    /// A streaming result still occupies the connection
    Busy,
    /// An earlier fatal error left the channel unusable
    Poisoned,
    /// The session was closed by the caller
    Closed,
}

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct ConfigError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Does this error leave the connection unusable?
    ///
    /// Framing, authentication, protocol and I/O failures desynchronize the
    /// channel. Server-reported errors, decode failures and API misuse leave
    /// it frame-aligned.
    pub fn poisons_connection(&self) -> bool {
        match self {
            Error::Framing(_) | Error::Auth(_) | Error::Protocol(_) | Error::Io(_) => true,
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Ssl
            ),
            Error::Decode(_)
            | Error::Server(_)
            | Error::ForwardOnlyViolation { .. }
            | Error::Config(_) => false,
        }
    }

    /// Server error code, if this error came from an error frame.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            Error::Auth(e) => e.server_code,
            _ => None,
        }
    }

    /// SQL state, if this error came from an error frame.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) if !e.sql_state.is_empty() => Some(&e.sql_state),
            _ => None,
        }
    }

    pub fn auth_kind(&self) -> Option<AuthErrorKind> {
        match self {
            Error::Auth(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn decode_kind(&self) -> Option<DecodeErrorKind> {
        match self {
            Error::Decode(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn framing_kind(&self) -> Option<FramingErrorKind> {
        match self {
            Error::Framing(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a forward-only navigation violation?
    pub fn is_forward_only_violation(&self) -> bool {
        matches!(self, Error::ForwardOnlyViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisoning_classification() {
        let framing = Error::from(FramingError::new(FramingErrorKind::Truncated, "eof"));
        assert!(framing.poisons_connection());

        let auth = Error::from(AuthError::new(AuthErrorKind::Rejected, "denied"));
        assert!(auth.poisons_connection());

        let server = Error::from(ServerError {
            code: 1064,
            sql_state: "42000".to_string(),
            message: "syntax".to_string(),
        });
        assert!(!server.poisons_connection());
        assert_eq!(server.server_code(), Some(1064));
        assert_eq!(server.sql_state(), Some("42000"));

        let busy = Error::from(ConnectionError::new(ConnectionErrorKind::Busy, "streaming"));
        assert!(!busy.poisons_connection());

        let decode = Error::from(DecodeError::new(DecodeErrorKind::Malformed, "short row"));
        assert!(!decode.poisons_connection());
    }

    #[test]
    fn test_auth_error_display_carries_context() {
        let err = AuthError::new(AuthErrorKind::TooManyRounds, "exceeded 100 rounds")
            .with_plugin("caching_sha2_password")
            .at_stage("AwaitingMoreData");
        let text = err.to_string();
        assert!(text.contains("TooManyRounds"));
        assert!(text.contains("caching_sha2_password"));
        assert!(text.contains("AwaitingMoreData"));
    }

    #[test]
    fn test_decode_error_display_carries_column() {
        let err = DecodeError::new(DecodeErrorKind::UnknownColumnWidth, "type 0x42").at_column(3);
        assert_eq!(err.column, Some(3));
        assert!(err.to_string().contains("column 3"));
    }

    #[test]
    fn test_forward_only_violation() {
        let err = Error::ForwardOnlyViolation {
            operation: "before_first",
        };
        assert!(err.is_forward_only_violation());
        assert!(!err.poisons_connection());
        assert!(err.to_string().contains("before_first"));
    }
}
