//! Core types for the sqlwire protocol client.
//!
//! - [`Error`] and its categorized payloads, shared by every layer
//! - [`Value`] for decoded columns and statement parameters
//! - [`FromValue`] for typed column access

pub mod error;
pub mod value;

pub use error::{
    AuthError, AuthErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, DecodeError,
    DecodeErrorKind, Error, FramingError, FramingErrorKind, ProtocolError, Result, ServerError,
};
pub use value::{FromValue, Value};
