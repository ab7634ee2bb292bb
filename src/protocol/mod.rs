//! Postgres wire protocol messages.
//!
//! Frontend messages are built into the transport's write buffer,
//! backend messages are parsed from zero-copy [`Bytes`][bytes::Bytes]
//! views of the receive buffer.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
pub mod backend;
pub mod frontend;
pub mod sasl;

use std::fmt;

/// An error when translating buffer.
///
/// Receiving malformed framing leaves the session unusable.
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
