//! `pgline` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    connection::{AuthError, config::ParseError},
    protocol::{ProtocolError, backend::ErrorResponse, sasl::SaslError},
    sql::SqlError,
    types::DecodeError,
};

/// A specialized [`Result`] type for `pgline` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgline` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Whether the session is still usable after this error.
    ///
    /// A server-reported error ends with `ReadyForQuery` and leaves the
    /// session recoverable; transport, protocol and authentication
    /// failures do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Database(_) | ErrorKind::Sql(_) | ErrorKind::Usage(_) | ErrorKind::Decode(_)
        )
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kind from `pgline` library.
pub enum ErrorKind {
    /// Malformed connection string.
    Config(ParseError),
    /// Socket failure or unexpected connection close.
    Io(io::Error),
    /// Malformed framing or an unexpected message.
    Protocol(ProtocolError),
    /// Authentication failed or uses an unsupported method.
    Auth(AuthError),
    /// `ErrorResponse` reported by the backend.
    Database(ErrorResponse),
    /// A referenced parameter was not supplied.
    Sql(SqlError),
    /// Operation on a closed connection or empty statement.
    Usage(UsageError),
    /// Column value could not be decoded or cast.
    Decode(DecodeError),
    /// Postgres returned a non UTF-8 string.
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<SaslError>e => ErrorKind::Auth(AuthError::Sasl(e)));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<SqlError>e => ErrorKind::Sql(e));
from!(<UsageError>e => ErrorKind::Usage(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Sql(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Misuse of the client api.
#[derive(Clone, Copy)]
pub enum UsageError {
    /// The connection is not open.
    NotOpen,
    /// The statement text is empty.
    EmptySql,
    /// No row is currently positioned under the reader.
    NoRow,
}

impl std::error::Error for UsageError { }

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => f.write_str("connection is not open"),
            Self::EmptySql => f.write_str("statement text is empty"),
            Self::NoRow => f.write_str("reader is not positioned on a row"),
        }
    }
}

impl fmt::Debug for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
