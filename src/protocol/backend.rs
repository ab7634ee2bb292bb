//! Backend message parsing.
//!
//! Messages are decoded from a `(tag, body)` pair, where the body is a
//! zero-copy view into the transport's receive buffer. Large payloads
//! (`RowDescription`, `DataRow`) stay undecoded until walked by their
//! consumer.
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::fmt;

use super::ProtocolError;
use crate::{
    common::ByteStr,
    ext::{BytesExt, FmtExt},
    row::Column,
    types::{Oid, PgFormat},
};

macro_rules! need {
    ($body:ident, $n:expr, $id:literal) => {
        if $body.remaining() < $n {
            return Err(ProtocolError::new(concat!("truncated ", $id, " message")));
        }
    };
}

macro_rules! nul_string {
    ($body:ident, $id:literal) => {
        match $body.get_nul_bytestr() {
            Some(ok) => ok,
            None => {
                return Err(ProtocolError::new(concat!(
                    "missing nul terminated string in ", $id, " message"
                )))
            }
        }
    };
}

/// Postgres backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    ParameterStatus(ParameterStatus),
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    CommandComplete(CommandComplete),
    RowDescription(RowDescription),
    DataRow(DataRow),
    ReadyForQuery(ReadyForQuery),
    ParseComplete,
    BindComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
}

impl BackendMessage {
    pub fn decode(tag: u8, body: Bytes) -> Result<Self, ProtocolError> {
        let message = match tag {
            Authentication::MSGTYPE => Self::Authentication(Authentication::decode(body)?),
            BackendKeyData::MSGTYPE => Self::BackendKeyData(BackendKeyData::decode(body)?),
            ParameterStatus::MSGTYPE => Self::ParameterStatus(ParameterStatus::decode(body)?),
            ErrorResponse::MSGTYPE => Self::ErrorResponse(ErrorResponse::decode(body)?),
            NoticeResponse::MSGTYPE => Self::NoticeResponse(NoticeResponse::decode(body)?),
            CommandComplete::MSGTYPE => Self::CommandComplete(CommandComplete::decode(body)?),
            RowDescription::MSGTYPE => Self::RowDescription(RowDescription::decode(body)?),
            DataRow::MSGTYPE => Self::DataRow(DataRow::decode(body)?),
            ReadyForQuery::MSGTYPE => Self::ReadyForQuery(ReadyForQuery::decode(body)?),
            b'1' => Self::ParseComplete,
            b'2' => Self::BindComplete,
            b'n' => Self::NoData,
            b'I' => Self::EmptyQueryResponse,
            b's' => Self::PortalSuspended,
            tag => {
                return Err(ProtocolError::new(format!(
                    "unsupported backend message {:?}",
                    [tag].lossy(),
                )))
            }
        };
        Ok(message)
    }

    /// The message name, for trace output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData(_) => "BackendKeyData",
            Self::ParameterStatus(_) => "ParameterStatus",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::CommandComplete(_) => "CommandComplete",
            Self::RowDescription(_) => "RowDescription",
            Self::DataRow(_) => "DataRow",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::ParseComplete => "ParseComplete",
            Self::BindComplete => "BindComplete",
            Self::NoData => "NoData",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::PortalSuspended => "PortalSuspended",
        }
    }
}

/// Identifies the message as an authentication request, keyed on the
/// first 4 bytes of the body.
#[derive(Debug)]
pub enum Authentication {
    /// Authentication was successful.
    Ok,
    /// A clear-text password is required.
    CleartextPassword,
    /// An MD5-encrypted password is required, with the salt to use.
    Md5Password { salt: [u8; 4] },
    /// SASL authentication is required; the body lists mechanism names
    /// in the server's order of preference.
    Sasl { mechanisms: Vec<ByteStr> },
    /// A SASL challenge, the body is mechanism specific.
    SaslContinue { data: Bytes },
    /// SASL outcome data, the body is mechanism specific.
    SaslFinal { data: Bytes },
    /// Any other authentication method, unsupported.
    Other(i32),
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 4, "Authentication");
        let auth = match body.get_i32() {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => {
                need!(body, 4, "AuthenticationMD5Password");
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Self::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.first().is_some_and(|b| *b != 0) {
                    mechanisms.push(nul_string!(body, "AuthenticationSASL"));
                }
                Self::Sasl { mechanisms }
            }
            11 => Self::SaslContinue { data: body },
            12 => Self::SaslFinal { data: body },
            method => Self::Other(method),
        };
        Ok(auth)
    }
}

/// Cancellation key data, accepted and discarded during startup.
#[derive(Debug)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 8, "BackendKeyData");
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// A run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: ByteStr,
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: nul_string!(body, "ParameterStatus"),
            value: nul_string!(body, "ParameterStatus"),
        })
    }
}

/// Identifies the message as an error.
///
/// The body is a sequence of `{field code, nul string}` pairs
/// terminated by a zero byte.
pub struct ErrorResponse {
    fields: HashMap<u8, ByteStr>,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { fields: decode_fields(body, "ErrorResponse")? })
    }

    /// The human-readable message, field `'M'`.
    pub fn message(&self) -> &str {
        self.fields.get(&b'M').map(ByteStr::as_str).unwrap_or("Unknown error")
    }

    /// The severity, field `'S'`.
    pub fn severity(&self) -> &str {
        self.fields.get(&b'S').map(ByteStr::as_str).unwrap_or("ERROR")
    }

    /// The SQLSTATE code, field `'C'`.
    pub fn code(&self) -> Option<&str> {
        self.fields.get(&b'C').map(ByteStr::as_str)
    }

    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(ByteStr::as_str)
    }
}

impl std::error::Error for ErrorResponse { }

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(code) = self.code() {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A warning from the backend, same layout as [`ErrorResponse`].
#[derive(Debug)]
pub struct NoticeResponse {
    fields: HashMap<u8, ByteStr>,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';

    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { fields: decode_fields(body, "NoticeResponse")? })
    }

    pub fn message(&self) -> &str {
        self.fields.get(&b'M').map(ByteStr::as_str).unwrap_or("Unknown notice")
    }
}

fn decode_fields(mut body: Bytes, id: &'static str) -> Result<HashMap<u8, ByteStr>, ProtocolError> {
    let mut fields = HashMap::new();
    loop {
        if body.remaining() < 1 {
            return Err(ProtocolError::new(format!("truncated {id} message")));
        }
        let code = body.get_u8();
        if code == 0 {
            break;
        }
        let value = match body.get_nul_bytestr() {
            Some(ok) => ok,
            None => {
                return Err(ProtocolError::new(format!(
                    "missing nul terminated string in {id} message"
                )))
            }
        };
        fields.insert(code, value);
    }
    Ok(fields)
}

/// A command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag, e.g. `INSERT 0 1` or `SELECT 5`.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self { tag: nul_string!(body, "CommandComplete") })
    }

    /// The affected row count: the integer after the last space of the
    /// tag, or 0 when the tag carries no trailing number.
    pub fn rows_affected(&self) -> u64 {
        self.tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// A row description.
///
/// The field walk is deferred to [`columns`][RowDescription::columns],
/// the body stays a zero-copy view until then.
#[derive(Debug)]
pub struct RowDescription {
    body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';

    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 2, "RowDescription");
        Ok(Self { body })
    }

    /// Walk the per-field layout: nul name, table oid (4, skipped),
    /// attribute number (2, skipped), type oid (4), type size (2,
    /// skipped), type modifier (4, skipped), format code (2).
    pub fn columns(&self) -> Result<Vec<Column>, ProtocolError> {
        let mut body = self.body.clone();
        let field_len = body.get_u16();

        let mut columns = Vec::with_capacity(field_len as usize);
        for _ in 0..field_len {
            let name = nul_string!(body, "RowDescription");
            need!(body, 18, "RowDescription");
            body.advance(6);
            let oid: Oid = body.get_u32();
            body.advance(6);
            let format = PgFormat::from_code(body.get_i16())?;
            columns.push(Column::new(name, oid, format));
        }
        Ok(columns)
    }
}

/// One row of data.
///
/// The column walk is deferred to [`ranges`][DataRow::ranges].
#[derive(Debug)]
pub struct DataRow {
    body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 2, "DataRow");
        Ok(Self { body })
    }

    /// The raw message body, the base of every range.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Walk the `{length, bytes}` column layout into `out` as
    /// `(offset, length)` pairs over [`body`][DataRow::body], length
    /// `-1` denoting SQL NULL. The vec is reused across rows.
    pub fn ranges(&self, out: &mut Vec<(usize, i32)>) -> Result<(), ProtocolError> {
        out.clear();
        let mut body = self.body.clone();
        let columns = body.get_u16();
        let mut offset = 2usize;

        for _ in 0..columns {
            need!(body, 4, "DataRow");
            let len = body.get_i32();
            offset += 4;
            if len < 0 {
                out.push((offset, -1));
                continue;
            }
            need!(body, len as usize, "DataRow");
            out.push((offset, len));
            body.advance(len as usize);
            offset += len as usize;
        }
        Ok(())
    }
}

/// Terminates every request/response cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Transaction status: `'I'` idle, `'T'` in transaction, `'E'` in
    /// failed transaction. Not inspected by this crate.
    pub status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 1, "ReadyForQuery");
        Ok(Self { status: body.get_u8() })
    }
}
