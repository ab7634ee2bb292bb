//! Frontend message builders.
//!
//! All multi byte integers are big-endian. The 4-byte length field
//! counts itself but not the type tag, and is backfilled once the body
//! has been written.
use bytes::{BufMut, BytesMut};

use crate::types::Encoded;

/// A frontend message with a type tag.
pub trait FrontendMessage {
    const TAG: u8;

    /// Write the message body, excluding tag and length.
    fn write_body(&self, buf: &mut BytesMut);
}

/// Write a complete tagged message into `buf`.
pub fn write<M: FrontendMessage>(message: &M, buf: &mut BytesMut) {
    buf.put_u8(M::TAG);
    let offset = buf.len();
    buf.put_u32(0);
    message.write_body(buf);
    backfill_len(buf, offset);
}

/// Write the length over the 4 bytes reserved at `offset`.
fn backfill_len(buf: &mut BytesMut, offset: usize) {
    let len: i32 = (buf.len() - offset)
        .try_into()
        .expect("message exceeds the protocol length limit");
    buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
}

/// Write a wire string: the bytes followed by a nul terminator.
fn put_str(buf: &mut BytesMut, string: &str) {
    buf.put_slice(string.as_bytes());
    buf.put_u8(0);
}

/// Parameter counts cross the wire as `i16`; a statement cannot
/// reference more parameters than that, so overflow is a caller bug.
fn param_count(params: &[Encoded]) -> i16 {
    params.len().try_into().expect("too many parameters for one statement")
}

/// The startup message.
///
/// For historical reasons, the very first message sent by the client
/// has no type tag.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as.
    pub user: &'a str,
    /// The database to connect to.
    pub database: &'a str,
}

impl Startup<'_> {
    /// Protocol version 3.0: major 3 in the high 16 bits, minor 0 in
    /// the low 16 bits.
    pub const PROTOCOL_VERSION: i32 = 196608;

    pub fn write(&self, buf: &mut BytesMut) {
        let offset = buf.len();
        buf.put_u32(0);
        buf.put_i32(Self::PROTOCOL_VERSION);

        put_str(buf, "user");
        put_str(buf, self.user);

        put_str(buf, "database");
        put_str(buf, self.database);

        put_str(buf, "client_encoding");
        put_str(buf, "UTF8");

        // terminator after the last name/value pair
        buf.put_u8(0);

        backfill_len(buf, offset);
    }
}

/// A password response, cleartext or md5-hashed.
#[derive(Debug)]
pub struct Password<'a> {
    pub password: &'a str,
}

impl FrontendMessage for Password<'_> {
    const TAG: u8 = b'p';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.password);
    }
}

/// Initial SASL response carrying the mechanism name and the
/// client-first message.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponse<'_> {
    const TAG: u8 = b'p';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.mechanism);
        let len: i32 = self
            .data
            .len()
            .try_into()
            .expect("SASL response exceeds the protocol length limit");
        buf.put_i32(len);
        buf.put_slice(self.data);
    }
}

/// Continuation SASL response, not nul terminated.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponse<'_> {
    const TAG: u8 = b'p';

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// A simple query, always text format.
#[derive(Debug)]
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendMessage for Query<'_> {
    const TAG: u8 = b'Q';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.sql);
    }
}

/// Parse a statement.
///
/// The parameter type oids come from the encoded parameters; oid 0
/// leaves the type for the server to infer.
#[derive(Debug)]
pub struct Parse<'a> {
    /// Prepared statement name, an empty string selects the unnamed
    /// prepared statement.
    pub statement: &'a str,
    /// The query string to be parsed, with `$n` placeholders.
    pub sql: &'a str,
    pub params: &'a [Encoded],
}

impl FrontendMessage for Parse<'_> {
    const TAG: u8 = b'P';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.statement);
        put_str(buf, self.sql);
        buf.put_i16(param_count(self.params));
        for param in self.params {
            buf.put_u32(param.oid());
        }
    }
}

/// Bind a portal to a parsed statement.
///
/// Every parameter is sent in binary format, and all result columns
/// are requested in binary format.
#[derive(Debug)]
pub struct Bind<'a> {
    /// Portal name, an empty string selects the unnamed portal.
    pub portal: &'a str,
    /// Source prepared statement name.
    pub statement: &'a str,
    pub params: &'a [Encoded],
}

impl FrontendMessage for Bind<'_> {
    const TAG: u8 = b'B';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.portal);
        put_str(buf, self.statement);

        // one format code per parameter, all binary
        buf.put_i16(param_count(self.params));
        for _ in self.params {
            buf.put_i16(1);
        }

        // Int32 length then value bytes, -1 for NULL with no body
        buf.put_i16(param_count(self.params));
        for param in self.params {
            match param.bytes() {
                Some(value) => {
                    let len: i32 = value
                        .len()
                        .try_into()
                        .expect("parameter value too large for the protocol");
                    buf.put_i32(len);
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }

        // a single result format code applied to all columns: binary
        buf.put_i16(1);
        buf.put_i16(1);
    }
}

/// Describe a statement (`'S'`) or portal (`'P'`).
#[derive(Debug)]
pub struct Describe<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for Describe<'_> {
    const TAG: u8 = b'D';

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        put_str(buf, self.name);
    }
}

/// Execute a bound portal.
#[derive(Debug)]
pub struct Execute<'a> {
    pub portal: &'a str,
    /// Maximum number of rows to return, zero denotes no limit.
    pub max_rows: i32,
}

impl FrontendMessage for Execute<'_> {
    const TAG: u8 = b'E';

    fn write_body(&self, buf: &mut BytesMut) {
        put_str(buf, self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Close the current extended query cycle, the backend answers with
/// `ReadyForQuery`.
#[derive(Debug)]
pub struct Sync;

impl FrontendMessage for Sync {
    const TAG: u8 = b'S';

    fn write_body(&self, _: &mut BytesMut) { }
}

/// Graceful session termination, no response follows.
#[derive(Debug)]
pub struct Terminate;

impl FrontendMessage for Terminate {
    const TAG: u8 = b'X';

    fn write_body(&self, _: &mut BytesMut) { }
}
