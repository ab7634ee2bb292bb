//! Parameter values and the binary value codec.
//!
//! Parameters are encoded into postgres binary representation with a
//! fixed [`Oid`] tag; columns are decoded on demand, dispatching on the
//! column format code and type oid. `numeric` (oid 1700) always goes
//! through the textual parser, its binary format is not implemented.
use bytes::Bytes;
use std::{fmt, mem::size_of, str::Utf8Error};
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
    macros::{date, datetime},
};
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// Fixed oids of the built-in types this crate speaks.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const NUMERIC: Oid = 1700;
    pub const UUID: Oid = 2950;

    /// Leaves the parameter type for the server to infer.
    pub const UNSPECIFIED: Oid = 0;
}

/// Postgres epoch: midnight UTC on 2000-01-01.
///
/// Timestamps are microseconds since this instant, dates are days
/// since this day, both signed.
pub(crate) const PG_EPOCH: PrimitiveDateTime = datetime!(2000-01-01 0:00);
pub(crate) const PG_EPOCH_DATE: Date = date!(2000-01-01);

/// Per column or parameter format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    Text,
    Binary,
}

impl PgFormat {
    pub(crate) fn from_code(code: i16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            code => Err(ProtocolError::new(format!("unknown format code {code}"))),
        }
    }
}

/// A parameter value, the tagged variant over every supported
/// primitive type.
///
/// The variant both carries the value and declares the wire type; a
/// value of an undeclarable type goes through [`PgValue::Text`] with
/// the oid left for the server to infer.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    /// Microsecond precision, normalized to UTC when built from an
    /// offset-carrying value.
    Timestamp(PrimitiveDateTime),
    Date(Date),
}

impl PgValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Encode into the binary wire representation and its oid tag.
    pub(crate) fn encode(&self) -> Encoded {
        match self {
            Self::Null => Encoded::null(),
            Self::Bool(v) => Encoded::new(oid::BOOL, [*v as u8]),
            Self::Int2(v) => Encoded::new(oid::INT2, v.to_be_bytes()),
            Self::Int4(v) => Encoded::new(oid::INT4, v.to_be_bytes()),
            Self::Int8(v) => Encoded::new(oid::INT8, v.to_be_bytes()),
            Self::Float4(v) => Encoded::new(oid::FLOAT4, v.to_be_bytes()),
            Self::Float8(v) => Encoded::new(oid::FLOAT8, v.to_be_bytes()),
            Self::Text(v) => Encoded {
                oid: oid::UNSPECIFIED,
                bytes: Some(Bytes::copy_from_slice(v.as_bytes())),
            },
            Self::Bytea(v) => Encoded {
                oid: oid::BYTEA,
                bytes: Some(Bytes::copy_from_slice(v)),
            },
            Self::Uuid(v) => Encoded::new(oid::UUID, *v.as_bytes()),
            Self::Timestamp(v) => {
                let micros = (*v - PG_EPOCH).whole_microseconds() as i64;
                Encoded::new(oid::TIMESTAMP, micros.to_be_bytes())
            }
            Self::Date(v) => {
                let days = (*v - PG_EPOCH_DATE).whole_days() as i32;
                Encoded::new(oid::DATE, days.to_be_bytes())
            }
        }
    }

    /// The variant name, for cast error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int2(_) => "int2",
            Self::Int4(_) => "int4",
            Self::Int8(_) => "int8",
            Self::Float4(_) => "float4",
            Self::Float8(_) => "float8",
            Self::Text(_) => "text",
            Self::Bytea(_) => "bytea",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
        }
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for PgValue {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

from!(<bool>v => Self::Bool(v));
from!(<i16>v => Self::Int2(v));
from!(<i32>v => Self::Int4(v));
from!(<i64>v => Self::Int8(v));
from!(<f32>v => Self::Float4(v));
from!(<f64>v => Self::Float8(v));
from!(<&str>v => Self::Text(v.into()));
from!(<String>v => Self::Text(v));
from!(<&[u8]>v => Self::Bytea(v.into()));
from!(<Vec<u8>>v => Self::Bytea(v));
from!(<Uuid>v => Self::Uuid(v));
from!(<PrimitiveDateTime>v => Self::Timestamp(v));
from!(<Date>v => Self::Date(v));

impl From<OffsetDateTime> for PgValue {
    fn from(v: OffsetDateTime) -> Self {
        let utc = v.to_offset(UtcOffset::UTC);
        Self::Timestamp(PrimitiveDateTime::new(utc.date(), utc.time()))
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// A parameter encoded for the wire: value bytes and oid tag.
///
/// `None` bytes denote SQL NULL, sent as length -1 with no body.
#[derive(Debug)]
pub struct Encoded {
    oid: Oid,
    bytes: Option<Bytes>,
}

impl Encoded {
    fn null() -> Self {
        Self { oid: oid::UNSPECIFIED, bytes: None }
    }

    fn new<const N: usize>(oid: Oid, bytes: [u8; N]) -> Self {
        Self { oid, bytes: Some(Bytes::copy_from_slice(&bytes)) }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }
}

// ===== Column decoding =====

macro_rules! be {
    ($ty:ty, $data:expr, $oid:expr) => {{
        let arr: [u8; size_of::<$ty>()] = $data
            .try_into()
            .map_err(|_| DecodeError::UnexpectedLength($oid))?;
        <$ty>::from_be_bytes(arr)
    }};
}

/// Decode a non-NULL column value.
///
/// Format 1 dispatches the binary decoders, format 0 the textual
/// parsers; `numeric` always parses textually. Unknown oids surface as
/// UTF-8 text either way.
pub(crate) fn decode(oid: Oid, format: PgFormat, data: &[u8]) -> Result<PgValue, DecodeError> {
    match format {
        PgFormat::Binary if oid != oid::NUMERIC => decode_binary(oid, data),
        _ => decode_text(oid, data),
    }
}

fn decode_binary(oid: Oid, data: &[u8]) -> Result<PgValue, DecodeError> {
    let value = match oid {
        oid::BOOL => match data {
            [b] => PgValue::Bool(*b != 0),
            _ => return Err(DecodeError::UnexpectedLength(oid)),
        },
        oid::BYTEA => PgValue::Bytea(data.to_vec()),
        oid::INT8 => PgValue::Int8(be!(i64, data, oid)),
        oid::INT2 => PgValue::Int2(be!(i16, data, oid)),
        oid::INT4 | oid::OID => PgValue::Int4(be!(i32, data, oid)),
        oid::FLOAT4 => PgValue::Float4(be!(f32, data, oid)),
        oid::FLOAT8 => PgValue::Float8(be!(f64, data, oid)),
        oid::DATE => {
            let days = be!(i32, data, oid);
            PG_EPOCH_DATE
                .checked_add(Duration::days(days as i64))
                .map(PgValue::Date)
                .ok_or(DecodeError::OutOfRange(oid))?
        }
        oid::TIMESTAMP | oid::TIMESTAMPTZ => {
            let micros = be!(i64, data, oid);
            PG_EPOCH
                .checked_add(Duration::microseconds(micros))
                .map(PgValue::Timestamp)
                .ok_or(DecodeError::OutOfRange(oid))?
        }
        oid::UUID => {
            Uuid::from_slice(data).map(PgValue::Uuid).map_err(|_| DecodeError::UnexpectedLength(oid))?
        }
        // TEXT, BPCHAR, VARCHAR and any unknown oid
        _ => PgValue::Text(utf8(data)?.into()),
    };
    Ok(value)
}

fn decode_text(oid: Oid, data: &[u8]) -> Result<PgValue, DecodeError> {
    let text = utf8(data)?;
    let value = match oid {
        oid::BOOL => match text {
            "t" | "true" => PgValue::Bool(true),
            "f" | "false" => PgValue::Bool(false),
            _ => return Err(DecodeError::Parse(oid)),
        },
        oid::BYTEA => match text.strip_prefix("\\x") {
            Some(hex) => PgValue::Bytea(decode_hex(hex).ok_or(DecodeError::Parse(oid))?),
            None => PgValue::Bytea(data.to_vec()),
        },
        oid::INT8 => PgValue::Int8(text.parse().map_err(|_| DecodeError::Parse(oid))?),
        oid::INT2 => PgValue::Int2(text.parse().map_err(|_| DecodeError::Parse(oid))?),
        oid::INT4 | oid::OID => PgValue::Int4(text.parse().map_err(|_| DecodeError::Parse(oid))?),
        oid::FLOAT4 => PgValue::Float4(text.parse().map_err(|_| DecodeError::Parse(oid))?),
        oid::FLOAT8 => PgValue::Float8(text.parse().map_err(|_| DecodeError::Parse(oid))?),
        oid::DATE => Date::parse(text, DATE_DESCRIPTION)
            .map(PgValue::Date)
            .map_err(|_| DecodeError::Parse(oid))?,
        oid::TIMESTAMP | oid::TIMESTAMPTZ => {
            // timestamptz text carries a trailing offset, e.g. `+00`
            let naive = match text.char_indices().nth(19) {
                Some((cut, c)) if matches!(c, '+' | '-') => &text[..cut],
                _ => text,
            };
            PrimitiveDateTime::parse(naive, TIMESTAMP_DESCRIPTION)
                .map(PgValue::Timestamp)
                .map_err(|_| DecodeError::Parse(oid))?
        }
        oid::UUID => Uuid::parse_str(text).map(PgValue::Uuid).map_err(|_| DecodeError::Parse(oid))?,
        // NUMERIC keeps its exact textual form; TEXT family and any
        // unknown oid are the text itself
        _ => PgValue::Text(text.into()),
    };
    Ok(value)
}

/// Static name of a known oid, for cast errors.
pub(crate) fn type_name(id: Oid) -> &'static str {
    match id {
        oid::BOOL => "bool",
        oid::BYTEA => "bytea",
        oid::INT8 => "int8",
        oid::INT2 => "int2",
        oid::INT4 => "int4",
        oid::OID => "oid",
        oid::TEXT => "text",
        oid::FLOAT4 => "float4",
        oid::FLOAT8 => "float8",
        oid::BPCHAR => "bpchar",
        oid::VARCHAR => "varchar",
        oid::DATE => "date",
        oid::TIMESTAMP => "timestamp",
        oid::TIMESTAMPTZ => "timestamptz",
        oid::NUMERIC => "numeric",
        oid::UUID => "uuid",
        _ => "unknown",
    }
}

fn utf8(data: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(data).map_err(DecodeError::Utf8)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

/// `YYYY-MM-DD`
const DATE_DESCRIPTION: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
];

/// `YYYY-MM-DD hh:mm:ss[.ffffff]`
const TIMESTAMP_DESCRIPTION: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
    I::Literal(b" "),
    I::Component(C::Hour(modifier::Hour::default())),
    I::Literal(b":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::Literal(b":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&I::Compound(&[
        I::Literal(b"."),
        I::Component(C::Subsecond(modifier::Subsecond::default())),
    ])),
];

/// An error when decoding a column value.
pub enum DecodeError {
    /// Postgres returned a non UTF-8 string.
    Utf8(Utf8Error),
    /// A fixed-width binary value arrived with the wrong length.
    UnexpectedLength(Oid),
    /// The value does not fit the host type.
    OutOfRange(Oid),
    /// The textual representation did not parse.
    Parse(Oid),
    /// A typed accessor was used on a SQL NULL.
    Null,
    /// The decoded value is not of the requested type.
    Cast {
        requested: &'static str,
        actual: &'static str,
    },
    /// The column index is out of range.
    Column(usize),
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::UnexpectedLength(oid) => write!(f, "unexpected value length for oid {oid}"),
            Self::OutOfRange(oid) => write!(f, "value out of range for oid {oid}"),
            Self::Parse(oid) => write!(f, "malformed text representation for oid {oid}"),
            Self::Null => write!(f, "column is null"),
            Self::Cast { requested, actual } => {
                write!(f, "requested {requested} but column holds {actual}")
            }
            Self::Column(idx) => write!(f, "column index {idx} out of range"),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
