//! The forward-only streaming row reader.
use time::{Date, PrimitiveDateTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::{
    Result,
    connection::Connection,
    error::UsageError,
    protocol::backend::BackendMessage,
    row::{Column, RowBuffer},
    types::{self, DecodeError, PgValue, oid},
};

/// Forward-only cursor over a query's result stream.
///
/// Returned by [`Connection::query`]; borrows the connection
/// exclusively, so no other command can run until the reader has been
/// consumed, [`close`][RowReader::close]d, or dropped (a dropped
/// reader's remaining messages are drained before the connection's
/// next command).
///
/// [`read`][RowReader::read] advances to the next row; the typed
/// accessors decode the current row's columns on demand, straight from
/// the receive buffer. The current row is only valid until the next
/// `read`.
pub struct RowReader<'c, S = TcpStream> {
    conn: &'c mut Connection<S>,
    columns: Vec<Column>,
    row: RowBuffer,
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Before `ReadyForQuery`, not positioned on a row.
    Streaming,
    /// Positioned on a row.
    Row,
    /// `ReadyForQuery` observed, the cycle is finished.
    Complete,
    Closed,
}

impl<'c, S> RowReader<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(conn: &'c mut Connection<S>) -> Self {
        Self {
            conn,
            columns: Vec::new(),
            row: RowBuffer::default(),
            state: State::Streaming,
        }
    }

    /// Advance to the next row.
    ///
    /// Returns `true` positioned on a new row, `false` once the
    /// terminating `ReadyForQuery` has been observed. When the whole
    /// next message is already buffered, this completes without
    /// touching the socket.
    pub async fn read(&mut self) -> Result<bool> {
        if matches!(self.state, State::Complete | State::Closed) {
            return Ok(false);
        }

        loop {
            match self.conn.stream.recv().await? {
                BackendMessage::DataRow(row) => {
                    self.row.load(&row)?;
                    self.state = State::Row;
                    return Ok(true);
                }
                BackendMessage::RowDescription(desc) => {
                    self.columns = desc.columns()?;
                }
                BackendMessage::ReadyForQuery(_) => {
                    self.row.clear();
                    self.state = State::Complete;
                    return Ok(false);
                }
                BackendMessage::ErrorResponse(err) => {
                    // the cycle still owes a ReadyForQuery, settled on
                    // close or before the connection's next command
                    self.row.clear();
                    self.state = State::Complete;
                    self.conn.pending_ready += 1;
                    return Err(err.into());
                }
                BackendMessage::NoticeResponse(notice) => {
                    debug!(message = notice.message(), "notice");
                }
                // ParseComplete, BindComplete, NoData, CommandComplete
                // and anything else are transparently skipped
                _ => {}
            }
        }
    }

    /// Consume and discard the rest of the stream, leaving the
    /// connection ready for the next command.
    ///
    /// Intermediate `ErrorResponse` messages are ignored, the request
    /// is already being abandoned.
    pub async fn close(mut self) -> Result<()> {
        if matches!(self.state, State::Streaming | State::Row) {
            loop {
                if let BackendMessage::ReadyForQuery(_) = self.conn.stream.recv().await? {
                    break;
                }
            }
        }
        self.state = State::Closed;
        Ok(())
    }

    /// Column metadata of the current result set. Empty until the
    /// first [`read`][RowReader::read] observes the `RowDescription`.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The index of the named column.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    /// The current row's raw column slot.
    fn field(&self, idx: usize) -> Result<(&Column, Option<&[u8]>)> {
        if self.state != State::Row {
            return Err(UsageError::NoRow.into());
        }
        let column = self.columns.get(idx).ok_or(DecodeError::Column(idx))?;
        let slot = self.row.get(idx).ok_or(DecodeError::Column(idx))?;
        Ok((column, slot))
    }

    /// Whether the column is SQL NULL in the current row.
    pub fn is_null(&self, idx: usize) -> Result<bool> {
        Ok(self.field(idx)?.1.is_none())
    }

    /// Decode the column of the current row, NULL surfacing as
    /// [`PgValue::Null`].
    pub fn value(&self, idx: usize) -> Result<PgValue> {
        let (column, slot) = self.field(idx)?;
        match slot {
            None => Ok(PgValue::Null),
            Some(data) => {
                types::decode(column.oid(), column.format(), data).map_err(Into::into)
            }
        }
    }

    /// Decode a column the typed accessors may cast from; NULL is a
    /// decode error here, guard with [`is_null`][RowReader::is_null].
    fn decode_required(&self, idx: usize) -> Result<PgValue> {
        let (column, slot) = self.field(idx)?;
        let data = slot.ok_or(DecodeError::Null)?;
        types::decode(column.oid(), column.format(), data).map_err(Into::into)
    }

    /// Borrow the column of the current row as text, without copying.
    ///
    /// Only the textual types (and unknown oids, which decode as text)
    /// support this; the value lives in the receive buffer and is
    /// valid until the next [`read`][RowReader::read].
    pub fn get_str(&self, idx: usize) -> Result<&str> {
        let (column, slot) = self.field(idx)?;
        let data = slot.ok_or(DecodeError::Null)?;
        match column.oid() {
            oid::BOOL | oid::BYTEA | oid::INT8 | oid::INT2 | oid::INT4 | oid::OID
            | oid::FLOAT4 | oid::FLOAT8 | oid::DATE | oid::TIMESTAMP | oid::TIMESTAMPTZ
            | oid::UUID => Err(DecodeError::Cast {
                requested: "&str",
                actual: types::type_name(column.oid()),
            }
            .into()),
            _ => Ok(std::str::from_utf8(data).map_err(DecodeError::Utf8)?),
        }
    }
}

macro_rules! typed {
    ($(#[$doc:meta])* $fn:ident, $variant:ident, $ty:ty) => {
        impl<S> RowReader<'_, S>
        where
            S: AsyncRead + AsyncWrite + Unpin,
        {
            $(#[$doc])*
            ///
            /// NULL fails with a cast error, guard with
            /// [`is_null`][RowReader::is_null].
            pub fn $fn(&self, idx: usize) -> Result<$ty> {
                match self.decode_required(idx)? {
                    PgValue::$variant(v) => Ok(v),
                    value => Err(DecodeError::Cast {
                        requested: stringify!($ty),
                        actual: value.name(),
                    }
                    .into()),
                }
            }
        }
    };
}

typed!(/** The column as `bool`. */ get_bool, Bool, bool);
typed!(/** The column as `i16`. */ get_i16, Int2, i16);
typed!(/** The column as `i32`. */ get_i32, Int4, i32);
typed!(/** The column as `i64`. */ get_i64, Int8, i64);
typed!(/** The column as `f32`. */ get_f32, Float4, f32);
typed!(/** The column as `f64`. */ get_f64, Float8, f64);
typed!(/** The column as an owned `String`. */ get_string, Text, String);
typed!(/** The column as owned bytes. */ get_bytes, Bytea, Vec<u8>);
typed!(/** The column as a [`Uuid`]. */ get_uuid, Uuid, Uuid);
typed!(/** The column as a microsecond-precision timestamp. */ get_timestamp, Timestamp, PrimitiveDateTime);
typed!(/** The column as a calendar date. */ get_date, Date, Date);

impl<S> Drop for RowReader<'_, S> {
    fn drop(&mut self) {
        // abandoned mid-stream: the connection settles the rest of the
        // cycle before its next command
        if matches!(self.state, State::Streaming | State::Row) {
            self.conn.pending_ready += 1;
        }
    }
}

impl<S> std::fmt::Debug for RowReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("columns", &self.columns)
            .field("state", &self.state)
            .finish()
    }
}
