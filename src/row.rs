//! Column metadata and the current-row view.
use bytes::Bytes;

use crate::{
    common::ByteStr,
    protocol::backend::DataRow,
    types::{Oid, PgFormat},
};

/// One column of a result set, from `RowDescription`.
///
/// Valid until the reader is closed or the next `RowDescription`
/// arrives.
#[derive(Debug, Clone)]
pub struct Column {
    name: ByteStr,
    oid: Oid,
    format: PgFormat,
}

impl Column {
    pub(crate) fn new(name: ByteStr, oid: Oid, format: PgFormat) -> Self {
        Self { name, oid, format }
    }

    /// The column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type oid of the column.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The format the backend returns this column in.
    pub fn format(&self) -> PgFormat {
        self.format
    }
}

/// View over the most recent `DataRow` payload.
///
/// The body is a zero-copy slice of the receive buffer; the ranges vec
/// is recycled across rows. Valid only until the next read advances
/// the reader.
#[derive(Debug, Default)]
pub(crate) struct RowBuffer {
    body: Bytes,
    /// `(offset, length)` per column, length `-1` for SQL NULL.
    ranges: Vec<(usize, i32)>,
}

impl RowBuffer {
    /// Replace the current row with `row`, reusing the range storage.
    pub(crate) fn load(&mut self, row: &DataRow) -> Result<(), crate::protocol::ProtocolError> {
        row.ranges(&mut self.ranges)?;
        self.body = row.body().clone();
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.body = Bytes::new();
        self.ranges.clear();
    }

    /// The raw bytes of column `idx`, `None` for SQL NULL.
    pub(crate) fn get(&self, idx: usize) -> Option<Option<&[u8]>> {
        let (offset, len) = *self.ranges.get(idx)?;
        if len < 0 {
            return Some(None);
        }
        Some(Some(&self.body[offset..offset + len as usize]))
    }
}
