// ABOUTME: RowSource trait - the sender's view of the origin table
// ABOUTME: One consistent read of rows past a cursor, plus the column schema

use async_trait::async_trait;
use relay_protocol::{RowMap, Schema};

use super::cursor::Cursor;
use crate::error::SyncError;

/// Rows returned by one extraction, in ascending key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub rows: Vec<RowMap>,
    /// Max key among `rows`, or the cursor passed in when `rows` is empty.
    pub cursor: Option<Cursor>,
}

impl Extracted {
    pub fn empty(cursor: Option<Cursor>) -> Self {
        Self {
            rows: Vec::new(),
            cursor,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait RowSource: Send {
    /// Rows with key greater than `last` (all rows when `last` is `None`).
    ///
    /// Must be a single consistent read. Connectivity loss is reported as
    /// [`SyncError::SourceUnavailable`]; the caller retries next cycle.
    async fn read_since(&mut self, last: Option<Cursor>) -> Result<Extracted, SyncError>;

    /// Column names and type tags in catalog order.
    async fn read_schema(&mut self) -> Result<Schema, SyncError>;

    /// Table name used in logs and in the cursor file.
    fn table(&self) -> &str;
}
