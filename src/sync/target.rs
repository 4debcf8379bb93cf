// ABOUTME: TargetStore trait and the per-frame apply step used by the receiver
// ABOUTME: Schema failures abort the frame; row failures are logged and skipped

use async_trait::async_trait;
use relay_protocol::{Frame, RowMap, Schema};

use crate::error::SyncError;

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Create `table` from `schema` if it does not exist yet.
    ///
    /// Returns `true` when the table was created. Existing tables are never
    /// altered or dropped.
    async fn apply_schema(&self, table: &str, schema: &Schema) -> Result<bool, SyncError>;

    /// Write one row. Independent of other rows.
    async fn insert_row(&self, table: &str, row: &RowMap) -> Result<(), SyncError>;
}

/// Outcome of applying one frame.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub schema_received: bool,
    pub table_created: bool,
    pub rows_applied: usize,
    pub row_failures: Vec<SyncError>,
}

impl ApplyReport {
    pub fn rows_failed(&self) -> usize {
        self.row_failures.len()
    }
}

/// Apply `frame` to `store` in frame order.
///
/// `last_schema` is the most recent schema seen on the connection. It is
/// replaced by the frame's schema (if any) and used to resolve positional rows.
pub async fn apply_frame<T>(
    store: &T,
    table: &str,
    frame: &Frame,
    last_schema: &mut Option<Schema>,
) -> Result<ApplyReport, SyncError>
where
    T: TargetStore + ?Sized,
{
    let mut report = ApplyReport::default();

    if let Some(schema) = &frame.schema {
        report.schema_received = true;
        *last_schema = Some(schema.clone());
        report.table_created = store.apply_schema(table, schema).await.map_err(|e| match e {
            SyncError::SchemaApplyFailure { .. } => e,
            other => SyncError::SchemaApplyFailure {
                table: table.to_string(),
                detail: other.to_string(),
            },
        })?;
        if report.table_created {
            tracing::info!(table, columns = schema.len(), "Created target table");
        }
    }

    for (index, row) in frame.data.iter().enumerate() {
        let result = match row.resolve(last_schema.as_ref()) {
            Ok(map) => store.insert_row(table, &map).await,
            Err(e) => Err(SyncError::RowApplyFailure {
                table: table.to_string(),
                detail: e.to_string(),
            }),
        };

        match result {
            Ok(()) => report.rows_applied += 1,
            Err(e) => {
                tracing::warn!(table, row = index, kind = e.kind(), error = %e, "Skipping row");
                report.row_failures.push(e);
            }
        }
    }

    Ok(report)
}
