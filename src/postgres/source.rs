// ABOUTME: PostgresRowSource - reads rows past the cursor from a source PostgreSQL table
// ABOUTME: Each extraction is one SELECT, so it sees a single statement snapshot

use async_trait::async_trait;
use relay_protocol::{ColumnDescriptor, RowMap, Schema, Value};

use super::PgHandle;
use crate::error::SyncError;
use crate::sync::{Cursor, Extracted, RowSource};
use crate::utils::{qualified_table, quote_ident, validate_postgres_identifier};

/// Re-extract rows whose `column` is newer than `now() - interval`, even when
/// their key is at or below the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookback {
    pub column: String,
    /// PostgreSQL interval literal, e.g. `1 hour`
    pub interval: String,
}

/// Reads new rows from one table, keyed by an integer column.
///
/// Rows are returned as JSON objects built by `row_to_json`, so every column
/// type PostgreSQL can render as JSON is supported without per-type decoding.
pub struct PostgresRowSource {
    handle: PgHandle,
    schema: String,
    table: String,
    key_column: String,
    batch_size: Option<usize>,
    lookback: Option<Lookback>,
}

impl PostgresRowSource {
    pub fn new(
        handle: PgHandle,
        schema: &str,
        table: &str,
        key_column: &str,
    ) -> anyhow::Result<Self> {
        validate_postgres_identifier(schema)?;
        validate_postgres_identifier(table)?;
        validate_postgres_identifier(key_column)?;
        Ok(Self {
            handle,
            schema: schema.to_string(),
            table: table.to_string(),
            key_column: key_column.to_string(),
            batch_size: None,
            lookback: None,
        })
    }

    /// Cap rows per extraction. `None` reads everything past the cursor.
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size.filter(|n| *n > 0);
        self
    }

    pub fn with_lookback(mut self, lookback: Option<Lookback>) -> anyhow::Result<Self> {
        if let Some(lb) = &lookback {
            validate_postgres_identifier(&lb.column)?;
        }
        self.lookback = lookback;
        Ok(self)
    }

    fn extract_query(&self) -> String {
        build_extract_query(
            &self.schema,
            &self.table,
            &self.key_column,
            self.lookback.as_ref().map(|lb| lb.column.as_str()),
            self.batch_size,
        )
    }
}

#[async_trait]
impl RowSource for PostgresRowSource {
    async fn read_since(&mut self, last: Option<Cursor>) -> Result<Extracted, SyncError> {
        let client = self
            .handle
            .client()
            .await
            .map_err(SyncError::source_unavailable)?;

        let query = self.extract_query();
        let since: Option<i64> = last.map(Cursor::value);
        let rows = match &self.lookback {
            Some(lb) => client.query(&query, &[&since, &lb.interval]).await,
            None => client.query(&query, &[&since]).await,
        }
        .map_err(|e| {
            SyncError::source_unavailable(anyhow::Error::new(e).context(format!(
                "Failed to read rows from {}.{}",
                self.schema, self.table
            )))
        })?;

        let mut extracted = Extracted::empty(last);
        let mut max_key: Option<Cursor> = None;
        for row in rows {
            let payload: Value = row.try_get("payload").map_err(SyncError::source_unavailable)?;
            let key: i64 = row.try_get("_cursor").map_err(SyncError::source_unavailable)?;
            extracted.rows.push(into_row_map(payload)?);
            max_key = max_key.max(Some(Cursor(key)));
        }
        if max_key.is_some() {
            extracted.cursor = max_key;
        }

        tracing::debug!(
            table = %self.table,
            rows = extracted.len(),
            since = ?since,
            "Extracted rows"
        );
        Ok(extracted)
    }

    async fn read_schema(&mut self) -> Result<Schema, SyncError> {
        let client = self
            .handle
            .client()
            .await
            .map_err(SyncError::source_unavailable)?;

        let rows = client
            .query(SCHEMA_QUERY, &[&self.schema, &self.table])
            .await
            .map_err(|e| {
                SyncError::source_unavailable(anyhow::Error::new(e).context(format!(
                    "Failed to read columns of {}.{}",
                    self.schema, self.table
                )))
            })?;

        if rows.is_empty() {
            return Err(SyncError::SourceUnavailable(format!(
                "Table {}.{} does not exist or has no columns",
                self.schema, self.table
            )));
        }

        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(SyncError::source_unavailable)?;
                let type_name: String = row.try_get(1).map_err(SyncError::source_unavailable)?;
                Ok::<_, SyncError>(ColumnDescriptor::new(name, type_name))
            })
            .collect()
    }

    fn table(&self) -> &str {
        &self.table
    }
}

const SCHEMA_QUERY: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
     FROM pg_attribute a
     JOIN pg_class c ON c.oid = a.attrelid
     JOIN pg_namespace n ON n.oid = c.relnamespace
     WHERE n.nspname = $1
       AND c.relname = $2
       AND a.attnum > 0
       AND NOT a.attisdropped
     ORDER BY a.attnum";

fn into_row_map(payload: Value) -> Result<RowMap, SyncError> {
    match payload {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::SourceUnavailable(format!(
            "Expected a JSON object per row, got {}",
            other
        ))),
    }
}

/// Build the extraction query.
///
/// `$1` is the cursor (`NULL` = from the beginning). With a lookback column,
/// `$2` is the interval text. Without lookback:
/// ```sql
/// SELECT row_to_json(t) AS payload, t."id"::bigint AS _cursor
/// FROM "public"."users" AS t
/// WHERE ($1::bigint IS NULL OR t."id" > $1::bigint)
/// ORDER BY t."id" LIMIT 10000
/// ```
/// With lookback, the batch limit applies only to rows past the cursor so
/// recently updated rows can never starve new ones.
fn build_extract_query(
    schema: &str,
    table: &str,
    key_column: &str,
    lookback_column: Option<&str>,
    limit: Option<usize>,
) -> String {
    let source = qualified_table(schema, table);
    let key = quote_ident(key_column);
    let limit_clause = limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();

    let new_rows = format!(
        "SELECT row_to_json(t) AS payload, t.{key}::bigint AS _cursor \
         FROM {source} AS t \
         WHERE ($1::bigint IS NULL OR t.{key} > $1::bigint) \
         ORDER BY t.{key}{limit_clause}"
    );

    match lookback_column {
        None => new_rows,
        Some(column) => {
            let column = quote_ident(column);
            format!(
                "SELECT payload, _cursor FROM (\
                 ({new_rows}) \
                 UNION ALL \
                 (SELECT row_to_json(t) AS payload, t.{key}::bigint AS _cursor \
                 FROM {source} AS t \
                 WHERE $1::bigint IS NOT NULL AND t.{key} <= $1::bigint \
                 AND t.{column} >= now() - $2::text::interval)\
                 ) AS extracted ORDER BY _cursor"
            )
        }
    }
}
