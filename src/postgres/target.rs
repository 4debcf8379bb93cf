// ABOUTME: PostgresTarget - creates the target table and writes received rows
// ABOUTME: Plain INSERT by default, INSERT ... ON CONFLICT on the key column in upsert mode

use async_trait::async_trait;
use relay_protocol::{RowMap, Schema, Value};

use super::PgHandle;
use crate::error::SyncError;
use crate::sync::TargetStore;
use crate::utils::{qualified_table, quote_ident, validate_postgres_identifier, validate_type_name};

/// How received rows are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ApplyMode {
    /// Plain INSERT. A re-delivered row is inserted again.
    #[default]
    Insert,
    /// INSERT ... ON CONFLICT (key) DO UPDATE. Tables are created with the key
    /// column as primary key.
    Upsert,
}

pub struct PostgresTarget {
    handle: PgHandle,
    schema: String,
    mode: ApplyMode,
    key_column: String,
}

impl PostgresTarget {
    pub fn new(handle: PgHandle, schema: &str, mode: ApplyMode, key_column: &str) -> anyhow::Result<Self> {
        validate_postgres_identifier(schema)?;
        validate_postgres_identifier(key_column)?;
        Ok(Self {
            handle,
            schema: schema.to_string(),
            mode,
            key_column: key_column.to_string(),
        })
    }

    pub fn handle(&self) -> &PgHandle {
        &self.handle
    }

    async fn table_exists(
        &self,
        client: &tokio_postgres::Client,
        table: &str,
    ) -> Result<bool, tokio_postgres::Error> {
        let row = client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2
                 )",
                &[&self.schema, &table],
            )
            .await?;
        row.try_get(0)
    }

    fn schema_failure(&self, table: &str, detail: impl std::fmt::Display) -> SyncError {
        SyncError::SchemaApplyFailure {
            table: format!("{}.{}", self.schema, table),
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn apply_schema(&self, table: &str, schema: &Schema) -> Result<bool, SyncError> {
        validate_postgres_identifier(table).map_err(|e| self.schema_failure(table, format!("{:#}", e)))?;
        let ddl = build_create_table(&self.schema, table, schema, self.primary_key())
            .map_err(|e| self.schema_failure(table, format!("{:#}", e)))?;

        let client = self
            .handle
            .client()
            .await
            .map_err(SyncError::target_unavailable)?;

        let exists = self
            .table_exists(&client, table)
            .await
            .map_err(|e| self.schema_failure(table, e))?;
        if exists {
            tracing::debug!(schema = %self.schema, table, "Target table already exists");
            return Ok(false);
        }

        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| self.schema_failure(table, e))?;
        Ok(true)
    }

    async fn insert_row(&self, table: &str, row: &RowMap) -> Result<(), SyncError> {
        let row_failure = |detail: String| SyncError::RowApplyFailure {
            table: format!("{}.{}", self.schema, table),
            detail,
        };

        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let query = match self.mode {
            ApplyMode::Insert => build_insert_query(&self.schema, table, &columns),
            ApplyMode::Upsert => build_upsert_query(&self.schema, table, &self.key_column, &columns),
        }
        .map_err(|e| row_failure(format!("{:#}", e)))?;

        let client = self
            .handle
            .client()
            .await
            .map_err(SyncError::target_unavailable)?;

        let payload = Value::Object(row.clone());
        match client.execute(&query, &[&payload]).await {
            Ok(_) => Ok(()),
            Err(e) if client.is_closed() => Err(SyncError::target_unavailable(e)),
            Err(e) => Err(row_failure(e.to_string())),
        }
    }
}

impl PostgresTarget {
    fn primary_key(&self) -> Option<&str> {
        match self.mode {
            ApplyMode::Insert => None,
            ApplyMode::Upsert => Some(&self.key_column),
        }
    }
}

/// Build `CREATE TABLE IF NOT EXISTS` from received column descriptors.
///
/// Type tags are used verbatim after validation; names are always quoted.
fn build_create_table(
    schema: &str,
    table: &str,
    columns: &Schema,
    primary_key: Option<&str>,
) -> anyhow::Result<String> {
    if columns.is_empty() {
        anyhow::bail!("Schema for table '{}' has no columns", table);
    }

    let mut defs = Vec::with_capacity(columns.len() + 1);
    for column in columns.columns() {
        if column.name.is_empty() {
            anyhow::bail!("Column names cannot be empty");
        }
        validate_type_name(&column.type_name)?;
        defs.push(format!("{} {}", quote_ident(&column.name), column.type_name.trim()));
    }

    if let Some(pk) = primary_key {
        if !columns.column_names().any(|name| name == pk) {
            anyhow::bail!("Key column '{}' is not part of the received schema", pk);
        }
        defs.push(format!("PRIMARY KEY ({})", quote_ident(pk)));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(schema, table),
        defs.join(", ")
    ))
}

/// Build a single-row insert that takes the row as one JSON parameter:
/// ```sql
/// INSERT INTO "public"."users" ("id", "name")
/// SELECT "id", "name" FROM json_populate_record(NULL::"public"."users", $1::json)
/// ```
/// `json_populate_record` casts each value to the target column type.
fn build_insert_query(schema: &str, table: &str, columns: &[&str]) -> anyhow::Result<String> {
    if columns.is_empty() {
        anyhow::bail!("Row has no columns");
    }
    let target = qualified_table(schema, table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "INSERT INTO {target} ({column_list}) \
         SELECT {column_list} FROM json_populate_record(NULL::{target}, $1::json)"
    ))
}

/// [`build_insert_query`] plus `ON CONFLICT (key) DO UPDATE SET` for every
/// non-key column, or `DO NOTHING` when the row only carries the key.
fn build_upsert_query(
    schema: &str,
    table: &str,
    key_column: &str,
    columns: &[&str],
) -> anyhow::Result<String> {
    if !columns.contains(&key_column) {
        anyhow::bail!("Row is missing key column '{}'", key_column);
    }
    let insert = build_insert_query(schema, table, columns)?;

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| **c != key_column)
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    Ok(format!(
        "{} ON CONFLICT ({}) {}",
        insert,
        quote_ident(key_column),
        update_clause
    ))
}
