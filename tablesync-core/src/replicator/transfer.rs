//! MySQL to MySQL row transfer.

use super::chunking::{ChunkTransfer, RowChunk};
use crate::Result;
use crate::connection::{ConnectionManager, MySqlEngine};
use crate::error::ReplicationError;
use crate::schema::TableSchema;
use crate::sql::{Dialect, Statement, insert_statements, quote_mysql};
use crate::value::decode_mysql_row;
use async_trait::async_trait;
use sqlx::Row;

/// Rows per INSERT statement on the replica, bounded by `max_allowed_packet`.
const REPLICA_INSERT_ROWS: usize = 1_000;

/// Moves one table's rows from the source to the replica.
pub struct TableTransfer<'a> {
    source: &'a mut ConnectionManager<MySqlEngine>,
    target: &'a mut ConnectionManager<MySqlEngine>,
    table: String,
    columns: Vec<String>,
    order_by: Vec<String>,
    key_index: Option<usize>,
}

impl<'a> TableTransfer<'a> {
    /// Prepares a transfer for the table described by `schema`.
    pub fn new(
        source: &'a mut ConnectionManager<MySqlEngine>,
        target: &'a mut ConnectionManager<MySqlEngine>,
        schema: &TableSchema,
    ) -> Self {
        let columns = schema.writable_column_names();
        let key_index = schema
            .integer_primary_key()
            .and_then(|key| columns.iter().position(|c| *c == key.name));
        Self {
            source,
            target,
            table: schema.table_name.clone(),
            order_by: schema.primary_key_columns(),
            columns,
            key_index,
        }
    }

    fn select_prefix(&self) -> String {
        format!(
            "SELECT {} FROM {}",
            Dialect::MySql.column_list(&self.columns),
            quote_mysql(&self.table)
        )
    }

    fn key_column(&self) -> Result<&str> {
        self.key_index
            .and_then(|i| self.columns.get(i))
            .map(String::as_str)
            .ok_or_else(|| {
                ReplicationError::configuration(format!(
                    "table '{}' has no single integer primary key",
                    self.table
                ))
            })
    }

    async fn fetch(&mut self, statement: Statement) -> Result<RowChunk> {
        let rows = self.source.fetch_all(&statement).await?;
        let rows = rows
            .iter()
            .map(decode_mysql_row)
            .collect::<Result<Vec<_>>>()?;
        let last_key = self
            .key_index
            .and_then(|i| rows.last().and_then(|row| row.get(i)))
            .and_then(|cell| cell.as_i64());
        Ok(RowChunk {
            columns: self.columns.clone(),
            rows,
            last_key,
        })
    }
}

#[async_trait]
impl ChunkTransfer for TableTransfer<'_> {
    async fn key_bounds(&mut self) -> Result<Option<(i64, i64)>> {
        let key = quote_mysql(self.key_column()?);
        let statement = Statement::new(format!(
            "SELECT CAST(MIN({key}) AS SIGNED) AS min_key, CAST(MAX({key}) AS SIGNED) AS max_key FROM {}",
            quote_mysql(&self.table),
        ));
        let Some(row) = self.source.fetch_optional(&statement).await? else {
            return Ok(None);
        };
        let read = |column: &str| {
            row.try_get::<Option<i64>, _>(column).map_err(|e| {
                ReplicationError::query_failed(format!("Failed to read key bounds of '{}'", self.table), e)
            })
        };
        match (read("min_key")?, read("max_key")?) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    async fn fetch_key_range(&mut self, lower: i64, upper: i64, limit: u64) -> Result<RowChunk> {
        let key = quote_mysql(self.key_column()?);
        let statement = Statement::new(format!(
            "{} WHERE {key} >= ? AND {key} <= ? ORDER BY {key} LIMIT {}",
            self.select_prefix(),
            limit,
        ))
        .bind(lower)
        .bind(upper);
        self.fetch(statement).await
    }

    async fn fetch_page(&mut self, offset: u64, limit: u64) -> Result<RowChunk> {
        let order = if self.order_by.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", Dialect::MySql.column_list(&self.order_by))
        };
        let statement = Statement::new(format!(
            "{}{} LIMIT {} OFFSET {}",
            self.select_prefix(),
            order,
            limit,
            offset
        ));
        self.fetch(statement).await
    }

    async fn fetch_all(&mut self) -> Result<RowChunk> {
        let statement = Statement::new(self.select_prefix());
        self.fetch(statement).await
    }

    async fn write_chunk(&mut self, chunk: RowChunk) -> Result<u64> {
        let rows = chunk.rows.len() as u64;
        let statements = insert_statements(
            Dialect::MySql,
            &quote_mysql(&self.table),
            &chunk.columns,
            chunk.rows,
            REPLICA_INSERT_ROWS,
            None,
        );
        self.target.execute_batch(&statements).await?;
        Ok(rows)
    }
}
