//! Schema discovery against a MySQL database.
//!
//! [`SchemaDiscovery`] reads table structure from `SHOW CREATE TABLE` and
//! `INFORMATION_SCHEMA`, fingerprints it, and caches the snapshot per table
//! for the lifetime of the instance. Each concurrent worker owns its own
//! instance, so the cache needs no locking.

mod fingerprint;
mod incremental;
mod models;
mod statement;

pub use fingerprint::{compute_fingerprint, normalize_create_statement};
pub use incremental::{
    IncrementalColumnCandidate, IncrementalKind, classify_column, rank_incremental_columns,
};
pub use models::{
    ColumnInfo, ColumnKey, ForeignKeyInfo, IndexInfo, TableMetadata, TableSchema, TableSizeInfo,
};
pub use statement::adapt_create_statement;

#[cfg(test)]
pub(crate) use models::fixtures;

use crate::Result;
use crate::connection::{ConnectionManager, MySqlEngine};
use crate::error::ReplicationError;
use crate::sql::{Statement, quote_mysql};
use sqlx::Row;
use sqlx::mysql::MySqlRow;
use std::collections::HashMap;
use std::sync::Arc;

/// Column name fragments that suggest a yes/no flag.
const FLAG_PREFIXES: &[&str] = &["is_", "has_", "can_", "should_", "allow_", "enable_"];
const FLAG_SUFFIXES: &[&str] = &["_flag", "_enabled", "_active", "_deleted", "_visible"];
const FLAG_NAMES: &[&str] = &["active", "enabled", "deleted", "visible", "archived", "flag"];

/// Whether a column name reads like a yes/no flag.
pub fn looks_like_flag_name(name: &str) -> bool {
    let name = name.to_lowercase();
    FLAG_NAMES.contains(&name.as_str())
        || FLAG_PREFIXES.iter().any(|p| name.starts_with(p))
        || FLAG_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Whether the declared type is narrow enough to hold a flag.
pub fn is_narrow_integer(column: &ColumnInfo) -> bool {
    let column_type = column.column_type.to_lowercase();
    column.data_type == "tinyint" || column_type.starts_with("bit(1)")
}

fn get_column<T>(row: &MySqlRow, column: &str, table: &str) -> Result<T>
where
    T: for<'r> sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>,
{
    row.try_get::<T, _>(column).map_err(|e| {
        ReplicationError::query_failed(
            format!("Failed to read '{}' while inspecting table '{}'", column, table),
            e,
        )
    })
}

fn to_u64(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

/// Reads and caches table structure from one MySQL database.
#[derive(Debug)]
pub struct SchemaDiscovery {
    manager: ConnectionManager<MySqlEngine>,
    cache: HashMap<String, Arc<TableSchema>>,
}

impl SchemaDiscovery {
    /// Creates a discovery session over `manager`.
    pub fn new(manager: ConnectionManager<MySqlEngine>) -> Self {
        Self {
            manager,
            cache: HashMap::new(),
        }
    }

    /// The underlying connection manager, for data queries on the same database.
    pub fn manager(&mut self) -> &mut ConnectionManager<MySqlEngine> {
        &mut self.manager
    }

    /// Drops the cached snapshot for `table`.
    pub fn invalidate(&mut self, table: &str) {
        self.cache.remove(table);
    }

    /// Drops every cached snapshot.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Whether `table` exists as a base table.
    pub async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let statement = Statement::new(
            "SELECT COUNT(*) AS table_count FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND TABLE_TYPE = 'BASE TABLE'",
        )
        .bind(table);
        let row = self.manager.fetch_optional(&statement).await?;
        match row {
            Some(row) => Ok(get_column::<i64>(&row, "table_count", table)? > 0),
            None => Ok(false),
        }
    }

    /// Returns the structure snapshot for `table`, from cache when present.
    ///
    /// # Errors
    /// Returns [`ReplicationError::NotFound`] when the table does not exist and
    /// surfaces any other failure unchanged.
    pub async fn get_table_schema(&mut self, table: &str) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.cache.get(table) {
            return Ok(Arc::clone(schema));
        }

        tracing::debug!("Discovering structure of table '{}'", table);
        if !self.table_exists(table).await? {
            return Err(ReplicationError::not_found(format!("table '{}'", table)));
        }

        let create_statement = self.show_create_table(table).await?;
        let columns = self.collect_columns(table).await?;
        let indexes = self.collect_indexes(table).await?;
        let foreign_keys = self.collect_foreign_keys(table).await?;
        let metadata = self.collect_metadata(table).await?;
        let fingerprint = compute_fingerprint(&create_statement);

        let schema = Arc::new(TableSchema {
            table_name: table.to_string(),
            create_statement,
            columns,
            indexes,
            foreign_keys,
            metadata,
            fingerprint,
        });

        tracing::debug!(
            "Table '{}' has {} columns, {} indexes, fingerprint {}",
            table,
            schema.columns.len(),
            schema.indexes.len(),
            schema.fingerprint
        );
        self.cache.insert(table.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Fingerprint of the table's current structure, bypassing the cache.
    ///
    /// # Errors
    /// Returns [`ReplicationError::NotFound`] when the table does not exist.
    pub async fn current_fingerprint(&mut self, table: &str) -> Result<String> {
        if !self.table_exists(table).await? {
            return Err(ReplicationError::not_found(format!("table '{}'", table)));
        }
        let create_statement = self.show_create_table(table).await?;
        Ok(compute_fingerprint(&create_statement))
    }

    /// Whether the table's structure differs from `stored_fingerprint`.
    ///
    /// Any discovery failure counts as a change.
    pub async fn has_schema_changed(&mut self, table: &str, stored_fingerprint: &str) -> bool {
        self.invalidate(table);
        match self.current_fingerprint(table).await {
            Ok(current) => {
                let changed = current != stored_fingerprint;
                if changed {
                    tracing::info!(
                        "Structure of '{}' changed: {} -> {}",
                        table,
                        stored_fingerprint,
                        current
                    );
                }
                changed
            }
            Err(e) => {
                tracing::warn!(
                    "Could not fingerprint '{}', assuming its structure changed: {}",
                    table,
                    e
                );
                true
            }
        }
    }

    /// Lists base tables of the database.
    ///
    /// Returns an empty list when the database cannot be reached; callers must
    /// read that as "unknown".
    pub async fn discover_all_tables(&mut self) -> Vec<String> {
        let statement = Statement::new(
            "SELECT CAST(TABLE_NAME AS CHAR) AS table_name FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        );
        match self.manager.fetch_all(&statement).await {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>("table_name").ok())
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to list tables: {}", e);
                Vec::new()
            }
        }
    }

    /// Ranked incremental-extraction candidates for `table`.
    pub async fn get_incremental_columns(
        &mut self,
        table: &str,
    ) -> Result<Vec<IncrementalColumnCandidate>> {
        let schema = self.get_table_schema(table).await?;
        Ok(rank_incremental_columns(&schema.columns))
    }

    /// Primary key columns of `table` in key order.
    pub async fn primary_key_columns(&mut self, table: &str) -> Result<Vec<String>> {
        Ok(self.get_table_schema(table).await?.primary_key_columns())
    }

    /// Best-effort size figures; all zero when they cannot be read.
    pub async fn get_table_size_info(&mut self, table: &str) -> TableSizeInfo {
        let statement = Statement::new(
            "SELECT CAST(TABLE_ROWS AS SIGNED) AS table_rows, \
             CAST(DATA_LENGTH AS SIGNED) AS data_length, \
             CAST(INDEX_LENGTH AS SIGNED) AS index_length \
             FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
        )
        .bind(table);

        let row = match self.manager.fetch_optional(&statement).await {
            Ok(Some(row)) => row,
            Ok(None) => return TableSizeInfo::default(),
            Err(e) => {
                tracing::warn!("Failed to read size of '{}': {}", table, e);
                return TableSizeInfo::default();
            }
        };

        let read = |column: &str| {
            row.try_get::<Option<i64>, _>(column)
                .ok()
                .flatten()
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0)
        };
        TableSizeInfo::new(read("table_rows"), read("data_length"), read("index_length"))
    }

    /// Exact row count.
    pub async fn row_count(&mut self, table: &str) -> Result<u64> {
        let statement = Statement::new(format!(
            "SELECT COUNT(*) AS row_count FROM {}",
            quote_mysql(table)
        ));
        let row = self
            .manager
            .fetch_optional(&statement)
            .await?
            .ok_or_else(|| ReplicationError::not_found(format!("row count of '{}'", table)))?;
        let count = get_column::<i64>(&row, "row_count", table)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Whether `column` holds yes/no flags.
    ///
    /// The column must be a narrow integer whose name reads like a flag (or
    /// that is declared `tinyint(1)` / `bit(1)`), and every stored value must
    /// be 0 or 1. Failures answer `false`, which keeps the integer mapping.
    pub async fn is_flag_column(&mut self, table: &str, column: &str) -> bool {
        let schema = match self.get_table_schema(table).await {
            Ok(schema) => schema,
            Err(e) => {
                tracing::debug!("Cannot inspect '{}.{}' for flags: {}", table, column, e);
                return false;
            }
        };
        let Some(info) = schema.column(column) else {
            return false;
        };
        if !is_narrow_integer(info) {
            return false;
        }
        let declared_flag = {
            let column_type = info.column_type.to_lowercase();
            column_type.starts_with("tinyint(1)") || column_type.starts_with("bit(1)")
        };
        if !declared_flag && !looks_like_flag_name(column) {
            return false;
        }

        let quoted = quote_mysql(column);
        let statement = Statement::new(format!(
            "SELECT COUNT(*) AS outside FROM {} WHERE {} IS NOT NULL AND {} NOT IN (0, 1)",
            quote_mysql(table),
            quoted,
            quoted
        ));
        match self.manager.fetch_optional(&statement).await {
            Ok(Some(row)) => row
                .try_get::<i64, _>("outside")
                .map(|outside| outside == 0)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("Flag check failed for '{}.{}': {}", table, column, e);
                false
            }
        }
    }

    async fn show_create_table(&mut self, table: &str) -> Result<String> {
        let statement = Statement::new(format!("SHOW CREATE TABLE {}", quote_mysql(table)));
        let row = self
            .manager
            .fetch_optional(&statement)
            .await?
            .ok_or_else(|| ReplicationError::not_found(format!("table '{}'", table)))?;
        row.try_get::<String, _>(1)
            .or_else(|_| {
                row.try_get::<Vec<u8>, _>(1)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .map_err(|e| {
                ReplicationError::query_failed(
                    format!("Failed to read structure definition of '{}'", table),
                    e,
                )
            })
    }

    async fn collect_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        // Cast to CHAR to avoid VARBINARY type issues in MySQL 8.0+
        let statement = Statement::new(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(DATA_TYPE AS CHAR) AS data_type,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(COLUMN_KEY AS CHAR) AS column_key,
                CAST(EXTRA AS CHAR) AS extra,
                CAST(ORDINAL_POSITION AS SIGNED) AS ordinal_position,
                CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS character_maximum_length,
                CAST(NUMERIC_PRECISION AS SIGNED) AS numeric_precision,
                CAST(NUMERIC_SCALE AS SIGNED) AS numeric_scale
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(table);

        let rows = self.manager.fetch_all(&statement).await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                let nullable: String = get_column(row, "is_nullable", table)?;
                let key: Option<String> = get_column(row, "column_key", table)?;
                let extra: Option<String> = get_column(row, "extra", table)?;
                let position: i64 = get_column(row, "ordinal_position", table)?;
                Ok(ColumnInfo {
                    name: get_column(row, "column_name", table)?,
                    data_type: get_column::<String>(row, "data_type", table)?.to_lowercase(),
                    column_type: get_column::<String>(row, "column_type", table)?.to_lowercase(),
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                    default: get_column(row, "column_default", table)?,
                    key: ColumnKey::from_mysql(key.as_deref().unwrap_or_default()),
                    extra: extra.unwrap_or_default(),
                    ordinal_position: u32::try_from(position).unwrap_or(u32::MAX),
                    character_maximum_length: to_u64(get_column(
                        row,
                        "character_maximum_length",
                        table,
                    )?),
                    numeric_precision: to_u64(get_column(row, "numeric_precision", table)?),
                    numeric_scale: to_u64(get_column(row, "numeric_scale", table)?),
                })
            })
            .collect()
    }

    async fn collect_indexes(&mut self, table: &str) -> Result<Vec<IndexInfo>> {
        let statement = Statement::new(
            r#"
            SELECT
                CAST(INDEX_NAME AS CHAR) AS index_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique,
                CAST(INDEX_TYPE AS CHAR) AS index_type
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(table);

        let rows = self.manager.fetch_all(&statement).await?;
        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &rows {
            let name: String = get_column(row, "index_name", table)?;
            // Functional index parts have no column name
            let column: Option<String> = get_column(row, "column_name", table)?;
            let non_unique: i64 = get_column(row, "non_unique", table)?;
            let kind: Option<String> = get_column(row, "index_type", table)?;

            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.extend(column),
                _ => indexes.push(IndexInfo {
                    name,
                    columns: column.into_iter().collect(),
                    unique: non_unique == 0,
                    kind: kind.unwrap_or_default(),
                }),
            }
        }
        Ok(indexes)
    }

    async fn collect_foreign_keys(&mut self, table: &str) -> Result<Vec<ForeignKeyInfo>> {
        let statement = Statement::new(
            r#"
            SELECT
                CAST(CONSTRAINT_NAME AS CHAR) AS constraint_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(REFERENCED_TABLE_NAME AS CHAR) AS referenced_table,
                CAST(REFERENCED_COLUMN_NAME AS CHAR) AS referenced_column
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
              AND REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION
            "#,
        )
        .bind(table);

        let rows = self.manager.fetch_all(&statement).await?;
        rows.iter()
            .map(|row| -> Result<ForeignKeyInfo> {
                Ok(ForeignKeyInfo {
                    constraint_name: get_column(row, "constraint_name", table)?,
                    column: get_column(row, "column_name", table)?,
                    referenced_table: get_column(row, "referenced_table", table)?,
                    referenced_column: get_column(row, "referenced_column", table)?,
                })
            })
            .collect()
    }

    async fn collect_metadata(&mut self, table: &str) -> Result<TableMetadata> {
        let statement = Statement::new(
            r#"
            SELECT
                CAST(ENGINE AS CHAR) AS engine,
                CAST(TABLE_COLLATION AS CHAR) AS collation,
                CAST(TABLE_ROWS AS SIGNED) AS table_rows
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            "#,
        )
        .bind(table);

        let Some(row) = self.manager.fetch_optional(&statement).await? else {
            return Ok(TableMetadata::default());
        };
        let collation: Option<String> = get_column(&row, "collation", table)?;
        let charset = collation
            .as_deref()
            .and_then(|c| c.split('_').next())
            .map(str::to_string);
        Ok(TableMetadata {
            engine: get_column(&row, "engine", table)?,
            charset,
            collation,
            row_estimate: to_u64(get_column(&row, "table_rows", table)?).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::column;
    use super::*;

    #[test]
    fn test_flag_name_heuristics() {
        for name in ["is_active", "HAS_INSURANCE", "deleted", "email_enabled", "is_deleted"] {
            assert!(looks_like_flag_name(name), "{} should look like a flag", name);
        }
        for name in ["status", "priority", "island", "age"] {
            assert!(!looks_like_flag_name(name), "{} should not look like a flag", name);
        }
    }

    #[test]
    fn test_narrow_integer() {
        assert!(is_narrow_integer(&column("is_active", "tinyint(1)", 1)));
        assert!(is_narrow_integer(&column("level", "tinyint unsigned", 1)));
        assert!(is_narrow_integer(&column("bits", "bit(1)", 1)));
        assert!(!is_narrow_integer(&column("bits", "bit(8)", 1)));
        assert!(!is_narrow_integer(&column("count", "int", 1)));
    }
}
