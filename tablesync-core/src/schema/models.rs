//! Table structure snapshots.

use serde::{Deserialize, Serialize};

/// Role a column plays in the table's keys (`COLUMN_KEY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKey {
    /// Part of the primary key
    Primary,
    /// First column of a unique index
    Unique,
    /// First column of a non-unique index
    Multiple,
    /// Not indexed
    #[default]
    None,
}

impl ColumnKey {
    /// Parses MySQL's `COLUMN_KEY` value.
    pub fn from_mysql(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "PRI" => Self::Primary,
            "UNI" => Self::Unique,
            "MUL" => Self::Multiple,
            _ => Self::None,
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Base type name, lower case (`int`, `varchar`, ...)
    pub data_type: String,
    /// Full declared type (`int unsigned`, `varchar(255)`, `tinyint(1)`)
    pub column_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Default expression as reported by the server
    pub default: Option<String>,
    /// Key role
    pub key: ColumnKey,
    /// Extra attributes (`auto_increment`, `on update CURRENT_TIMESTAMP`, ...)
    pub extra: String,
    /// 1-based declaration position
    pub ordinal_position: u32,
    /// Maximum length for character types
    pub character_maximum_length: Option<u64>,
    /// Precision for numeric types
    pub numeric_precision: Option<u64>,
    /// Scale for numeric types
    pub numeric_scale: Option<u64>,
}

impl ColumnInfo {
    /// Whether the column is filled by `AUTO_INCREMENT`.
    pub fn is_auto_increment(&self) -> bool {
        self.extra.to_lowercase().contains("auto_increment")
    }

    /// Whether the declared type is unsigned.
    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_lowercase().contains("unsigned")
    }

    /// Whether the base type is one of MySQL's integer types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }

    /// Whether the base type holds a point in time.
    pub fn is_temporal(&self) -> bool {
        matches!(self.data_type.as_str(), "timestamp" | "datetime" | "date")
    }

    /// Whether the server computes the value (`VIRTUAL GENERATED` or
    /// `STORED GENERATED`). Expression defaults (`DEFAULT_GENERATED`) are
    /// still written by clients.
    pub fn is_generated(&self) -> bool {
        let extra = self.extra.to_uppercase();
        extra.contains("GENERATED") && !extra.contains("DEFAULT_GENERATED")
    }
}

/// One index of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name (`PRIMARY` for the primary key)
    pub name: String,
    /// Indexed columns in key order
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Index method (`BTREE`, `FULLTEXT`, ...)
    pub kind: String,
}

impl IndexInfo {
    /// Whether this is the primary key.
    pub fn is_primary(&self) -> bool {
        self.name == "PRIMARY"
    }
}

/// One foreign key column reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    /// Constraint name
    pub constraint_name: String,
    /// Referencing column
    pub column: String,
    /// Referenced table
    pub referenced_table: String,
    /// Referenced column
    pub referenced_column: String,
}

/// Storage-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Storage engine
    pub engine: Option<String>,
    /// Default character set
    pub charset: Option<String>,
    /// Default collation
    pub collation: Option<String>,
    /// Row count estimate from the data dictionary
    pub row_estimate: u64,
}

/// Snapshot of one table's structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub table_name: String,
    /// Raw `SHOW CREATE TABLE` text
    pub create_statement: String,
    /// Columns in declaration order
    pub columns: Vec<ColumnInfo>,
    /// Indexes
    pub indexes: Vec<IndexInfo>,
    /// Foreign keys
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Engine, charset and size estimate
    pub metadata: TableMetadata,
    /// SHA-256 of the normalized structure text
    pub fingerprint: String,
}

impl TableSchema {
    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Columns an INSERT may name, in declaration order.
    pub fn writable_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.is_generated())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Primary key columns in key order; empty when the table has none.
    pub fn primary_key_columns(&self) -> Vec<String> {
        if let Some(index) = self.indexes.iter().find(|i| i.is_primary()) {
            return index.columns.clone();
        }
        self.columns
            .iter()
            .filter(|c| c.key == ColumnKey::Primary)
            .map(|c| c.name.clone())
            .collect()
    }

    /// The primary key column when the key is a single integer column.
    pub fn integer_primary_key(&self) -> Option<&ColumnInfo> {
        match self.primary_key_columns().as_slice() {
            [only] => self.column(only).filter(|c| c.is_integer()),
            _ => None,
        }
    }
}

/// Best-effort size figures for a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSizeInfo {
    /// Row count estimate
    pub row_count: u64,
    /// Bytes used by rows
    pub data_bytes: u64,
    /// Bytes used by indexes
    pub index_bytes: u64,
    /// Sum of data and index bytes
    pub total_bytes: u64,
    /// `data_bytes` in MB
    pub data_mb: f64,
    /// `index_bytes` in MB
    pub index_mb: f64,
    /// `total_bytes` in MB
    pub total_mb: f64,
}

impl TableSizeInfo {
    /// Builds the record from raw byte counts.
    pub fn new(row_count: u64, data_bytes: u64, index_bytes: u64) -> Self {
        const MB: f64 = 1024.0 * 1024.0;
        let total_bytes = data_bytes.saturating_add(index_bytes);
        Self {
            row_count,
            data_bytes,
            index_bytes,
            total_bytes,
            data_mb: data_bytes as f64 / MB,
            index_mb: index_bytes as f64 / MB,
            total_mb: total_bytes as f64 / MB,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn column(name: &str, column_type: &str, position: u32) -> ColumnInfo {
        let data_type = column_type
            .split(['(', ' '])
            .next()
            .unwrap_or(column_type)
            .to_string();
        ColumnInfo {
            name: name.to_string(),
            data_type,
            column_type: column_type.to_string(),
            nullable: true,
            default: None,
            key: ColumnKey::None,
            extra: String::new(),
            ordinal_position: position,
            character_maximum_length: None,
            numeric_precision: None,
            numeric_scale: None,
        }
    }

    pub(crate) fn patient_schema() -> TableSchema {
        let mut id = column("id", "int", 1);
        id.key = ColumnKey::Primary;
        id.nullable = false;
        id.extra = "auto_increment".to_string();
        let mut name = column("name", "varchar(100)", 2);
        name.character_maximum_length = Some(100);
        let is_active = column("is_active", "tinyint(1)", 3);
        let created_at = column("created_at", "datetime", 4);
        let mut updated_at = column("updated_at", "timestamp", 5);
        updated_at.extra = "DEFAULT_GENERATED on update CURRENT_TIMESTAMP".to_string();

        TableSchema {
            table_name: "patient".to_string(),
            create_statement: String::new(),
            columns: vec![id, name, is_active, created_at, updated_at],
            indexes: vec![IndexInfo {
                name: "PRIMARY".to_string(),
                columns: vec!["id".to_string()],
                unique: true,
                kind: "BTREE".to_string(),
            }],
            foreign_keys: Vec::new(),
            metadata: TableMetadata::default(),
            fingerprint: String::new(),
        }
    }
}
