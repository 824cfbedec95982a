//! MySQL to PostgreSQL type mapping and cell conversion.

use crate::Result;
use crate::error::ReplicationError;
use crate::schema::{ColumnInfo, TableSchema};
use crate::sql::{Dialect, quote_pg};
use crate::value::{CellValue, NullKind, is_out_of_day_time, is_zero_date};
use bigdecimal::BigDecimal;
use std::collections::HashSet;
use std::str::FromStr;

/// Column type in the analytics store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    /// BOOLEAN
    Boolean,
    /// SMALLINT
    SmallInt,
    /// INTEGER
    Integer,
    /// BIGINT
    BigInt,
    /// NUMERIC, optionally with precision and scale
    Numeric(Option<(u64, u64)>),
    /// REAL
    Real,
    /// DOUBLE PRECISION
    Double,
    /// VARCHAR, optionally with a length
    Varchar(Option<u64>),
    /// TEXT
    Text,
    /// TIMESTAMP (without time zone)
    Timestamp,
    /// DATE
    Date,
    /// TIME (without time zone)
    Time,
    /// JSONB
    Jsonb,
    /// BYTEA
    Bytea,
}

impl PgType {
    /// Type as written in DDL.
    pub fn ddl(self) -> String {
        match self {
            Self::Boolean => "BOOLEAN".to_string(),
            Self::SmallInt => "SMALLINT".to_string(),
            Self::Integer => "INTEGER".to_string(),
            Self::BigInt => "BIGINT".to_string(),
            Self::Numeric(Some((precision, scale))) => format!("NUMERIC({},{})", precision, scale),
            Self::Numeric(None) => "NUMERIC".to_string(),
            Self::Real => "REAL".to_string(),
            Self::Double => "DOUBLE PRECISION".to_string(),
            Self::Varchar(Some(length)) => format!("VARCHAR({})", length),
            Self::Varchar(None) => "VARCHAR".to_string(),
            Self::Text => "TEXT".to_string(),
            Self::Timestamp => "TIMESTAMP".to_string(),
            Self::Date => "DATE".to_string(),
            Self::Time => "TIME".to_string(),
            Self::Jsonb => "JSONB".to_string(),
            Self::Bytea => "BYTEA".to_string(),
        }
    }

    /// Type name as reported by `information_schema.columns.data_type`.
    pub fn information_schema_name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Numeric(_) => "numeric",
            Self::Real => "real",
            Self::Double => "double precision",
            Self::Varchar(_) => "character varying",
            Self::Text => "text",
            Self::Timestamp => "timestamp without time zone",
            Self::Date => "date",
            Self::Time => "time without time zone",
            Self::Jsonb => "jsonb",
            Self::Bytea => "bytea",
        }
    }

    /// Type name with length or precision, comparable with
    /// [`pg_column_signature`].
    pub fn column_signature(self) -> String {
        match self {
            Self::Varchar(Some(length)) => format!("character varying({})", length),
            Self::Numeric(Some((precision, scale))) => format!("numeric({},{})", precision, scale),
            other => other.information_schema_name().to_string(),
        }
    }

    /// Type a NULL must carry to bind against this column.
    pub fn null_kind(self) -> NullKind {
        match self {
            Self::Boolean => NullKind::Bool,
            Self::SmallInt | Self::Integer | Self::BigInt => NullKind::Int,
            Self::Numeric(_) => NullKind::Decimal,
            Self::Real | Self::Double => NullKind::Float,
            Self::Varchar(_) | Self::Text => NullKind::Text,
            Self::Timestamp => NullKind::DateTime,
            Self::Date => NullKind::Date,
            Self::Time => NullKind::Time,
            Self::Jsonb => NullKind::Json,
            Self::Bytea => NullKind::Bytes,
        }
    }
}

/// Signature of an existing column as described by
/// `information_schema.columns`.
pub fn pg_column_signature(
    data_type: &str,
    character_maximum_length: Option<i32>,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
) -> String {
    match (data_type, character_maximum_length, numeric_precision) {
        ("character varying", Some(length), _) => format!("character varying({})", length),
        ("numeric", _, Some(precision)) => {
            format!("numeric({},{})", precision, numeric_scale.unwrap_or(0))
        }
        _ => data_type.to_string(),
    }
}

/// Maps a MySQL column to its analytics type.
///
/// `is_flag` decides the `tinyint` ambiguity: confirmed flag columns become
/// BOOLEAN, every other `tinyint` stays an integer.
pub fn map_mysql_column(column: &ColumnInfo, is_flag: bool) -> PgType {
    let unsigned = column.is_unsigned();
    let column_type = column.column_type.to_lowercase();

    match column.data_type.as_str() {
        "tinyint" if is_flag => PgType::Boolean,
        "tinyint" => PgType::SmallInt,
        "smallint" if unsigned => PgType::Integer,
        "smallint" => PgType::SmallInt,
        "mediumint" => PgType::Integer,
        "int" | "integer" if unsigned => PgType::BigInt,
        "int" | "integer" => PgType::Integer,
        "bigint" if unsigned => PgType::Numeric(Some((20, 0))),
        "bigint" => PgType::BigInt,
        "bit" if column_type.starts_with("bit(1)") => PgType::Boolean,
        "bit" => PgType::BigInt,
        "year" => PgType::SmallInt,
        "decimal" | "numeric" => PgType::Numeric(
            column
                .numeric_precision
                .map(|precision| (precision, column.numeric_scale.unwrap_or(0))),
        ),
        "float" => PgType::Real,
        "double" | "real" => PgType::Double,
        "char" | "varchar" => PgType::Varchar(column.character_maximum_length),
        "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" => PgType::Text,
        "datetime" | "timestamp" => PgType::Timestamp,
        "date" => PgType::Date,
        "time" => PgType::Time,
        "json" => PgType::Jsonb,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "geometry"
        | "point" | "linestring" | "polygon" => PgType::Bytea,
        _ => PgType::Text,
    }
}

/// One column of an analytics table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    /// Column name
    pub name: String,
    /// Analytics type
    pub pg_type: PgType,
    /// Whether NULL is allowed
    pub nullable: bool,
}

/// Derives the analytics columns of `schema`; `flag_columns` lists columns
/// confirmed to hold yes/no values.
pub fn derive_target_columns(
    schema: &TableSchema,
    flag_columns: &HashSet<String>,
) -> Vec<TargetColumn> {
    schema
        .columns
        .iter()
        .map(|column| {
            let pg_type = map_mysql_column(column, flag_columns.contains(&column.name));
            // zero dates and multi-day TIME values load as NULL
            let temporal = matches!(pg_type, PgType::Timestamp | PgType::Date | PgType::Time);
            TargetColumn {
                name: column.name.clone(),
                pg_type,
                nullable: column.nullable || temporal,
            }
        })
        .collect()
}

/// `CREATE TABLE` for an analytics table.
pub fn create_table_sql(
    table_ref: &str,
    columns: &[TargetColumn],
    primary_key: &[String],
) -> String {
    let mut definitions: Vec<String> = columns
        .iter()
        .map(|column| {
            let null = if column.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_pg(&column.name), column.pg_type.ddl(), null)
        })
        .collect();
    if !primary_key.is_empty() {
        definitions.push(format!(
            "PRIMARY KEY ({})",
            Dialect::Postgres.column_list(primary_key)
        ));
    }
    format!("CREATE TABLE {} ({})", table_ref, definitions.join(", "))
}

fn render_text(value: CellValue) -> String {
    match value {
        CellValue::Null | CellValue::TypedNull(_) => String::new(),
        CellValue::Bool(v) => v.to_string(),
        CellValue::Int(v) => v.to_string(),
        CellValue::UInt(v) => v.to_string(),
        CellValue::Float(v) => v.to_string(),
        CellValue::Decimal(v) => v.to_string(),
        CellValue::Text(v) => v,
        CellValue::Bytes(v) => String::from_utf8_lossy(&v).into_owned(),
        CellValue::Date(v) => v.to_string(),
        CellValue::Time(v) => v.to_string(),
        CellValue::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        CellValue::Json(v) => v.to_string(),
    }
}

fn bytes_to_i64(column: &str, bytes: &[u8]) -> Result<i64> {
    if bytes.len() > 8 {
        return Err(ReplicationError::conversion(
            column,
            format!("{} byte bit value does not fit BIGINT", bytes.len()),
        ));
    }
    let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    i64::try_from(value)
        .map_err(|_| ReplicationError::conversion(column, "bit value does not fit BIGINT"))
}

/// Converts one cell read from MySQL for a column of type `target`.
///
/// NULLs come back typed. Values the target type cannot hold are errors
/// rather than silently altered.
pub fn convert_cell(column: &str, value: CellValue, target: PgType) -> Result<CellValue> {
    if value.is_null() {
        return Ok(CellValue::TypedNull(target.null_kind()));
    }

    let mismatch = |value: &CellValue| {
        ReplicationError::conversion(
            column,
            format!("cannot store {:?} as {}", value, target.ddl()),
        )
    };

    let converted = match (target, value) {
        (PgType::Boolean, CellValue::Bool(v)) => CellValue::Bool(v),
        (PgType::Boolean, CellValue::Int(v)) if v == 0 || v == 1 => CellValue::Bool(v == 1),
        (PgType::Boolean, CellValue::UInt(v)) if v == 0 || v == 1 => CellValue::Bool(v == 1),
        (PgType::Boolean, CellValue::Bytes(v)) => CellValue::Bool(v.iter().any(|b| *b != 0)),

        (PgType::SmallInt | PgType::Integer | PgType::BigInt, CellValue::Int(v)) => {
            CellValue::Int(v)
        }
        (PgType::SmallInt | PgType::Integer | PgType::BigInt, CellValue::Bool(v)) => {
            CellValue::Int(i64::from(v))
        }
        (PgType::SmallInt | PgType::Integer | PgType::BigInt, CellValue::UInt(v)) => {
            CellValue::Int(i64::try_from(v).map_err(|_| {
                ReplicationError::conversion(column, format!("{} does not fit BIGINT", v))
            })?)
        }
        (PgType::SmallInt | PgType::Integer | PgType::BigInt, CellValue::Bytes(v)) => {
            CellValue::Int(bytes_to_i64(column, &v)?)
        }

        (PgType::Numeric(_), CellValue::Decimal(v)) => CellValue::Decimal(v),
        (PgType::Numeric(_), CellValue::Int(v)) => CellValue::Decimal(BigDecimal::from(v)),
        (PgType::Numeric(_), CellValue::UInt(v)) => CellValue::Decimal(BigDecimal::from(v)),
        (PgType::Numeric(_), CellValue::Float(v)) => {
            CellValue::Decimal(BigDecimal::from_str(&v.to_string()).map_err(|e| {
                ReplicationError::conversion(column, format!("{} is not a number: {}", v, e))
            })?)
        }

        (PgType::Real | PgType::Double, CellValue::Float(v)) => CellValue::Float(v),
        (PgType::Real | PgType::Double, CellValue::Int(v)) => CellValue::Float(v as f64),
        (PgType::Real | PgType::Double, CellValue::UInt(v)) => CellValue::Float(v as f64),
        (PgType::Real | PgType::Double, CellValue::Decimal(v)) => {
            let text = v.to_string();
            CellValue::Float(text.parse::<f64>().map_err(|e| {
                ReplicationError::conversion(column, format!("{} is not a float: {}", text, e))
            })?)
        }

        (PgType::Varchar(_) | PgType::Text, value) => CellValue::Text(render_text(value)),

        (PgType::Timestamp, CellValue::DateTime(v)) => CellValue::DateTime(v),
        (PgType::Timestamp, CellValue::Date(v)) => match v.and_hms_opt(0, 0, 0) {
            Some(midnight) => CellValue::DateTime(midnight),
            None => return Err(mismatch(&CellValue::Date(v))),
        },
        (PgType::Timestamp | PgType::Date, CellValue::Text(v)) if is_zero_date(&v) => {
            CellValue::TypedNull(target.null_kind())
        }
        (PgType::Time, CellValue::Text(v)) if is_out_of_day_time(&v) => {
            tracing::warn!("TIME value {} of '{}' exceeds one day; loaded as NULL", v, column);
            CellValue::TypedNull(NullKind::Time)
        }
        (PgType::Date, CellValue::Date(v)) => CellValue::Date(v),
        (PgType::Date, CellValue::DateTime(v)) => CellValue::Date(v.date()),
        (PgType::Time, CellValue::Time(v)) => CellValue::Time(v),

        (PgType::Jsonb, CellValue::Json(v)) => CellValue::Json(v),
        (PgType::Jsonb, CellValue::Text(v)) => {
            CellValue::Json(serde_json::from_str(&v).map_err(|e| {
                ReplicationError::conversion(column, format!("invalid JSON: {}", e))
            })?)
        }

        (PgType::Bytea, CellValue::Bytes(v)) => CellValue::Bytes(v),
        (PgType::Bytea, CellValue::Text(v)) => CellValue::Bytes(v.into_bytes()),

        (_, value) => return Err(mismatch(&value)),
    };
    Ok(converted)
}

/// Converts a whole row, column by column.
pub fn convert_row(columns: &[TargetColumn], row: Vec<CellValue>) -> Result<Vec<CellValue>> {
    if row.len() != columns.len() {
        return Err(ReplicationError::conversion(
            "*",
            format!("row has {} cells, table has {} columns", row.len(), columns.len()),
        ));
    }
    columns
        .iter()
        .zip(row)
        .map(|(column, value)| convert_cell(&column.name, value, column.pg_type))
        .collect()
}
