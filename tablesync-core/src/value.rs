//! Cell values moved between engines.
//!
//! Rows read from MySQL are decoded into [`CellValue`]s once and then bound
//! into either MySQL (replication copy) or PostgreSQL (analytics) statements.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Row, TypeInfo};

/// Type carried by a NULL so PostgreSQL can bind it against a typed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    /// BOOLEAN
    Bool,
    /// Any integer type
    Int,
    /// REAL / DOUBLE PRECISION
    Float,
    /// NUMERIC
    Decimal,
    /// Character types
    Text,
    /// BYTEA
    Bytes,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP
    DateTime,
    /// JSONB
    Json,
}

/// One cell of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// SQL NULL of unknown type
    Null,
    /// SQL NULL bound with an explicit type
    TypedNull(NullKind),
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Exact decimal
    Decimal(BigDecimal),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp without time zone (sessions run in UTC)
    DateTime(NaiveDateTime),
    /// JSON document
    Json(serde_json::Value),
}

impl CellValue {
    /// Whether the cell is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::TypedNull(_))
    }

    /// Integer view of the cell, if it holds one that fits `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Timestamp view of the cell; dates are taken at midnight.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(v) => Some(*v),
            Self::Date(v) => v.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Binds the cell into a MySQL query.
    pub fn bind_mysql<'q>(
        self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments> {
        match self {
            Self::Null | Self::TypedNull(_) => query.bind(None::<String>),
            Self::Bool(v) => query.bind(v),
            Self::Int(v) => query.bind(v),
            Self::UInt(v) => query.bind(v),
            Self::Float(v) => query.bind(v),
            Self::Decimal(v) => query.bind(v),
            Self::Text(v) => query.bind(v),
            Self::Bytes(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::DateTime(v) => query.bind(v),
            Self::Json(v) => query.bind(Json(v)),
        }
    }

    /// Binds the cell into a PostgreSQL query.
    pub fn bind_pg<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::TypedNull(kind) => match kind {
                NullKind::Bool => query.bind(None::<bool>),
                NullKind::Int => query.bind(None::<i64>),
                NullKind::Float => query.bind(None::<f64>),
                NullKind::Decimal => query.bind(None::<BigDecimal>),
                NullKind::Text => query.bind(None::<String>),
                NullKind::Bytes => query.bind(None::<Vec<u8>>),
                NullKind::Date => query.bind(None::<NaiveDate>),
                NullKind::Time => query.bind(None::<NaiveTime>),
                NullKind::DateTime => query.bind(None::<NaiveDateTime>),
                NullKind::Json => query.bind(None::<Json<serde_json::Value>>),
            },
            Self::Bool(v) => query.bind(v),
            Self::Int(v) => query.bind(v),
            // PostgreSQL has no unsigned types
            Self::UInt(v) => match i64::try_from(v) {
                Ok(v) => query.bind(v),
                Err(_) => query.bind(BigDecimal::from(v)),
            },
            Self::Float(v) => query.bind(v),
            Self::Decimal(v) => query.bind(v),
            Self::Text(v) => query.bind(v),
            Self::Bytes(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::DateTime(v) => query.bind(v),
            Self::Json(v) => query.bind(Json(v)),
        }
    }

    /// Decodes the cell at `index` of a MySQL row.
    ///
    /// The column's type name selects the preferred Rust type; when that
    /// decode fails a fixed fallback chain is tried before giving up.
    pub fn from_mysql_row(row: &MySqlRow, index: usize) -> crate::Result<Self> {
        let column = row.columns().get(index).ok_or_else(|| {
            crate::error::ReplicationError::conversion(
                format!("#{}", index),
                "column index out of range",
            )
        })?;
        let type_name = column.type_info().name().to_ascii_uppercase();
        let unsigned = type_name.ends_with("UNSIGNED");
        let base = type_name.split_whitespace().next().unwrap_or_default();

        let preferred = match base {
            "NULL" => Some(Self::Null),
            "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => {
                if unsigned {
                    decode_as::<u64>(row, index, Self::UInt)
                        .or_else(|| decode_as::<i64>(row, index, Self::Int))
                } else {
                    decode_as::<i64>(row, index, Self::Int)
                }
            }
            "YEAR" => decode_as::<u16>(row, index, |v| Self::Int(i64::from(v)))
                .or_else(|| decode_as::<i64>(row, index, Self::Int)),
            "BIT" => decode_as::<u64>(row, index, Self::UInt)
                .or_else(|| decode_as::<Vec<u8>>(row, index, Self::Bytes)),
            "FLOAT" => decode_as::<f32>(row, index, |v| Self::Float(f64::from(v))),
            "DOUBLE" | "REAL" => decode_as::<f64>(row, index, Self::Float),
            "DECIMAL" | "NUMERIC" => decode_as::<BigDecimal>(row, index, Self::Decimal),
            "DATE" => decode_as::<NaiveDate>(row, index, Self::Date)
                .or_else(|| decode_unrepresentable_temporal(row, index, base)),
            "TIME" => decode_as::<NaiveTime>(row, index, Self::Time)
                .or_else(|| decode_unrepresentable_temporal(row, index, base)),
            "DATETIME" | "TIMESTAMP" => decode_as::<NaiveDateTime>(row, index, Self::DateTime)
                .or_else(|| {
                    decode_as::<chrono::DateTime<chrono::Utc>>(row, index, |v| {
                        Self::DateTime(v.naive_utc())
                    })
                })
                .or_else(|| decode_unrepresentable_temporal(row, index, base)),
            "JSON" => decode_as::<Json<serde_json::Value>>(row, index, |v| Self::Json(v.0)),
            "CHAR" | "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
            | "SET" => decode_as::<String>(row, index, Self::Text),
            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB"
            | "GEOMETRY" => decode_as::<Vec<u8>>(row, index, Self::Bytes),
            _ => None,
        };

        preferred
            .or_else(|| decode_as::<String>(row, index, Self::Text))
            .or_else(|| decode_as::<Vec<u8>>(row, index, Self::Bytes))
            .or_else(|| decode_as::<i64>(row, index, Self::Int))
            .or_else(|| decode_as::<u64>(row, index, Self::UInt))
            .or_else(|| decode_as::<f64>(row, index, Self::Float))
            .or_else(|| decode_as::<BigDecimal>(row, index, Self::Decimal))
            .or_else(|| decode_as::<NaiveDateTime>(row, index, Self::DateTime))
            .ok_or_else(|| {
                crate::error::ReplicationError::conversion(
                    column.name(),
                    format!("unsupported MySQL type {}", type_name),
                )
            })
    }
}

/// Decodes every cell of a MySQL row in column order.
pub fn decode_mysql_row(row: &MySqlRow) -> crate::Result<Vec<CellValue>> {
    (0..row.len())
        .map(|index| CellValue::from_mysql_row(row, index))
        .collect()
}

/// Column names of a MySQL row in order.
pub fn mysql_column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn decode_as<'r, T>(
    row: &'r MySqlRow,
    index: usize,
    wrap: impl FnOnce(T) -> CellValue,
) -> Option<CellValue>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    match row.try_get::<Option<T>, _>(index) {
        Ok(Some(value)) => Some(wrap(value)),
        Ok(None) => Some(CellValue::Null),
        Err(_) => None,
    }
}

/// Whether `text` is a MySQL date (or datetime) with a zero year, month or
/// day part, such as `0000-00-00` or `2019-04-00 10:00:00`.
pub fn is_zero_date(text: &str) -> bool {
    let date = text.split([' ', 'T']).next().unwrap_or_default();
    let parts: Vec<&str> = date.split('-').collect();
    let [year, month, day] = parts[..] else {
        return false;
    };
    let numeric = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !(numeric(year) && numeric(month) && numeric(day)) {
        return false;
    }
    [year, month, day]
        .iter()
        .any(|part| part.bytes().all(|b| b == b'0'))
}

/// Whether `text` is a MySQL TIME value outside a single day
/// (`-01:30:00`, `36:00:00`).
pub fn is_out_of_day_time(text: &str) -> bool {
    if text.starts_with('-') {
        return true;
    }
    text.split(':')
        .next()
        .and_then(|hours| hours.parse::<u32>().ok())
        .is_some_and(|hours| hours >= 24)
}

/// Reads a DATE, DATETIME, TIMESTAMP or TIME cell chrono rejected.
///
/// Zero dates and TIME values beyond one day are kept as their MySQL text so
/// the replica receives them unchanged; anything else is still undecodable.
fn decode_unrepresentable_temporal(row: &MySqlRow, index: usize, base: &str) -> Option<CellValue> {
    match row.try_get_unchecked::<Option<&[u8]>, _>(index) {
        Ok(Some(raw)) => unrepresentable_temporal(base, raw),
        Ok(None) => Some(CellValue::Null),
        Err(_) => None,
    }
}

fn unrepresentable_temporal(base: &str, raw: &[u8]) -> Option<CellValue> {
    let text = match raw.first() {
        // Text protocol: the server already rendered the value
        Some(first) if first.is_ascii_digit() || *first == b'-' => {
            std::str::from_utf8(raw).ok()?.to_string()
        }
        // Binary protocol: length byte followed by the packed fields
        _ if base == "TIME" => binary_time_text(raw)?,
        _ => binary_date_text(raw, base == "DATE")?,
    };
    let keep = if base == "TIME" {
        is_out_of_day_time(&text)
    } else {
        is_zero_date(&text)
    };
    keep.then_some(CellValue::Text(text))
}

fn binary_date_text(raw: &[u8], date_only: bool) -> Option<String> {
    let len = usize::from(*raw.first()?);
    let fields = raw.get(1..1 + len)?;
    let byte = |i: usize| fields.get(i).copied().unwrap_or(0);
    let year = u16::from_le_bytes([byte(0), byte(1)]);
    let date = format!("{:04}-{:02}-{:02}", year, byte(2), byte(3));
    if date_only {
        return Some(date);
    }
    let mut text = format!("{} {:02}:{:02}:{:02}", date, byte(4), byte(5), byte(6));
    if len >= 11 {
        let micros = u32::from_le_bytes([byte(7), byte(8), byte(9), byte(10)]);
        text.push_str(&format!(".{:06}", micros));
    }
    Some(text)
}

fn binary_time_text(raw: &[u8]) -> Option<String> {
    let len = usize::from(*raw.first()?);
    let fields = raw.get(1..1 + len)?;
    let byte = |i: usize| fields.get(i).copied().unwrap_or(0);
    let negative = byte(0) == 1;
    let days = u32::from_le_bytes([byte(1), byte(2), byte(3), byte(4)]);
    let hours = u64::from(days) * 24 + u64::from(byte(5));
    let mut text = format!(
        "{}{:02}:{:02}:{:02}",
        if negative { "-" } else { "" },
        hours,
        byte(6),
        byte(7)
    );
    if len >= 12 {
        let micros = u32::from_le_bytes([byte(8), byte(9), byte(10), byte(11)]);
        text.push_str(&format!(".{:06}", micros));
    }
    Some(text)
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for CellValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
