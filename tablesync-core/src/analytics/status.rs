//! Persisted load state per table.
//!
//! One row per table lives in the status table of the analytics store:
//!
//! | column        | type      |                                   |
//! |---------------|-----------|-----------------------------------|
//! | `table_name`  | TEXT      | primary key                       |
//! | `last_loaded` | TIMESTAMP | temporal watermark                |
//! | `last_key`    | BIGINT    | integer watermark                 |
//! | `rows_loaded` | BIGINT    | rows written by the last success  |
//! | `status`      | TEXT      | `success`, `failed`, `failed_full`|
//! | `schema_hash` | TEXT      | source fingerprint at load time   |
//! | `updated_at`  | TIMESTAMP | time of the last attempt          |
//!
//! Watermarks only move on success; a failed attempt touches `status` and
//! `updated_at` alone.

use crate::Result;
use crate::error::ReplicationError;
use crate::sql::{Dialect, Statement};
use crate::value::{CellValue, NullKind};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

/// Outcome of the last load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Rows and watermark were committed
    Success,
    /// An incremental attempt failed; the old watermark stands
    Failed,
    /// A full load failed part-way; the next attempt must be full
    FailedFull,
}

impl LoadStatus {
    /// Stored text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::FailedFull => "failed_full",
        }
    }

    /// Parses the stored form; unknown values read as [`LoadStatus::Failed`].
    pub fn parse(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "failed_full" => Self::FailedFull,
            _ => Self::Failed,
        }
    }
}

/// Lower bound of an incremental extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Watermark {
    /// Temporal column value
    Timestamp(NaiveDateTime),
    /// Integer column value
    Integer(i64),
}

impl Watermark {
    /// The watermark as a bound parameter.
    pub fn to_cell(self) -> CellValue {
        match self {
            Self::Timestamp(v) => CellValue::DateTime(v),
            Self::Integer(v) => CellValue::Int(v),
        }
    }
}

/// Watermarks reached by one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkPair {
    /// Largest temporal incremental value
    pub last_loaded: Option<NaiveDateTime>,
    /// Largest integer incremental value
    pub last_key: Option<i64>,
}

impl WatermarkPair {
    /// Raises the pair to cover `value`.
    pub fn observe(&mut self, value: &CellValue) {
        if let Some(ts) = value.as_datetime() {
            self.last_loaded = self.last_loaded.max(Some(ts));
        } else if let Some(key) = value.as_i64() {
            self.last_key = self.last_key.max(Some(key));
        }
    }

    /// Keeps values from `previous` where this pair saw nothing.
    pub fn or(self, previous: WatermarkPair) -> WatermarkPair {
        WatermarkPair {
            last_loaded: self.last_loaded.or(previous.last_loaded),
            last_key: self.last_key.or(previous.last_key),
        }
    }
}

/// State of the last load of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRecord {
    /// Table name
    pub table_name: String,
    /// Temporal watermark
    pub last_loaded: Option<NaiveDateTime>,
    /// Integer watermark
    pub last_key: Option<i64>,
    /// Rows written by the last successful load
    pub rows_loaded: u64,
    /// Outcome of the last attempt
    pub status: LoadStatus,
    /// Source fingerprint at the last successful load
    pub schema_hash: String,
    /// Time of the last attempt
    pub updated_at: NaiveDateTime,
}

impl LoadRecord {
    /// Watermarks stored in the record.
    pub fn watermarks(&self) -> WatermarkPair {
        WatermarkPair {
            last_loaded: self.last_loaded,
            last_key: self.last_key,
        }
    }

    /// Decodes a record selected by [`StatusTable::select_record`].
    pub fn from_row(row: &PgRow) -> Result<Self> {
        let read_error = |e: sqlx::Error| ReplicationError::query_failed("Failed to read load record", e);
        let rows_loaded: i64 = row.try_get("rows_loaded").map_err(read_error)?;
        let status: String = row.try_get("status").map_err(read_error)?;
        Ok(Self {
            table_name: row.try_get("table_name").map_err(read_error)?,
            last_loaded: row.try_get("last_loaded").map_err(read_error)?,
            last_key: row.try_get("last_key").map_err(read_error)?,
            rows_loaded: u64::try_from(rows_loaded).unwrap_or(0),
            status: LoadStatus::parse(&status),
            schema_hash: row.try_get("schema_hash").map_err(read_error)?,
            updated_at: row.try_get("updated_at").map_err(read_error)?,
        })
    }
}

/// Statements against the status table.
#[derive(Debug, Clone)]
pub struct StatusTable {
    schema: String,
    table_ref: String,
}

impl StatusTable {
    /// Status table `table` inside `schema`.
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table_ref: Dialect::Postgres.table_ref(Some(schema), table),
        }
    }

    /// Creates the schema and table when missing.
    pub fn create_statements(&self) -> Vec<Statement> {
        vec![
            Statement::new(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                Dialect::Postgres.quote(&self.schema)
            )),
            Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 table_name TEXT PRIMARY KEY, \
                 last_loaded TIMESTAMP NULL, \
                 last_key BIGINT NULL, \
                 rows_loaded BIGINT NOT NULL DEFAULT 0, \
                 status TEXT NOT NULL, \
                 schema_hash TEXT NOT NULL DEFAULT '', \
                 updated_at TIMESTAMP NOT NULL)",
                self.table_ref
            )),
        ]
    }

    /// Selects the record of `table`.
    pub fn select_record(&self, table: &str) -> Statement {
        Statement::new(format!(
            "SELECT table_name, last_loaded, last_key, rows_loaded, status, schema_hash, updated_at \
             FROM {} WHERE table_name = $1",
            self.table_ref
        ))
        .bind(table)
    }

    /// Upserts a successful load.
    pub fn record_success(
        &self,
        table: &str,
        watermarks: WatermarkPair,
        rows_loaded: u64,
        schema_hash: &str,
        now: NaiveDateTime,
    ) -> Statement {
        Statement::new(format!(
            "INSERT INTO {} (table_name, last_loaded, last_key, rows_loaded, status, schema_hash, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (table_name) DO UPDATE SET \
             last_loaded = EXCLUDED.last_loaded, last_key = EXCLUDED.last_key, \
             rows_loaded = EXCLUDED.rows_loaded, status = EXCLUDED.status, \
             schema_hash = EXCLUDED.schema_hash, updated_at = EXCLUDED.updated_at",
            self.table_ref
        ))
        .bind(table)
        .bind(
            watermarks
                .last_loaded
                .map_or(CellValue::TypedNull(NullKind::DateTime), CellValue::DateTime),
        )
        .bind(
            watermarks
                .last_key
                .map_or(CellValue::TypedNull(NullKind::Int), CellValue::Int),
        )
        .bind(i64::try_from(rows_loaded).unwrap_or(i64::MAX))
        .bind(LoadStatus::Success.as_str())
        .bind(schema_hash)
        .bind(now)
    }

    /// Marks a failed attempt without touching watermarks or counts.
    pub fn record_failure(&self, table: &str, status: LoadStatus, now: NaiveDateTime) -> Statement {
        Statement::new(format!(
            "INSERT INTO {} (table_name, status, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (table_name) DO UPDATE SET \
             status = EXCLUDED.status, updated_at = EXCLUDED.updated_at",
            self.table_ref
        ))
        .bind(table)
        .bind(status.as_str())
        .bind(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [LoadStatus::Success, LoadStatus::Failed, LoadStatus::FailedFull] {
            assert_eq!(LoadStatus::parse(status.as_str()), status);
        }
        assert_eq!(LoadStatus::parse("garbage"), LoadStatus::Failed);
    }

    #[test]
    fn test_watermark_observe_keeps_maximum() {
        let mut pair = WatermarkPair::default();
        for value in [
            CellValue::DateTime(at(3)),
            CellValue::DateTime(at(9)),
            CellValue::DateTime(at(5)),
            CellValue::Int(7),
            CellValue::UInt(2),
            CellValue::Null,
            CellValue::Text("ignored".into()),
        ] {
            pair.observe(&value);
        }
        assert_eq!(pair.last_loaded, Some(at(9)));
        assert_eq!(pair.last_key, Some(7));
    }

    #[test]
    fn test_empty_load_keeps_previous_watermark() {
        let previous = WatermarkPair {
            last_loaded: Some(at(4)),
            last_key: Some(10),
        };
        assert_eq!(WatermarkPair::default().or(previous), previous);
    }

    #[test]
    fn test_failure_statement_leaves_watermark_alone() {
        let table = StatusTable::new("public", "etl_load_status");
        let statement = table.record_failure("patient", LoadStatus::Failed, at(1));
        assert!(!statement.sql.contains("last_loaded"));
        assert!(!statement.sql.contains("rows_loaded"));
        assert_eq!(statement.params.len(), 3);
    }

    #[test]
    fn test_success_statement_binds_typed_nulls() {
        let table = StatusTable::new("public", "etl_load_status");
        let statement =
            table.record_success("patient", WatermarkPair::default(), 3, "abc", at(1));
        assert!(statement.sql.starts_with("INSERT INTO \"public\".\"etl_load_status\""));
        assert_eq!(statement.params[1], CellValue::TypedNull(NullKind::DateTime));
        assert_eq!(statement.params[2], CellValue::TypedNull(NullKind::Int));
    }
}
