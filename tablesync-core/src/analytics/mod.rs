//! Loading replicated tables into the PostgreSQL analytics store.
//!
//! Rows are read from the replication copy, converted cell by cell and
//! written either in full (truncate and insert) or incrementally (rows past
//! the stored watermark, upserted on the primary key). The status row of a
//! table is written in the same transaction as the rows whenever the whole
//! load fits one transaction.

mod extraction;
mod status;
mod types;

pub use extraction::{
    ExtractionPlan, FullLoadReason, IncrementalColumn, Page, PlanInputs, extraction_query,
    plan_extraction, resolve_incremental_columns,
};
pub use status::{LoadRecord, LoadStatus, StatusTable, Watermark, WatermarkPair};
pub use types::{
    PgType, TargetColumn, convert_cell, convert_row, create_table_sql, derive_target_columns,
    map_mysql_column, pg_column_signature,
};

use crate::Result;
use crate::config::{ExtractionStrategy, SyncSettings, TableConfig};
use crate::connection::{ConnectionManager, PostgresEngine};
use crate::error::ReplicationError;
use crate::events;
use crate::schema::{SchemaDiscovery, TableSchema, TableSizeInfo, is_narrow_integer};
use crate::sql::{Dialect, Statement, insert_statements};
use crate::value::{CellValue, decode_mysql_row};
use serde::Serialize;
use sqlx::Row;
use std::collections::HashSet;
use std::sync::Arc;

/// Rows per INSERT statement into the analytics store.
const ANALYTICS_INSERT_ROWS: usize = 5_000;

/// What [`AnalyticsLoader::ensure_target_table`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTableState {
    /// The table did not exist and was created
    Created,
    /// The table exists with the expected columns
    Unchanged,
    /// The columns had drifted; the table was dropped and recreated
    Recreated,
}

/// An analytics table ready to receive rows.
#[derive(Debug, Clone)]
pub struct TargetTable {
    /// What was done to make it ready
    pub state: TargetTableState,
    /// Columns in source order
    pub columns: Vec<TargetColumn>,
}

/// How a load read its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Every row
    Full,
    /// Rows past the watermark
    Incremental,
}

/// Condition worth an operator's attention that did not fail the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadWarning {
    /// Incremental rows were appended to a table without a primary key, so
    /// modified source rows now appear twice until the next full load
    AppendedWithoutPrimaryKey,
}

/// Result of one load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// Table name
    pub table: String,
    /// Full or incremental
    pub mode: LoadMode,
    /// Why the load was full
    pub full_reason: Option<FullLoadReason>,
    /// Rows written
    pub rows_loaded: u64,
    /// Transactions used for row data
    pub chunks: usize,
    /// Watermarks after the load
    pub watermarks: WatermarkPair,
    /// Non-fatal conditions met during the load
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<LoadWarning>,
}

/// Whether the chunked loader should be used for a table.
///
/// The larger of the configured estimate and the measured size counts.
pub fn should_use_chunked_load(
    config: &TableConfig,
    size: &TableSizeInfo,
    settings: &SyncSettings,
) -> bool {
    if config.extraction_strategy == ExtractionStrategy::IncrementalChunked {
        return true;
    }
    let rows = config.estimated_rows.max(size.row_count);
    let size_mb = config.estimated_size_mb.max(size.total_mb);
    rows > settings.chunked_load_row_threshold || size_mb > settings.chunked_load_size_mb
}

struct LoadContext {
    schema: Arc<TableSchema>,
    target: TargetTable,
    plan: ExtractionPlan,
    incremental: Vec<IncrementalColumn>,
    previous: WatermarkPair,
    table_ref: String,
    primary_key: Vec<String>,
}

impl LoadContext {
    fn mode(&self) -> LoadMode {
        if self.plan.is_full() {
            LoadMode::Full
        } else {
            LoadMode::Incremental
        }
    }

    fn full_reason(&self) -> Option<FullLoadReason> {
        match self.plan {
            ExtractionPlan::Full { reason } => Some(reason),
            ExtractionPlan::Incremental { .. } => None,
        }
    }

    fn column_names(&self) -> Vec<String> {
        self.target.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Warnings for a load that wrote `rows` rows under this context.
    fn warnings(&self, table: &str, rows: u64) -> Vec<LoadWarning> {
        if rows == 0 || self.plan.is_full() || !self.primary_key.is_empty() {
            return Vec::new();
        }
        tracing::warn!(
            "'{}' has no primary key; {} incremental row(s) were appended and may duplicate earlier versions",
            table,
            rows
        );
        vec![LoadWarning::AppendedWithoutPrimaryKey]
    }

    fn watermark_indexes(&self) -> Vec<usize> {
        self.incremental
            .iter()
            .filter_map(|column| self.schema.columns.iter().position(|c| c.name == column.name))
            .collect()
    }

    /// `ON CONFLICT` clause for incremental upserts.
    fn upsert_clause(&self) -> Option<String> {
        if self.plan.is_full() || self.primary_key.is_empty() {
            return None;
        }
        let updates: Vec<String> = self
            .target
            .columns
            .iter()
            .filter(|c| !self.primary_key.contains(&c.name))
            .map(|c| {
                let quoted = Dialect::Postgres.quote(&c.name);
                format!("{} = EXCLUDED.{}", quoted, quoted)
            })
            .collect();
        let conflict = Dialect::Postgres.column_list(&self.primary_key);
        if updates.is_empty() {
            Some(format!("ON CONFLICT ({}) DO NOTHING", conflict))
        } else {
            Some(format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                conflict,
                updates.join(", ")
            ))
        }
    }

    /// Converts rows and builds their INSERT statements.
    fn insert_rows(
        &self,
        rows: Vec<Vec<CellValue>>,
        watermarks: &mut WatermarkPair,
    ) -> Result<Vec<Statement>> {
        let indexes = self.watermark_indexes();
        let mut converted = Vec::with_capacity(rows.len());
        for row in rows {
            for index in &indexes {
                if let Some(cell) = row.get(*index) {
                    watermarks.observe(cell);
                }
            }
            converted.push(convert_row(&self.target.columns, row)?);
        }
        let suffix = self.upsert_clause();
        Ok(insert_statements(
            Dialect::Postgres,
            &self.table_ref,
            &self.column_names(),
            converted,
            ANALYTICS_INSERT_ROWS,
            suffix.as_deref(),
        ))
    }

    fn truncate(&self) -> Statement {
        Statement::new(format!("TRUNCATE TABLE {}", self.table_ref))
    }
}

/// Loads tables from the replication copy into the analytics store.
#[derive(Debug)]
pub struct AnalyticsLoader {
    replica: SchemaDiscovery,
    analytics: ConnectionManager<PostgresEngine>,
    settings: SyncSettings,
    status: StatusTable,
}

impl AnalyticsLoader {
    /// Creates a loader reading through `replica` and writing through `analytics`.
    pub fn new(
        replica: SchemaDiscovery,
        analytics: ConnectionManager<PostgresEngine>,
        settings: SyncSettings,
    ) -> Self {
        let status = StatusTable::new(&settings.analytics_schema, &settings.status_table);
        Self {
            replica,
            analytics,
            settings,
            status,
        }
    }

    /// Discovery session on the replication copy.
    pub fn replica(&mut self) -> &mut SchemaDiscovery {
        &mut self.replica
    }

    fn table_ref(&self, table: &str) -> String {
        Dialect::Postgres.table_ref(Some(&self.settings.analytics_schema), table)
    }

    /// Creates the analytics schema and status table when missing.
    pub async fn ensure_status_table(&mut self) -> Result<()> {
        self.analytics
            .execute_batch(&self.status.create_statements())
            .await?;
        Ok(())
    }

    /// Reads the stored load state of `table`.
    pub async fn get_load_record(&mut self, table: &str) -> Result<Option<LoadRecord>> {
        let row = self
            .analytics
            .fetch_optional(&self.status.select_record(table))
            .await?;
        row.as_ref().map(LoadRecord::from_row).transpose()
    }

    /// Makes sure the analytics table exists with the columns derived from
    /// `schema`.
    ///
    /// Existing tables whose column names or types differ are dropped and
    /// recreated, which forces the next load to be full.
    pub async fn ensure_target_table(
        &mut self,
        table: &str,
        schema: &TableSchema,
    ) -> Result<TargetTable> {
        let flags = self.flag_columns(table, schema).await;
        let columns = derive_target_columns(schema, &flags);
        let existing = self.existing_columns(table).await?;

        let state = if existing.is_empty() {
            TargetTableState::Created
        } else {
            let expected: Vec<(String, String)> = columns
                .iter()
                .map(|c| (c.name.clone(), c.pg_type.column_signature()))
                .collect();
            if expected == existing {
                return Ok(TargetTable {
                    state: TargetTableState::Unchanged,
                    columns,
                });
            }
            events::schema_drift(
                table,
                "analytics",
                &format!("columns {:?} differ from expected {:?}", existing, expected),
            );
            TargetTableState::Recreated
        };

        let table_ref = self.table_ref(table);
        let mut statements = vec![Statement::new(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            Dialect::Postgres.quote(&self.settings.analytics_schema)
        ))];
        if state == TargetTableState::Recreated {
            statements.push(Statement::new(format!("DROP TABLE IF EXISTS {}", table_ref)));
        }
        statements.push(Statement::new(create_table_sql(
            &table_ref,
            &columns,
            &schema.primary_key_columns(),
        )));
        self.analytics.execute_batch(&statements).await?;

        tracing::info!("Analytics table '{}' {:?}", table, state);
        Ok(TargetTable { state, columns })
    }

    async fn flag_columns(&mut self, table: &str, schema: &TableSchema) -> HashSet<String> {
        let mut flags = HashSet::new();
        for column in schema.columns.iter().filter(|c| is_narrow_integer(c)) {
            if self.replica.is_flag_column(table, &column.name).await {
                flags.insert(column.name.clone());
            }
        }
        flags
    }

    async fn existing_columns(&mut self, table: &str) -> Result<Vec<(String, String)>> {
        let statement = Statement::new(
            "SELECT column_name::text AS column_name, data_type::text AS data_type, \
             character_maximum_length::int4 AS character_maximum_length, \
             numeric_precision::int4 AS numeric_precision, numeric_scale::int4 AS numeric_scale \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(self.settings.analytics_schema.as_str())
        .bind(table);
        let rows = self.analytics.fetch_all(&statement).await?;
        let read_error = |e: sqlx::Error| {
            ReplicationError::query_failed(
                format!("Failed to read analytics columns of '{}'", table),
                e,
            )
        };
        rows.iter()
            .map(|row| -> Result<(String, String)> {
                let name: String = row.try_get("column_name").map_err(read_error)?;
                let data_type: String = row.try_get("data_type").map_err(read_error)?;
                let signature = pg_column_signature(
                    &data_type,
                    row.try_get("character_maximum_length").map_err(read_error)?,
                    row.try_get("numeric_precision").map_err(read_error)?,
                    row.try_get("numeric_scale").map_err(read_error)?,
                );
                Ok((name, signature))
            })
            .collect()
    }

    async fn prepare(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> Result<LoadContext> {
        self.replica.invalidate(table);
        let schema = self.replica.get_table_schema(table).await?;
        let target = self.ensure_target_table(table, &schema).await?;
        let record = self.get_load_record(table).await?;

        let candidates = self.replica.get_incremental_columns(table).await?;
        let incremental = resolve_incremental_columns(config, &candidates, &schema);
        let plan = plan_extraction(PlanInputs {
            force_full,
            config,
            columns: &incremental,
            record: record.as_ref(),
            fingerprint: &schema.fingerprint,
            target_recreated: target.state != TargetTableState::Unchanged,
        });
        match &plan {
            ExtractionPlan::Full { reason } => {
                tracing::info!("Full load of '{}' ({:?})", table, reason)
            }
            ExtractionPlan::Incremental { conditions } => {
                tracing::info!("Incremental load of '{}' from {:?}", table, conditions)
            }
        }

        Ok(LoadContext {
            primary_key: schema.primary_key_columns(),
            table_ref: self.table_ref(table),
            previous: record.map(|r| r.watermarks()).unwrap_or_default(),
            schema,
            target,
            plan,
            incremental,
        })
    }

    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<Vec<CellValue>>> {
        let rows = self.replica.manager().fetch_all(statement).await?;
        rows.iter().map(decode_mysql_row).collect()
    }

    /// Loads `table` in a single transaction.
    ///
    /// An incremental load that finds no new rows succeeds without touching
    /// the stored record.
    pub async fn load_table(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> Result<LoadOutcome> {
        let ctx = self.prepare(table, config, force_full).await?;
        let result = self.load_prepared(table, &ctx).await;
        if let Err(e) = &result {
            self.record_failure(table, LoadStatus::Failed, e).await;
        }
        result
    }

    async fn load_prepared(&mut self, table: &str, ctx: &LoadContext) -> Result<LoadOutcome> {
        let statement =
            extraction_query(table, &ctx.column_names(), &ctx.plan, &ctx.primary_key, None);
        let rows = self.fetch_rows(&statement).await?;
        let row_count = rows.len() as u64;

        let mut outcome = LoadOutcome {
            table: table.to_string(),
            mode: ctx.mode(),
            full_reason: ctx.full_reason(),
            rows_loaded: row_count,
            chunks: 0,
            watermarks: ctx.previous,
            warnings: Vec::new(),
        };
        if rows.is_empty() && !ctx.plan.is_full() {
            tracing::info!("No new rows for '{}'", table);
            return Ok(outcome);
        }

        let mut reached = WatermarkPair::default();
        let mut statements = Vec::new();
        if ctx.plan.is_full() {
            statements.push(ctx.truncate());
        }
        statements.extend(ctx.insert_rows(rows, &mut reached)?);

        let watermarks = reached.or(ctx.previous);
        statements.push(self.status.record_success(
            table,
            watermarks,
            row_count,
            &ctx.schema.fingerprint,
            chrono::Utc::now().naive_utc(),
        ));
        self.analytics.execute_batch(&statements).await?;

        outcome.chunks = 1;
        outcome.watermarks = watermarks;
        outcome.warnings = ctx.warnings(table, row_count);
        Ok(outcome)
    }

    /// Loads `table` in pages of `load_chunk_size` rows, one transaction per
    /// page.
    ///
    /// A full load truncates inside the first page's transaction. If any page
    /// fails the table is marked `failed_full` (for full loads) so the next
    /// attempt starts over; incremental pages are upserts and can be
    /// replayed.
    pub async fn load_table_chunked(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> Result<LoadOutcome> {
        let ctx = self.prepare(table, config, force_full).await?;
        let result = self.load_prepared_chunked(table, &ctx).await;
        if let Err(e) = &result {
            let status = if ctx.plan.is_full() {
                LoadStatus::FailedFull
            } else {
                LoadStatus::Failed
            };
            self.record_failure(table, status, e).await;
        }
        result
    }

    async fn load_prepared_chunked(
        &mut self,
        table: &str,
        ctx: &LoadContext,
    ) -> Result<LoadOutcome> {
        let limit = self.settings.load_chunk_size.max(1);
        let columns = ctx.column_names();
        let mut reached = WatermarkPair::default();
        let mut rows_loaded = 0u64;
        let mut chunks = 0usize;

        loop {
            let page = Page {
                limit,
                offset: rows_loaded,
            };
            let statement =
                extraction_query(table, &columns, &ctx.plan, &ctx.primary_key, Some(page));
            let rows = self.fetch_rows(&statement).await?;
            let fetched = rows.len() as u64;
            if fetched == 0 && !(chunks == 0 && ctx.plan.is_full()) {
                break;
            }

            let mut statements = Vec::new();
            if chunks == 0 && ctx.plan.is_full() {
                statements.push(ctx.truncate());
            }
            statements.extend(ctx.insert_rows(rows, &mut reached)?);
            self.analytics.execute_batch(&statements).await?;

            chunks += 1;
            rows_loaded += fetched;
            tracing::debug!(
                "Loaded chunk {} of '{}' ({} rows, {} total)",
                chunks,
                table,
                fetched,
                rows_loaded
            );
            if fetched < limit {
                break;
            }
        }

        let mut outcome = LoadOutcome {
            table: table.to_string(),
            mode: ctx.mode(),
            full_reason: ctx.full_reason(),
            rows_loaded,
            chunks,
            watermarks: ctx.previous,
            warnings: Vec::new(),
        };
        if chunks == 0 {
            tracing::info!("No new rows for '{}'", table);
            return Ok(outcome);
        }

        let watermarks = reached.or(ctx.previous);
        self.update_load_status(
            table,
            rows_loaded,
            LoadStatus::Success,
            watermarks,
            &ctx.schema.fingerprint,
        )
        .await?;
        outcome.watermarks = watermarks;
        outcome.warnings = ctx.warnings(table, rows_loaded);
        Ok(outcome)
    }

    /// Writes the status row of `table`.
    ///
    /// A success replaces watermarks, counts and fingerprint; any other
    /// status only updates the status and timestamp.
    pub async fn update_load_status(
        &mut self,
        table: &str,
        rows_loaded: u64,
        status: LoadStatus,
        watermarks: WatermarkPair,
        schema_hash: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        let statement = match status {
            LoadStatus::Success => {
                self.status
                    .record_success(table, watermarks, rows_loaded, schema_hash, now)
            }
            LoadStatus::Failed | LoadStatus::FailedFull => {
                self.status.record_failure(table, status, now)
            }
        };
        self.analytics.execute(&statement).await?;
        Ok(())
    }

    async fn record_failure(&mut self, table: &str, status: LoadStatus, error: &ReplicationError) {
        tracing::warn!("Load of '{}' failed: {}", table, error);
        if let Err(e) = self
            .update_load_status(table, 0, status, WatermarkPair::default(), "")
            .await
        {
            tracing::error!("Could not record failed load of '{}': {}", table, e);
        }
    }

    /// Compares row counts of the replica and the analytics table.
    ///
    /// # Errors
    /// A mismatch is a [`ReplicationError::Verification`]; it is reported,
    /// never corrected.
    pub async fn verify_load(&mut self, table: &str) -> Result<u64> {
        let replica_rows = self.replica.row_count(table).await?;
        let statement = Statement::new(format!(
            "SELECT COUNT(*) AS row_count FROM {}",
            self.table_ref(table)
        ));
        let row = self
            .analytics
            .fetch_optional(&statement)
            .await?
            .ok_or_else(|| ReplicationError::not_found(format!("analytics table '{}'", table)))?;
        let analytics_rows: i64 = row.try_get("row_count").map_err(|e| {
            ReplicationError::query_failed(format!("Failed to count analytics rows of '{}'", table), e)
        })?;
        let analytics_rows = u64::try_from(analytics_rows).unwrap_or(0);

        if replica_rows != analytics_rows {
            return Err(ReplicationError::verification(
                table,
                format!(
                    "replica has {} rows, analytics has {}",
                    replica_rows, analytics_rows
                ),
            ));
        }
        Ok(analytics_rows)
    }

    /// Returns the analytics connection to its pool.
    pub fn close(&mut self) {
        self.analytics.close_connection();
        self.replica.manager().close_connection();
    }
}
