//! Exact structural replicas in the replication database.
//!
//! A table moves through `absent → structure-created → data-copied →
//! verified`. Each step is a separate call and a failure leaves the table in
//! the last completed state; a half-created structure is not rolled back.

mod chunking;
mod transfer;

pub use chunking::{
    ChunkStats, ChunkTransfer, CopyStrategy, RowChunk, copy_by_key_range, copy_by_offset,
    copy_direct,
};
pub use transfer::TableTransfer;

use crate::Result;
use crate::config::SyncSettings;
use crate::error::ReplicationError;
use crate::events;
use crate::schema::{SchemaDiscovery, adapt_create_statement};
use crate::sql::{Statement, quote_mysql};
use serde::Serialize;

/// Result of one copy pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    /// Strategy used
    pub strategy: CopyStrategy,
    /// Rows written to the replica
    pub rows: u64,
    /// Rows per chunk
    pub chunks: Vec<u64>,
}

/// Fingerprints and row counts on both sides of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaCheck {
    /// Source structure fingerprint
    pub source_fingerprint: String,
    /// Replica structure fingerprint
    pub target_fingerprint: String,
    /// Source row count
    pub source_rows: u64,
    /// Replica row count
    pub target_rows: u64,
}

impl ReplicaCheck {
    /// Whether fingerprints and row counts both agree.
    pub fn is_match(&self) -> bool {
        self.source_fingerprint == self.target_fingerprint && self.source_rows == self.target_rows
    }
}

/// Result of replicating one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationOutcome {
    /// Table name
    pub table: String,
    /// Whether the replica structure was (re)created
    pub structure_created: bool,
    /// Rows copied
    pub rows_copied: u64,
    /// Source rows at verification
    pub source_rows: u64,
    /// Replica rows at verification
    pub target_rows: u64,
    /// Whether the structure fingerprints matched
    pub fingerprints_match: bool,
    /// Whether fingerprints and row counts both matched
    pub verified: bool,
}

impl ReplicationOutcome {
    /// Successful only when verification passed.
    pub fn is_success(&self) -> bool {
        self.verified
    }
}

/// Copies tables from the source database into the replication database.
#[derive(Debug)]
pub struct ExactReplicator {
    source: SchemaDiscovery,
    target: SchemaDiscovery,
    settings: SyncSettings,
}

impl ExactReplicator {
    /// Creates a replicator reading through `source` and writing through `target`.
    pub fn new(source: SchemaDiscovery, target: SchemaDiscovery, settings: SyncSettings) -> Self {
        Self {
            source,
            target,
            settings,
        }
    }

    /// Discovery session on the source database.
    pub fn source(&mut self) -> &mut SchemaDiscovery {
        &mut self.source
    }

    /// Discovery session on the replication database.
    pub fn target(&mut self) -> &mut SchemaDiscovery {
        &mut self.target
    }

    /// Drops any replica of `table` and recreates it from the source structure.
    ///
    /// Returns `false` on any failure; the reason is logged.
    pub async fn create_exact_replica(&mut self, table: &str) -> bool {
        match self.try_create_replica(table).await {
            Ok(()) => true,
            Err(e) => {
                events::etl_error(table, "create_replica", &e);
                false
            }
        }
    }

    async fn try_create_replica(&mut self, table: &str) -> Result<()> {
        let schema = self.source.get_table_schema(table).await?;
        let create = adapt_create_statement(&schema.create_statement, table)?;

        self.target.invalidate(table);
        let manager = self.target.manager();
        manager
            .execute(&Statement::new(format!(
                "DROP TABLE IF EXISTS {}",
                quote_mysql(table)
            )))
            .await?;
        manager.execute(&Statement::new(create)).await?;

        tracing::info!("Created replica structure for '{}'", table);
        Ok(())
    }

    /// Replaces the replica's rows with the source's, using the configured
    /// maximum batch size.
    pub async fn copy_table_data(&mut self, table: &str) -> Result<CopyReport> {
        let batch_size = self.settings.max_batch_size;
        self.copy_table_data_in_batches(table, batch_size).await
    }

    /// Replaces the replica's rows with the source's.
    ///
    /// Chunked strategies copy at most `batch_size` rows per transaction,
    /// capped by the configured maximum.
    pub async fn copy_table_data_in_batches(
        &mut self,
        table: &str,
        batch_size: u64,
    ) -> Result<CopyReport> {
        let schema = self.source.get_table_schema(table).await?;
        let row_count = self.source.row_count(table).await?;
        let strategy =
            CopyStrategy::choose(row_count, self.settings.direct_copy_threshold, &schema);
        let batch_size = batch_size.clamp(1, self.settings.max_batch_size.max(1));

        self.target
            .manager()
            .execute(&Statement::new(format!(
                "TRUNCATE TABLE {}",
                quote_mysql(table)
            )))
            .await?;

        tracing::info!(
            "Copying {} rows of '{}' using {:?} strategy",
            row_count,
            table,
            strategy
        );

        let mut transfer = TableTransfer::new(self.source.manager(), self.target.manager(), &schema);
        let stats = match strategy {
            CopyStrategy::Direct => copy_direct(&mut transfer).await?,
            CopyStrategy::KeyRange => copy_by_key_range(&mut transfer, batch_size).await?,
            CopyStrategy::OrderedOffset | CopyStrategy::UnorderedOffset => {
                if strategy == CopyStrategy::UnorderedOffset {
                    tracing::warn!(
                        "Table '{}' has no primary key; offset paging may skip or repeat rows under concurrent writes",
                        table
                    );
                }
                copy_by_offset(&mut transfer, batch_size).await?
            }
        };

        tracing::info!(
            "Copied {} rows of '{}' in {} chunk(s)",
            stats.rows,
            table,
            stats.chunks.len()
        );
        Ok(CopyReport {
            strategy,
            rows: stats.rows,
            chunks: stats.chunks,
        })
    }

    /// Compares structure fingerprints and row counts of source and replica.
    pub async fn verify_exact_replica(&mut self, table: &str) -> Result<ReplicaCheck> {
        self.source.invalidate(table);
        self.target.invalidate(table);
        let check = ReplicaCheck {
            source_fingerprint: self.source.current_fingerprint(table).await?,
            target_fingerprint: self.target.current_fingerprint(table).await?,
            source_rows: self.source.row_count(table).await?,
            target_rows: self.target.row_count(table).await?,
        };
        if !check.is_match() {
            tracing::warn!(
                "Replica of '{}' does not match: fingerprints {} / {}, rows {} / {}",
                table,
                check.source_fingerprint,
                check.target_fingerprint,
                check.source_rows,
                check.target_rows
            );
        }
        Ok(check)
    }

    /// Whether a replica exists with the same structure as the source.
    ///
    /// When `compare_fingerprints` is false only existence is checked.
    pub async fn replica_matches_source(&mut self, table: &str, compare_fingerprints: bool) -> bool {
        match self.target.table_exists(table).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("No replica of '{}' exists yet", table);
                return false;
            }
            Err(e) => {
                tracing::warn!("Could not check replica of '{}': {}", table, e);
                return false;
            }
        }
        if !compare_fingerprints {
            return true;
        }

        let source_fingerprint = match self.source.current_fingerprint(table).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::warn!("Could not fingerprint source '{}': {}", table, e);
                return false;
            }
        };
        !self.target.has_schema_changed(table, &source_fingerprint).await
    }

    /// Runs the full replication sequence for one table.
    ///
    /// When `rebuild` is set the structure is recreated first. Data is always
    /// recopied and then verified.
    pub async fn replicate(
        &mut self,
        table: &str,
        batch_size: u64,
        rebuild: bool,
    ) -> Result<ReplicationOutcome> {
        if rebuild {
            self.try_create_replica(table).await?;
        }
        let report = self.copy_table_data_in_batches(table, batch_size).await?;
        let check = self.verify_exact_replica(table).await?;

        let outcome = ReplicationOutcome {
            table: table.to_string(),
            structure_created: rebuild,
            rows_copied: report.rows,
            source_rows: check.source_rows,
            target_rows: check.target_rows,
            fingerprints_match: check.source_fingerprint == check.target_fingerprint,
            verified: check.is_match(),
        };
        if !outcome.is_success() {
            return Err(ReplicationError::verification(
                table,
                format!(
                    "replica check failed (fingerprints match: {}, rows {} vs {})",
                    outcome.fingerprints_match, outcome.source_rows, outcome.target_rows
                ),
            ));
        }
        Ok(outcome)
    }

    /// Returns both connections to their pools.
    pub fn close(&mut self) {
        self.source.manager().close_connection();
        self.target.manager().close_connection();
    }
}
