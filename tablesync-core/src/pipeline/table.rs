//! Per-table extract and load.

use super::TableOutcome;
use crate::Result;
use crate::analytics::{AnalyticsLoader, LoadMode, LoadOutcome, should_use_chunked_load};
use crate::config::{SyncSettings, TableConfig};
use crate::connection::ConnectionFactory;
use crate::events::{self, OperationTimer};
use crate::replicator::{ExactReplicator, ReplicationOutcome};
use crate::schema::SchemaDiscovery;
use serde::Serialize;

/// Where a table is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    /// Nothing has run yet
    Unstarted,
    /// Copying into the replication database
    Extracting,
    /// Loading into the analytics store
    Loading,
    /// Both stages verified
    Done,
    /// A stage failed; later stages were skipped
    Failed,
}

/// Runs extract then load for one table.
///
/// Each processor owns its own connections, so processors for different
/// tables can run side by side.
#[derive(Debug)]
pub struct TableProcessor {
    replicator: ExactReplicator,
    loader: AnalyticsLoader,
    settings: SyncSettings,
    state: TableState,
}

impl TableProcessor {
    /// Creates a processor with fresh connections from `factory`.
    pub fn new(factory: &ConnectionFactory) -> Self {
        let settings = factory.settings().clone();
        let replicator = ExactReplicator::new(
            SchemaDiscovery::new(factory.source_manager()),
            SchemaDiscovery::new(factory.replication_manager()),
            settings.clone(),
        );
        let loader = AnalyticsLoader::new(
            SchemaDiscovery::new(factory.replication_manager()),
            factory.analytics_manager(),
            settings.clone(),
        );
        Self {
            replicator,
            loader,
            settings,
            state: TableState::Unstarted,
        }
    }

    /// Current state.
    pub fn state(&self) -> TableState {
        self.state
    }

    /// Replicates and loads `table`.
    ///
    /// A missing or structurally different replica forces a full rebuild and
    /// a full load whatever `force_full` says. The first failing stage ends
    /// the call; nothing is retried here.
    pub async fn process_table(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> TableOutcome {
        let timer = OperationTimer::start(format!("process_table:{}", table));
        let tier = config.table_importance;

        events::etl_start(table, "extract");
        self.state = TableState::Extracting;
        let replication = match self.extract(table, config, force_full).await {
            Ok(replication) => {
                events::etl_complete(table, "extract", replication.rows_copied);
                replication
            }
            Err(e) => {
                let outcome = TableOutcome::failed(table, tier, format!("extract: {}", e));
                return self.fail(table, "extract", e, outcome, timer);
            }
        };

        events::etl_start(table, "load");
        self.state = TableState::Loading;
        let load_full = force_full || replication.structure_created;
        let load = match self.load(table, config, load_full).await {
            Ok(load) => {
                events::etl_complete(table, "load", load.rows_loaded);
                load
            }
            Err(e) => {
                let mut outcome = TableOutcome::failed(table, tier, format!("load: {}", e));
                outcome.rows_replicated = replication.rows_copied;
                return self.fail(table, "load", e, outcome, timer);
            }
        };

        self.state = TableState::Done;
        let mut outcome = TableOutcome::succeeded(table, tier);
        outcome.rows_replicated = replication.rows_copied;
        outcome.rows_loaded = load.rows_loaded;
        outcome.full_load = load.mode == LoadMode::Full;
        outcome.warnings = load.warnings;
        outcome.duration_secs = timer.finish(outcome.rows_replicated + outcome.rows_loaded);
        self.close();
        outcome
    }

    async fn extract(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> Result<ReplicationOutcome> {
        let matches = self
            .replicator
            .replica_matches_source(table, self.settings.compares_fingerprints())
            .await;
        let rebuild = force_full || !matches;
        if rebuild && !force_full {
            tracing::info!("Replica of '{}' is missing or out of date; rebuilding", table);
        }
        self.replicator
            .replicate(table, config.batch_size, rebuild)
            .await
    }

    async fn load(
        &mut self,
        table: &str,
        config: &TableConfig,
        force_full: bool,
    ) -> Result<LoadOutcome> {
        let size = self.loader.replica().get_table_size_info(table).await;
        let outcome = if should_use_chunked_load(config, &size, &self.settings) {
            tracing::info!(
                "Using chunked load for '{}' ({} rows, {:.1} MB)",
                table,
                size.row_count,
                size.total_mb
            );
            self.loader
                .load_table_chunked(table, config, force_full)
                .await?
        } else {
            self.loader.load_table(table, config, force_full).await?
        };
        self.loader.verify_load(table).await?;
        Ok(outcome)
    }

    fn fail(
        &mut self,
        table: &str,
        stage: &str,
        error: crate::ReplicationError,
        mut outcome: TableOutcome,
        timer: OperationTimer,
    ) -> TableOutcome {
        events::etl_error(table, stage, &error);
        self.state = TableState::Failed;
        outcome.duration_secs = timer.elapsed_secs();
        self.close();
        outcome
    }

    fn close(&mut self) {
        self.replicator.close();
        self.loader.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseSettings, DatabasesConfig};

    #[tokio::test]
    async fn test_new_processor_is_unstarted() {
        let databases = DatabasesConfig {
            source: DatabaseSettings::new("mysql://reader:pw@127.0.0.1:3306/app"),
            replication: DatabaseSettings::new("mysql://writer:pw@127.0.0.1:3307/app"),
            analytics: DatabaseSettings::new("postgres://loader:pw@127.0.0.1:5432/app"),
        };
        let factory = ConnectionFactory::new(&databases, &SyncSettings::default()).unwrap();
        let processor = TableProcessor::new(&factory);
        assert_eq!(processor.state(), TableState::Unstarted);
    }
}
