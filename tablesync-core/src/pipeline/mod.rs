//! Orchestration of table processing across importance tiers.
//!
//! [`Pipeline`] is the entry point used by the binary. It hands every table
//! to a fresh [`TableProcessor`] with its own connections and lets
//! [`PriorityProcessor`] decide order, parallelism and fail-fast.

mod priority;
mod table;

pub use priority::{PipelineReport, PriorityProcessor, TableOutcome, TableRunner, TierResult};
pub use table::{TableProcessor, TableState};

use crate::Result;
use crate::analytics::AnalyticsLoader;
use crate::config::{PipelineConfig, TableImportance};
use crate::connection::ConnectionFactory;
use crate::schema::SchemaDiscovery;
use async_trait::async_trait;
use std::sync::Arc;

/// Builds a [`TableProcessor`] per table from shared pools.
#[derive(Debug)]
struct FactoryRunner {
    config: Arc<PipelineConfig>,
    factory: ConnectionFactory,
}

#[async_trait]
impl TableRunner for FactoryRunner {
    async fn run_table(&self, table: &str, force_full: bool) -> TableOutcome {
        let table_config = match self.config.table(table) {
            Ok(table_config) => table_config,
            Err(e) => {
                crate::events::etl_error(table, "process_table", &e);
                return TableOutcome::failed(table, TableImportance::default(), e.to_string());
            }
        };
        let mut processor = TableProcessor::new(&self.factory);
        processor
            .process_table(table, table_config, force_full)
            .await
    }
}

/// The configured pipeline.
#[derive(Debug)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    factory: ConnectionFactory,
    processor: PriorityProcessor<FactoryRunner>,
}

impl Pipeline {
    /// Creates the pipeline and its (lazy) connection pools.
    ///
    /// # Errors
    /// Returns a configuration error when the configuration is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let factory = ConnectionFactory::new(&config.databases, &config.settings)?;
        let config = Arc::new(config);
        let runner = Arc::new(FactoryRunner {
            config: Arc::clone(&config),
            factory: factory.clone(),
        });
        let processor = PriorityProcessor::new(
            runner,
            config.settings.tier_order.clone(),
            config.settings.critical_concurrency,
        );
        Ok(Self {
            config,
            factory,
            processor,
        })
    }

    /// The configuration the pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Connection pools shared by every table.
    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// A discovery session on the source database.
    pub fn source_discovery(&self) -> SchemaDiscovery {
        SchemaDiscovery::new(self.factory.source_manager())
    }

    /// Creates the analytics status table when missing.
    pub async fn prepare(&self) -> Result<()> {
        let mut loader = AnalyticsLoader::new(
            SchemaDiscovery::new(self.factory.replication_manager()),
            self.factory.analytics_manager(),
            self.config.settings.clone(),
        );
        let result = loader.ensure_status_table().await;
        loader.close();
        result
    }

    /// Processes every configured table, tier by tier.
    pub async fn run(&self, force_full: bool) -> Result<PipelineReport> {
        self.prepare().await?;
        self.warn_unconfigured_tables().await;

        let tables: Vec<(String, TableImportance)> = self
            .config
            .tables
            .iter()
            .map(|(name, table_config)| (name.clone(), table_config.table_importance))
            .collect();
        Ok(self.processor.process(&tables, force_full).await)
    }

    /// Processes the configured tables of one tier.
    ///
    /// The tier runs even when it is not part of the configured order.
    pub async fn run_tier(&self, tier: TableImportance, force_full: bool) -> Result<TierResult> {
        self.prepare().await?;
        let tables: Vec<String> = self
            .config
            .tables_in_tier(tier)
            .into_iter()
            .map(str::to_string)
            .collect();
        tracing::info!("Running tier {} ({} tables)", tier, tables.len());
        Ok(self.processor.process_tier(tier, &tables, force_full).await)
    }

    /// Processes a single configured table.
    ///
    /// # Errors
    /// Returns a configuration error when the table is not configured.
    pub async fn run_table(&self, table: &str, force_full: bool) -> Result<TableOutcome> {
        let tier = self.config.table(table)?.table_importance;
        self.prepare().await?;
        let result = self
            .processor
            .process_tier(tier, &[table.to_string()], force_full)
            .await;
        result
            .outcomes
            .into_iter()
            .next()
            .ok_or_else(|| crate::ReplicationError::not_found(format!("outcome for '{}'", table)))
    }

    /// Warns about source tables without configuration and returns them.
    ///
    /// When the source cannot be listed the check is reported as unknown and
    /// nothing is returned.
    pub async fn warn_unconfigured_tables(&self) -> Vec<String> {
        let mut discovery = self.source_discovery();
        let source_tables = discovery.discover_all_tables().await;
        discovery.manager().close_connection();

        if source_tables.is_empty() {
            tracing::warn!("Source tables unknown; unconfigured tables cannot be reported");
            return Vec::new();
        }

        let unconfigured: Vec<String> = source_tables
            .into_iter()
            .filter(|table| !self.config.tables.contains_key(table))
            .collect();
        for table in &unconfigured {
            tracing::warn!("Source table '{}' has no configuration and will not be synced", table);
        }
        unconfigured
    }

    /// Closes the connection pools.
    pub async fn close(&self) {
        self.factory.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        serde_json::from_str(
            r#"{
                "databases": {
                    "source": {"url": "mysql://reader:pw@127.0.0.1:3306/app"},
                    "replication": {"url": "mysql://writer:pw@127.0.0.1:3307/app"},
                    "analytics": {"url": "postgres://loader:pw@127.0.0.1:5432/app"}
                },
                "tables": {"patient": {"table_importance": "critical"}}
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pipeline_construction_is_lazy() {
        let pipeline = Pipeline::new(config()).unwrap();
        assert_eq!(pipeline.config().tables.len(), 1);
        assert!(!pipeline.source_discovery().manager().is_connected());
    }

    #[tokio::test]
    async fn test_unknown_table_is_configuration_error() {
        let pipeline = Pipeline::new(config()).unwrap();
        let result = pipeline.run_table("missing", false).await;
        assert!(matches!(
            result,
            Err(crate::ReplicationError::Configuration { .. })
        ));
    }
}
