//! Whole-pipeline configuration document.

use super::{DatabasesConfig, SyncSettings, TableConfig, TableImportance};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything the pipeline needs, as one JSON document.
///
/// # Example
/// ```rust
/// use tablesync_core::config::{PipelineConfig, TableImportance};
///
/// let config: PipelineConfig = serde_json::from_str(r#"{
///     "databases": {
///         "source": {"url": "mysql://reader@oltp/app"},
///         "replication": {"url": "mysql://writer@replica/app"},
///         "analytics": {"url": "postgres://loader@warehouse/app"}
///     },
///     "tables": {"patient": {"table_importance": "critical"}}
/// }"#).unwrap();
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.tables_in_tier(TableImportance::Critical), vec!["patient"]);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Connection settings per role
    #[serde(default)]
    pub databases: DatabasesConfig,
    /// Pipeline-wide settings
    #[serde(default)]
    pub settings: SyncSettings,
    /// Per-table settings keyed by table name
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

impl PipelineConfig {
    /// Reads a configuration file and applies environment URL overrides.
    ///
    /// The result is validated before it is returned.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::ReplicationError::Io {
                context: format!("Failed to read configuration file {}", path.display()),
                source: e,
            }
        })?;

        let mut config: Self = serde_json::from_str(&contents).map_err(|e| {
            crate::error::ReplicationError::Serialization {
                context: format!("Failed to parse configuration file {}", path.display()),
                source: e,
            }
        })?;

        config.databases.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.databases.validate()?;
        self.settings.validate()?;
        for (table, table_config) in &self.tables {
            table_config.validate(table)?;
        }
        Ok(())
    }

    /// Settings for a table.
    ///
    /// # Errors
    /// Returns a configuration error when the table is not configured.
    pub fn table(&self, table: &str) -> crate::Result<&TableConfig> {
        self.tables.get(table).ok_or_else(|| {
            crate::error::ReplicationError::configuration(format!(
                "No configuration for table '{}'",
                table
            ))
        })
    }

    /// Configured tables in a tier, in name order.
    pub fn tables_in_tier(&self, tier: TableImportance) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|(_, config)| config.table_importance == tier)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "databases": {
            "source": {"url": "mysql://reader:pw@oltp:3306/app", "pool": {"pool_size": 2}},
            "replication": {"url": "mysql://writer:pw@replica:3306/app"},
            "analytics": {"url": "postgres://loader:pw@warehouse:5432/app"}
        },
        "settings": {"max_batch_size": 5000, "critical_concurrency": 3},
        "tables": {
            "patient": {"table_importance": "critical", "incremental_column": "updated_at"},
            "visit": {"table_importance": "critical"},
            "country": {"table_importance": "reference", "extraction_strategy": "full_table"}
        }
    }"#;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = temp_env::with_vars(
            [
                ("TABLESYNC_SOURCE_URL", None::<&str>),
                ("TABLESYNC_REPLICATION_URL", None),
                ("TABLESYNC_ANALYTICS_URL", None),
            ],
            || PipelineConfig::from_file(file.path()).unwrap(),
        );

        assert_eq!(config.databases.source.pool.pool_size, 2);
        assert_eq!(config.settings.max_batch_size, 5000);
        assert_eq!(config.settings.critical_concurrency, 3);
        assert_eq!(
            config.tables_in_tier(TableImportance::Critical),
            vec!["patient", "visit"]
        );
        assert_eq!(
            config.table("patient").unwrap().incremental_columns,
            vec!["updated_at"]
        );
        assert!(config.table("missing").is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = PipelineConfig::from_file("/nonexistent/tablesync.json");
        assert!(matches!(
            result,
            Err(crate::error::ReplicationError::Io { .. })
        ));
    }

    #[test]
    fn test_missing_database_url_is_configuration_error() {
        let config: PipelineConfig = serde_json::from_str(r#"{"tables": {}}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(crate::error::ReplicationError::Configuration { .. })
        ));
    }
}
