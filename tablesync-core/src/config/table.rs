//! Per-table configuration.

use serde::{Deserialize, Deserializer, Serialize};

/// Importance tier assigned to a table by the configuration provider.
///
/// The tier decides parallelism and fail-fast behaviour in the pipeline; the
/// core never computes it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TableImportance {
    /// Processed first, in parallel; any failure stops later tiers
    Critical,
    /// Business tables
    Important,
    /// Audit and history tables
    Audit,
    /// Lookup and reference tables
    Reference,
    /// Everything else
    #[default]
    Standard,
}

impl TableImportance {
    /// Tier precedence used when the settings do not override it.
    pub const DEFAULT_ORDER: [TableImportance; 4] = [
        TableImportance::Critical,
        TableImportance::Important,
        TableImportance::Audit,
        TableImportance::Reference,
    ];

    /// Lower-case name as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Important => "important",
            Self::Audit => "audit",
            Self::Reference => "reference",
            Self::Standard => "standard",
        }
    }
}

impl std::fmt::Display for TableImportance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableImportance {
    type Err = crate::error::ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "important" => Ok(Self::Important),
            "audit" => Ok(Self::Audit),
            "reference" => Ok(Self::Reference),
            "standard" => Ok(Self::Standard),
            other => Err(crate::error::ReplicationError::configuration(format!(
                "Unknown table importance '{}'",
                other
            ))),
        }
    }
}

/// How rows are extracted from the replication copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Always reload the whole table
    FullTable,
    /// Extract rows past the last watermark
    #[default]
    Incremental,
    /// Incremental, always paged through the chunked loader
    IncrementalChunked,
}

impl ExtractionStrategy {
    /// Whether watermark-based extraction may be used.
    pub fn allows_incremental(self) -> bool {
        !matches!(self, Self::FullTable)
    }
}

/// Settings for one table, as supplied by the configuration provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Rows per copy chunk for this table
    pub batch_size: u64,
    /// Extraction strategy
    pub extraction_strategy: ExtractionStrategy,
    /// Columns compared against the watermark; empty means "discover"
    #[serde(alias = "incremental_column", deserialize_with = "one_or_many")]
    pub incremental_columns: Vec<String>,
    /// Importance tier
    pub table_importance: TableImportance,
    /// Estimated row count
    pub estimated_rows: u64,
    /// Estimated size in megabytes
    pub estimated_size_mb: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            extraction_strategy: ExtractionStrategy::default(),
            incremental_columns: Vec::new(),
            table_importance: TableImportance::default(),
            estimated_rows: 0,
            estimated_size_mb: 0.0,
        }
    }
}

impl TableConfig {
    /// Builder method to set the importance tier.
    pub fn with_importance(mut self, importance: TableImportance) -> Self {
        self.table_importance = importance;
        self
    }

    /// Builder method to set the extraction strategy.
    pub fn with_strategy(mut self, strategy: ExtractionStrategy) -> Self {
        self.extraction_strategy = strategy;
        self
    }

    /// Builder method to set the incremental columns.
    pub fn with_incremental_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.incremental_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Validates the table settings.
    pub fn validate(&self, table: &str) -> crate::Result<()> {
        if table.is_empty() {
            return Err(crate::error::ReplicationError::configuration(
                "table name cannot be empty",
            ));
        }
        if self.batch_size == 0 {
            return Err(crate::error::ReplicationError::configuration(format!(
                "batch_size for '{}' must be greater than 0",
                table
            )));
        }
        if self.estimated_size_mb < 0.0 {
            return Err(crate::error::ReplicationError::configuration(format!(
                "estimated_size_mb for '{}' cannot be negative",
                table
            )));
        }
        Ok(())
    }
}

/// Accepts either a single string or a list of strings.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Nothing(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(column) if column.is_empty() => Vec::new(),
        OneOrMany::One(column) => vec![column],
        OneOrMany::Many(columns) => columns,
        OneOrMany::Nothing(()) => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_incremental_column() {
        let config: TableConfig = serde_json::from_str(
            r#"{"incremental_column": "updated_at", "table_importance": "critical"}"#,
        )
        .unwrap();
        assert_eq!(config.incremental_columns, vec!["updated_at"]);
        assert_eq!(config.table_importance, TableImportance::Critical);
        assert_eq!(config.batch_size, 10_000);
    }

    #[test]
    fn test_incremental_column_list_and_null() {
        let config: TableConfig =
            serde_json::from_str(r#"{"incremental_columns": ["updated_at", "created_at"]}"#)
                .unwrap();
        assert_eq!(config.incremental_columns.len(), 2);

        let config: TableConfig =
            serde_json::from_str(r#"{"incremental_column": null}"#).unwrap();
        assert!(config.incremental_columns.is_empty());
    }

    #[test]
    fn test_strategy_names() {
        let config: TableConfig =
            serde_json::from_str(r#"{"extraction_strategy": "incremental_chunked"}"#).unwrap();
        assert_eq!(
            config.extraction_strategy,
            ExtractionStrategy::IncrementalChunked
        );
        assert!(!ExtractionStrategy::FullTable.allows_incremental());
    }

    #[test]
    fn test_importance_parse() {
        assert_eq!(
            "Audit".parse::<TableImportance>().unwrap(),
            TableImportance::Audit
        );
        assert!("urgent".parse::<TableImportance>().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(TableConfig::default().validate("patient").is_ok());
        assert!(TableConfig::default().validate("").is_err());
        let config = TableConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate("patient").is_err());
    }
}
