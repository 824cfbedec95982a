//! Pipeline-wide sync settings.

use super::TableImportance;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deployment mode of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Structural fingerprints are always compared
    #[default]
    Production,
    /// Fingerprint comparison of replicas is skipped
    Development,
}

/// Batch sizes, retry policy and orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Tables at or below this estimated row count are copied in one statement
    pub direct_copy_threshold: u64,
    /// Maximum rows per copy chunk
    pub max_batch_size: u64,
    /// Rows per page in chunked analytics loads
    pub load_chunk_size: u64,
    /// Estimated row count above which the chunked loader is used
    pub chunked_load_row_threshold: u64,
    /// Estimated size in MB above which the chunked loader is used
    pub chunked_load_size_mb: f64,
    /// Worker count for the critical tier
    pub critical_concurrency: usize,
    /// Attempts per statement before giving up
    pub max_retries: u32,
    /// Base delay between attempts (multiplied by the attempt number)
    pub retry_delay_ms: u64,
    /// Minimum spacing between rate-limited queries on one connection
    pub rate_limit_ms: u64,
    /// Deployment mode
    pub environment: Environment,
    /// Tier precedence; tiers not listed are not processed
    pub tier_order: Vec<TableImportance>,
    /// PostgreSQL schema receiving analytics tables
    pub analytics_schema: String,
    /// Name of the load-status table in the analytics schema
    pub status_table: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            direct_copy_threshold: 10_000,
            max_batch_size: 10_000,
            load_chunk_size: 50_000,
            chunked_load_row_threshold: 1_000_000,
            chunked_load_size_mb: 100.0,
            critical_concurrency: 5,
            max_retries: 3,
            retry_delay_ms: 1_000,
            rate_limit_ms: 100,
            environment: Environment::default(),
            tier_order: TableImportance::DEFAULT_ORDER.to_vec(),
            analytics_schema: "public".to_string(),
            status_table: "etl_load_status".to_string(),
        }
    }
}

impl SyncSettings {
    /// Base delay between retries.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Minimum spacing between rate-limited queries.
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    /// Whether replica fingerprints should be compared.
    pub fn compares_fingerprints(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Validates the settings.
    pub fn validate(&self) -> crate::Result<()> {
        let positive = [
            ("direct_copy_threshold", self.direct_copy_threshold),
            ("max_batch_size", self.max_batch_size),
            ("load_chunk_size", self.load_chunk_size),
            ("chunked_load_row_threshold", self.chunked_load_row_threshold),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(crate::error::ReplicationError::configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.critical_concurrency == 0 {
            return Err(crate::error::ReplicationError::configuration(
                "critical_concurrency must be greater than 0",
            ));
        }

        if self.max_retries == 0 {
            return Err(crate::error::ReplicationError::configuration(
                "max_retries must be at least 1",
            ));
        }

        if self.tier_order.is_empty() {
            return Err(crate::error::ReplicationError::configuration(
                "tier_order must name at least one tier",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for tier in &self.tier_order {
            if !seen.insert(*tier) {
                return Err(crate::error::ReplicationError::configuration(format!(
                    "tier '{}' appears more than once in tier_order",
                    tier
                )));
            }
        }

        if self.analytics_schema.is_empty() || self.status_table.is_empty() {
            return Err(crate::error::ReplicationError::configuration(
                "analytics_schema and status_table cannot be empty",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.direct_copy_threshold, 10_000);
        assert_eq!(settings.critical_concurrency, 5);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.rate_limit_interval(), Duration::from_millis(100));
        assert_eq!(settings.tier_order[0], TableImportance::Critical);
        assert!(settings.compares_fingerprints());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_duplicate_tier_rejected() {
        let settings = SyncSettings {
            tier_order: vec![TableImportance::Critical, TableImportance::Critical],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_development_skips_fingerprints() {
        let settings: SyncSettings =
            serde_json::from_str(r#"{"environment": "development"}"#).unwrap();
        assert!(!settings.compares_fingerprints());
    }
}
