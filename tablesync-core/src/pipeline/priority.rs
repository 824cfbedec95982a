//! Tier-ordered processing with fail-fast on the critical tier.

use crate::analytics::LoadWarning;
use crate::config::TableImportance;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Result of processing one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    /// Table name
    pub table: String,
    /// Tier the table was processed in
    pub tier: TableImportance,
    /// Whether extract, load and both verifications passed
    pub success: bool,
    /// Rows copied into the replica
    pub rows_replicated: u64,
    /// Rows written to the analytics store
    pub rows_loaded: u64,
    /// Whether the analytics load was full
    pub full_load: bool,
    /// Wall-clock seconds
    pub duration_secs: f64,
    /// Reason of failure
    pub error: Option<String>,
    /// Non-fatal conditions reported by the load
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<LoadWarning>,
}

impl TableOutcome {
    fn empty(table: impl Into<String>, tier: TableImportance) -> Self {
        Self {
            table: table.into(),
            tier,
            success: false,
            rows_replicated: 0,
            rows_loaded: 0,
            full_load: false,
            duration_secs: 0.0,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// A successful outcome; counts start at zero.
    pub fn succeeded(table: impl Into<String>, tier: TableImportance) -> Self {
        Self {
            success: true,
            ..Self::empty(table, tier)
        }
    }

    /// A failed outcome with no work recorded.
    pub fn failed(table: impl Into<String>, tier: TableImportance, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(table, tier)
        }
    }
}

/// Aggregate of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierResult {
    /// Tier
    pub tier: TableImportance,
    /// Tables that succeeded
    pub succeeded: Vec<String>,
    /// Tables that failed
    pub failed: Vec<String>,
    /// Tables in the tier
    pub total: usize,
    /// Per-table detail, in configuration order
    pub outcomes: Vec<TableOutcome>,
}

impl TierResult {
    fn from_outcomes(tier: TableImportance, outcomes: Vec<TableOutcome>) -> Self {
        let (succeeded, failed): (Vec<&TableOutcome>, Vec<&TableOutcome>) =
            outcomes.iter().partition(|o| o.success);
        Self {
            tier,
            succeeded: succeeded.iter().map(|o| o.table.clone()).collect(),
            failed: failed.iter().map(|o| o.table.clone()).collect(),
            total: outcomes.len(),
            outcomes,
        }
    }

    /// Whether every table in the tier succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregate of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Identifier attached to the run's log events
    pub run_id: Uuid,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Wall-clock seconds
    pub duration_secs: f64,
    /// Tiers processed, in order
    pub tiers: Vec<TierResult>,
    /// Whether a critical failure stopped the run
    pub halted: bool,
    /// Tiers not processed because of the halt
    pub skipped_tiers: Vec<TableImportance>,
}

impl PipelineReport {
    /// Whether every processed table succeeded and nothing was skipped.
    pub fn is_success(&self) -> bool {
        !self.halted && self.tiers.iter().all(TierResult::is_success)
    }

    /// Number of failed tables across all tiers.
    pub fn failed_count(&self) -> usize {
        self.tiers.iter().map(|t| t.failed.len()).sum()
    }
}

/// Processes a single table to completion.
///
/// Implementations must give every call its own connections; calls for
/// different tables run concurrently in the critical tier.
#[async_trait]
pub trait TableRunner: Send + Sync + 'static {
    /// Runs extract and load for `table`.
    async fn run_table(&self, table: &str, force_full: bool) -> TableOutcome;
}

/// Runs tiers in precedence order.
#[derive(Debug)]
pub struct PriorityProcessor<R> {
    runner: Arc<R>,
    tier_order: Vec<TableImportance>,
    critical_concurrency: usize,
}

impl<R: TableRunner> PriorityProcessor<R> {
    /// Creates a processor over `runner`.
    pub fn new(runner: Arc<R>, tier_order: Vec<TableImportance>, critical_concurrency: usize) -> Self {
        Self {
            runner,
            tier_order,
            critical_concurrency: critical_concurrency.max(1),
        }
    }

    /// Processes `tables` (name and tier) tier by tier.
    ///
    /// Tables in tiers outside the configured order are not processed. A
    /// failure in the critical tier stops every later tier; results gathered
    /// so far are still returned.
    pub async fn process(&self, tables: &[(String, TableImportance)], force_full: bool) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = std::time::Instant::now();

        let mut grouped: Vec<(TableImportance, Vec<String>)> = Vec::new();
        for tier in &self.tier_order {
            let names: Vec<String> = tables
                .iter()
                .filter(|(_, t)| t == tier)
                .map(|(name, _)| name.clone())
                .collect();
            if !names.is_empty() {
                grouped.push((*tier, names));
            }
        }
        for (name, tier) in tables {
            if !self.tier_order.contains(tier) {
                tracing::debug!("Skipping '{}': tier {} is not scheduled", name, tier);
            }
        }

        tracing::info!(%run_id, "Starting run over {} tier(s)", grouped.len());

        let mut report = PipelineReport {
            run_id,
            started_at,
            duration_secs: 0.0,
            tiers: Vec::new(),
            halted: false,
            skipped_tiers: Vec::new(),
        };

        for (position, (tier, names)) in grouped.iter().enumerate() {
            let result = self.process_tier(*tier, names, force_full).await;
            tracing::info!(
                %run_id,
                "Tier {}: {}/{} succeeded",
                tier,
                result.succeeded.len(),
                result.total
            );

            let halt = *tier == TableImportance::Critical && !result.is_success();
            report.tiers.push(result);
            if halt {
                report.halted = true;
                report.skipped_tiers = grouped[position + 1..].iter().map(|(t, _)| *t).collect();
                tracing::error!(
                    %run_id,
                    "Critical tier failed; skipping tiers {:?}",
                    report.skipped_tiers
                );
                break;
            }
        }

        report.duration_secs = timer.elapsed().as_secs_f64();
        report
    }

    /// Processes one tier.
    ///
    /// The critical tier runs up to `critical_concurrency` tables at once
    /// when it has more than one table; every other tier runs one table at
    /// a time.
    pub async fn process_tier(&self, tier: TableImportance, tables: &[String], force_full: bool) -> TierResult {
        let outcomes = if tier == TableImportance::Critical && tables.len() > 1 {
            self.process_concurrently(tier, tables, force_full).await
        } else {
            let mut outcomes = Vec::with_capacity(tables.len());
            for table in tables {
                outcomes.push(self.spawn_table(tier, table.clone(), force_full).await);
            }
            outcomes
        };
        TierResult::from_outcomes(tier, outcomes)
    }

    async fn process_concurrently(
        &self,
        tier: TableImportance,
        tables: &[String],
        force_full: bool,
    ) -> Vec<TableOutcome> {
        let futures = tables.iter().enumerate().map(|(index, table)| {
            let task = self.spawn_table(tier, table.clone(), force_full);
            async move { (index, task.await) }
        });

        let mut outcomes: Vec<(usize, TableOutcome)> = stream::iter(futures)
            .buffer_unordered(self.critical_concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Runs one table on its own task so a panic stays with that table.
    fn spawn_table(
        &self,
        tier: TableImportance,
        table: String,
        force_full: bool,
    ) -> impl std::future::Future<Output = TableOutcome> + Send + 'static {
        let runner = Arc::clone(&self.runner);
        async move {
            let handle = {
                let table = table.clone();
                tokio::spawn(async move { runner.run_table(&table, force_full).await })
            };
            match handle.await {
                Ok(mut outcome) => {
                    outcome.tier = tier;
                    outcome
                }
                Err(e) => {
                    tracing::error!("Task for '{}' did not complete: {}", table, e);
                    TableOutcome::failed(table, tier, format!("task did not complete: {}", e))
                }
            }
        }
    }
}
