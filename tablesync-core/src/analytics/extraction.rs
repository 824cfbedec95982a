//! Full versus incremental extraction.

use super::status::{LoadRecord, LoadStatus, Watermark};
use crate::config::TableConfig;
use crate::schema::{IncrementalColumnCandidate, TableSchema};
use crate::sql::{Dialect, Statement, quote_mysql};
use serde::Serialize;

/// Why a load reads every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullLoadReason {
    /// The caller asked for it
    Forced,
    /// The table is configured as `full_table`
    FullTableStrategy,
    /// No usable incremental column
    NoIncrementalColumn,
    /// The table was never loaded
    NoLoadRecord,
    /// The structure changed since the last load
    SchemaChanged,
    /// The analytics table was just (re)created
    TargetRecreated,
    /// The previous full load did not finish
    PreviousFullIncomplete,
    /// The record has no watermark for an incremental column
    MissingWatermark,
}

/// A column driving incremental extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalColumn {
    /// Column name
    pub name: String,
    /// Whether values are timestamps (otherwise integers)
    pub temporal: bool,
}

/// Rows to read for one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionPlan {
    /// Every row
    Full {
        /// Why
        reason: FullLoadReason,
    },
    /// Rows where every column exceeds its watermark
    Incremental {
        /// Column and exclusive lower bound
        conditions: Vec<(String, Watermark)>,
    },
}

impl ExtractionPlan {
    /// Whether every row is read.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// Columns used for incremental extraction of `schema`.
///
/// Configured columns win; otherwise the best ranked candidate is used.
/// Configured columns that are neither temporal nor integer are skipped.
pub fn resolve_incremental_columns(
    config: &TableConfig,
    candidates: &[IncrementalColumnCandidate],
    schema: &TableSchema,
) -> Vec<IncrementalColumn> {
    if config.incremental_columns.is_empty() {
        return candidates
            .first()
            .map(|candidate| IncrementalColumn {
                name: candidate.column.clone(),
                temporal: candidate.kind.is_temporal(),
            })
            .into_iter()
            .collect();
    }

    config
        .incremental_columns
        .iter()
        .filter_map(|name| match schema.column(name) {
            Some(column) if column.is_temporal() => Some(IncrementalColumn {
                name: name.clone(),
                temporal: true,
            }),
            Some(column) if column.is_integer() => Some(IncrementalColumn {
                name: name.clone(),
                temporal: false,
            }),
            Some(column) => {
                tracing::warn!(
                    "Incremental column '{}.{}' has type {} and cannot carry a watermark",
                    schema.table_name,
                    name,
                    column.column_type
                );
                None
            }
            None => {
                tracing::warn!(
                    "Configured incremental column '{}.{}' does not exist",
                    schema.table_name,
                    name
                );
                None
            }
        })
        .collect()
}

/// Everything the plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    /// Caller requested a full load
    pub force_full: bool,
    /// Table configuration
    pub config: &'a TableConfig,
    /// Resolved incremental columns
    pub columns: &'a [IncrementalColumn],
    /// Stored load state
    pub record: Option<&'a LoadRecord>,
    /// Current structure fingerprint
    pub fingerprint: &'a str,
    /// The analytics table was just created or recreated
    pub target_recreated: bool,
}

/// Chooses between a full and an incremental load.
pub fn plan_extraction(inputs: PlanInputs<'_>) -> ExtractionPlan {
    let full = |reason| ExtractionPlan::Full { reason };

    if inputs.force_full {
        return full(FullLoadReason::Forced);
    }
    if !inputs.config.extraction_strategy.allows_incremental() {
        return full(FullLoadReason::FullTableStrategy);
    }
    if inputs.target_recreated {
        return full(FullLoadReason::TargetRecreated);
    }
    let Some(record) = inputs.record else {
        return full(FullLoadReason::NoLoadRecord);
    };
    if record.status == LoadStatus::FailedFull {
        return full(FullLoadReason::PreviousFullIncomplete);
    }
    if record.schema_hash != inputs.fingerprint {
        return full(FullLoadReason::SchemaChanged);
    }
    if inputs.columns.is_empty() {
        return full(FullLoadReason::NoIncrementalColumn);
    }

    let mut conditions = Vec::with_capacity(inputs.columns.len());
    for column in inputs.columns {
        let watermark = if column.temporal {
            record.last_loaded.map(Watermark::Timestamp)
        } else {
            record.last_key.map(Watermark::Integer)
        };
        match watermark {
            Some(watermark) => conditions.push((column.name.clone(), watermark)),
            None => return full(FullLoadReason::MissingWatermark),
        }
    }
    ExtractionPlan::Incremental { conditions }
}

/// Page of an extraction query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Rows per page
    pub limit: u64,
    /// Rows to skip
    pub offset: u64,
}

/// SELECT against the replica for `plan`.
pub fn extraction_query(
    table: &str,
    columns: &[String],
    plan: &ExtractionPlan,
    order_by: &[String],
    page: Option<Page>,
) -> Statement {
    let mut sql = format!(
        "SELECT {} FROM {}",
        Dialect::MySql.column_list(columns),
        quote_mysql(table)
    );
    let mut params = Vec::new();

    if let ExtractionPlan::Incremental { conditions } = plan
        && !conditions.is_empty()
    {
        let clauses: Vec<String> = conditions
            .iter()
            .map(|(column, watermark)| {
                params.push(watermark.to_cell());
                format!("{} > ?", quote_mysql(column))
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&Dialect::MySql.column_list(order_by));
    }
    if let Some(page) = page {
        sql.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
    }

    Statement::with_params(sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionStrategy;
    use crate::schema::fixtures::patient_schema;
    use crate::schema::rank_incremental_columns;
    use chrono::NaiveDate;

    fn record(hash: &str) -> LoadRecord {
        let at = NaiveDate::from_ymd_opt(2024, 2, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        LoadRecord {
            table_name: "patient".into(),
            last_loaded: Some(at),
            last_key: Some(3),
            rows_loaded: 3,
            status: LoadStatus::Success,
            schema_hash: hash.into(),
            updated_at: at,
        }
    }

    fn inputs<'a>(
        config: &'a TableConfig,
        columns: &'a [IncrementalColumn],
        record: Option<&'a LoadRecord>,
    ) -> PlanInputs<'a> {
        PlanInputs {
            force_full: false,
            config,
            columns,
            record,
            fingerprint: "abc",
            target_recreated: false,
        }
    }

    #[test]
    fn test_default_column_is_top_candidate() {
        let schema = patient_schema();
        let candidates = rank_incremental_columns(&schema.columns);
        let columns = resolve_incremental_columns(&TableConfig::default(), &candidates, &schema);
        assert_eq!(
            columns,
            vec![IncrementalColumn {
                name: "updated_at".into(),
                temporal: true
            }]
        );
    }

    #[test]
    fn test_configured_columns_win() {
        let schema = patient_schema();
        let config = TableConfig::default().with_incremental_columns(["id", "name", "missing"]);
        let columns = resolve_incremental_columns(&config, &[], &schema);
        assert_eq!(
            columns,
            vec![IncrementalColumn {
                name: "id".into(),
                temporal: false
            }]
        );
    }

    #[test]
    fn test_full_load_reasons() {
        let config = TableConfig::default();
        let columns = vec![IncrementalColumn {
            name: "updated_at".into(),
            temporal: true,
        }];
        let current = record("abc");

        let mut forced = inputs(&config, &columns, Some(&current));
        forced.force_full = true;
        assert_eq!(
            plan_extraction(forced),
            ExtractionPlan::Full { reason: FullLoadReason::Forced }
        );

        assert_eq!(
            plan_extraction(inputs(&config, &columns, None)),
            ExtractionPlan::Full { reason: FullLoadReason::NoLoadRecord }
        );

        let stale = record("old");
        assert_eq!(
            plan_extraction(inputs(&config, &columns, Some(&stale))),
            ExtractionPlan::Full { reason: FullLoadReason::SchemaChanged }
        );

        let mut incomplete = record("abc");
        incomplete.status = LoadStatus::FailedFull;
        assert_eq!(
            plan_extraction(inputs(&config, &columns, Some(&incomplete))),
            ExtractionPlan::Full { reason: FullLoadReason::PreviousFullIncomplete }
        );

        assert_eq!(
            plan_extraction(inputs(&config, &[], Some(&current))),
            ExtractionPlan::Full { reason: FullLoadReason::NoIncrementalColumn }
        );

        let full_table = TableConfig::default().with_strategy(ExtractionStrategy::FullTable);
        assert_eq!(
            plan_extraction(inputs(&full_table, &columns, Some(&current))),
            ExtractionPlan::Full { reason: FullLoadReason::FullTableStrategy }
        );
    }

    #[test]
    fn test_incremental_plan_uses_matching_watermarks() {
        let config = TableConfig::default();
        let columns = vec![
            IncrementalColumn {
                name: "updated_at".into(),
                temporal: true,
            },
            IncrementalColumn {
                name: "id".into(),
                temporal: false,
            },
        ];
        let current = record("abc");
        let plan = plan_extraction(inputs(&config, &columns, Some(&current)));
        let ExtractionPlan::Incremental { conditions } = &plan else {
            panic!("expected incremental plan, got {:?}", plan);
        };
        assert_eq!(conditions[0].1, Watermark::Timestamp(current.last_loaded.unwrap()));
        assert_eq!(conditions[1].1, Watermark::Integer(3));

        let statement = extraction_query(
            "patient",
            &["id".to_string(), "updated_at".to_string()],
            &plan,
            &["id".to_string()],
            Some(Page {
                limit: 100,
                offset: 200,
            }),
        );
        assert_eq!(
            statement.sql,
            "SELECT `id`, `updated_at` FROM `patient` WHERE `updated_at` > ? AND `id` > ? \
             ORDER BY `id` LIMIT 100 OFFSET 200"
        );
        assert_eq!(statement.params.len(), 2);
    }

    #[test]
    fn test_missing_watermark_forces_full() {
        let config = TableConfig::default();
        let columns = vec![IncrementalColumn {
            name: "id".into(),
            temporal: false,
        }];
        let mut current = record("abc");
        current.last_key = None;
        assert_eq!(
            plan_extraction(inputs(&config, &columns, Some(&current))),
            ExtractionPlan::Full { reason: FullLoadReason::MissingWatermark }
        );
    }
}
