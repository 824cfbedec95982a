//! Ranking of columns usable as incremental watermarks.

use super::models::ColumnInfo;
use serde::{Deserialize, Serialize};

/// Why a column qualifies for incremental extraction, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalKind {
    /// Temporal column tracking the last modification
    Modification,
    /// Temporal column recording creation
    Creation,
    /// Any other temporal column
    Timestamp,
    /// Auto-increment integer
    AutoIncrement,
    /// Integer audit column such as a version counter
    Audit,
}

impl IncrementalKind {
    /// Whether watermarks for this kind are timestamps.
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Modification | Self::Creation | Self::Timestamp)
    }
}

/// A column ranked by suitability for incremental extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalColumnCandidate {
    /// Column name
    pub column: String,
    /// Base type name
    pub data_type: String,
    /// Ranking category
    pub kind: IncrementalKind,
    /// Declaration position, used to break ties
    pub ordinal_position: u32,
}

const MODIFICATION_NAMES: &[&str] = &[
    "updated",
    "modified",
    "changed",
    "last_update",
    "last_modified",
    "update_time",
    "modification_time",
    "mtime",
    "updatedat",
    "modifiedat",
];

const CREATION_NAMES: &[&str] = &[
    "created",
    "inserted",
    "creation",
    "create_time",
    "date_added",
    "ctime",
    "createdat",
    "insertedat",
];

const AUDIT_NAMES: &[&str] = &["version", "revision", "row_version", "sequence", "seq_no"];

/// Classifies one column; `None` when it is not a candidate.
pub fn classify_column(column: &ColumnInfo) -> Option<IncrementalKind> {
    let name = column.name.to_lowercase();

    if column.is_temporal() {
        let tracks_updates = column.extra.to_lowercase().contains("on update");
        if tracks_updates || MODIFICATION_NAMES.iter().any(|p| name.contains(p)) {
            return Some(IncrementalKind::Modification);
        }
        if CREATION_NAMES.iter().any(|p| name.contains(p)) {
            return Some(IncrementalKind::Creation);
        }
        return Some(IncrementalKind::Timestamp);
    }

    if column.is_integer() {
        if column.is_auto_increment() {
            return Some(IncrementalKind::AutoIncrement);
        }
        if AUDIT_NAMES.iter().any(|p| name == *p || name.ends_with(&format!("_{}", p))) {
            return Some(IncrementalKind::Audit);
        }
    }

    None
}

/// Ranks candidate columns: modification, creation and other timestamps,
/// then auto-increment, then integer audit columns. Ties keep declaration
/// order.
pub fn rank_incremental_columns(columns: &[ColumnInfo]) -> Vec<IncrementalColumnCandidate> {
    let mut candidates: Vec<IncrementalColumnCandidate> = columns
        .iter()
        .filter_map(|column| {
            classify_column(column).map(|kind| IncrementalColumnCandidate {
                column: column.name.clone(),
                data_type: column.data_type.clone(),
                kind,
                ordinal_position: column.ordinal_position,
            })
        })
        .collect();
    candidates.sort_by_key(|c| (c.kind, c.ordinal_position));
    candidates
}
