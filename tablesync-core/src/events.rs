//! Structured ETL events.
//!
//! Every table-level step reports through these helpers so that a log
//! collector can key on the `event` field. Storage and formatting of the
//! events belong to whatever `tracing` subscriber the binary installs.

use std::time::Instant;

/// Emits `etl_start` for a table operation.
pub fn etl_start(table: &str, op: &str) {
    tracing::info!(event = "etl_start", table, op, "Starting {} for '{}'", op, table);
}

/// Emits `etl_complete` for a table operation.
pub fn etl_complete(table: &str, op: &str, rows: u64) {
    tracing::info!(
        event = "etl_complete",
        table,
        op,
        rows,
        "Completed {} for '{}' ({} rows)",
        op,
        table,
        rows
    );
}

/// Emits `etl_error` for a table operation.
pub fn etl_error(table: &str, op: &str, err: &dyn std::fmt::Display) {
    tracing::error!(
        event = "etl_error",
        table,
        op,
        error = %err,
        "{} failed for '{}': {}",
        op,
        table,
        err
    );
}

/// Emits `schema_drift` when a table's structure no longer matches its copy.
pub fn schema_drift(table: &str, store: &str, detail: &str) {
    tracing::warn!(
        event = "schema_drift",
        table,
        store,
        detail,
        "Structure of '{}' drifted in {}: {}",
        table,
        store,
        detail
    );
}

/// Emits `performance` for a finished operation.
pub fn performance(op: &str, seconds: f64, rows: u64) {
    let rows_per_second = if seconds > 0.0 {
        rows as f64 / seconds
    } else {
        0.0
    };
    tracing::info!(
        event = "performance",
        op,
        seconds,
        rows,
        rows_per_second,
        "{} took {:.2}s for {} rows",
        op,
        seconds,
        rows
    );
}

/// Measures one operation and reports it as a `performance` event.
#[derive(Debug)]
pub struct OperationTimer {
    op: String,
    started: Instant,
}

impl OperationTimer {
    /// Starts timing `op`.
    pub fn start(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            started: Instant::now(),
        }
    }

    /// Seconds since the timer started.
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Emits the `performance` event and returns the elapsed seconds.
    pub fn finish(self, rows: u64) -> f64 {
        let seconds = self.elapsed_secs();
        performance(&self.op, seconds, rows);
        seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_reports_non_negative_duration() {
        let timer = OperationTimer::start("copy_table_data:patient");
        let seconds = timer.finish(3);
        assert!(seconds >= 0.0);
    }
}
