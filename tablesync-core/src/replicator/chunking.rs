//! Copy strategies, independent of the engines rows move between.

use crate::Result;
use crate::error::ReplicationError;
use crate::schema::TableSchema;
use crate::value::CellValue;
use async_trait::async_trait;
use serde::Serialize;

/// How a table's rows are moved into the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStrategy {
    /// Everything in one transaction
    Direct,
    /// Contiguous ranges of a single integer primary key
    KeyRange,
    /// `LIMIT/OFFSET` pages ordered by the primary key columns
    OrderedOffset,
    /// `LIMIT/OFFSET` pages in storage order
    UnorderedOffset,
}

impl CopyStrategy {
    /// Picks the strategy for a table of `row_count` rows.
    ///
    /// Offset strategies are not safe under concurrent writes to the source:
    /// rows can shift between pages. They are only chosen for tables whose
    /// key cannot drive a range scan.
    pub fn choose(row_count: u64, direct_copy_threshold: u64, schema: &TableSchema) -> Self {
        if row_count <= direct_copy_threshold {
            Self::Direct
        } else if schema.integer_primary_key().is_some() {
            Self::KeyRange
        } else if schema.primary_key_columns().is_empty() {
            Self::UnorderedOffset
        } else {
            Self::OrderedOffset
        }
    }
}

/// Rows read in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowChunk {
    /// Column names in cell order
    pub columns: Vec<String>,
    /// Row cells
    pub rows: Vec<Vec<CellValue>>,
    /// Key of the last row, for key-range reads
    pub last_key: Option<i64>,
}

impl RowChunk {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the chunk has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads rows from a source table and writes them to a target table.
#[async_trait]
pub trait ChunkTransfer: Send {
    /// Smallest and largest key, `None` for an empty table.
    async fn key_bounds(&mut self) -> Result<Option<(i64, i64)>>;

    /// Up to `limit` rows with `lower <= key <= upper`, ordered by key.
    async fn fetch_key_range(&mut self, lower: i64, upper: i64, limit: u64) -> Result<RowChunk>;

    /// Up to `limit` rows after skipping `offset`.
    async fn fetch_page(&mut self, offset: u64, limit: u64) -> Result<RowChunk>;

    /// Every row.
    async fn fetch_all(&mut self) -> Result<RowChunk>;

    /// Writes one chunk in its own transaction.
    async fn write_chunk(&mut self, chunk: RowChunk) -> Result<u64>;
}

/// Rows written per chunk, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    /// Row count of every written chunk
    pub chunks: Vec<u64>,
    /// Total rows written
    pub rows: u64,
}

impl ChunkStats {
    fn record(&mut self, rows: u64) {
        self.chunks.push(rows);
        self.rows += rows;
    }
}

/// Copies every row in one chunk.
pub async fn copy_direct<T>(transfer: &mut T) -> Result<ChunkStats>
where
    T: ChunkTransfer + ?Sized,
{
    let mut stats = ChunkStats::default();
    let chunk = transfer.fetch_all().await?;
    if !chunk.is_empty() {
        let rows = chunk.len() as u64;
        transfer.write_chunk(chunk).await?;
        stats.record(rows);
    }
    Ok(stats)
}

/// Copies contiguous key ranges of at most `batch_size` rows.
///
/// Each row is visited exactly once as long as keys do not change while the
/// copy runs.
pub async fn copy_by_key_range<T>(transfer: &mut T, batch_size: u64) -> Result<ChunkStats>
where
    T: ChunkTransfer + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut stats = ChunkStats::default();
    let Some((min_key, max_key)) = transfer.key_bounds().await? else {
        return Ok(stats);
    };

    let mut lower = min_key;
    while lower <= max_key {
        let chunk = transfer.fetch_key_range(lower, max_key, batch_size).await?;
        if chunk.is_empty() {
            break;
        }
        let last_key = chunk.last_key.ok_or_else(|| {
            ReplicationError::conversion("primary key", "chunk row has no integer key value")
        })?;
        if last_key < lower {
            return Err(ReplicationError::conversion(
                "primary key",
                format!("key {} is below the range start {}", last_key, lower),
            ));
        }

        let rows = chunk.len() as u64;
        transfer.write_chunk(chunk).await?;
        stats.record(rows);
        tracing::debug!(
            "Copied key range {}..={} ({} rows)",
            lower,
            last_key,
            rows
        );

        match last_key.checked_add(1) {
            Some(next) => lower = next,
            None => break,
        }
    }
    Ok(stats)
}

/// Copies `LIMIT/OFFSET` pages until a short page is returned.
pub async fn copy_by_offset<T>(transfer: &mut T, batch_size: u64) -> Result<ChunkStats>
where
    T: ChunkTransfer + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut stats = ChunkStats::default();
    let mut offset = 0u64;
    loop {
        let chunk = transfer.fetch_page(offset, batch_size).await?;
        if chunk.is_empty() {
            break;
        }
        let rows = chunk.len() as u64;
        transfer.write_chunk(chunk).await?;
        stats.record(rows);
        offset += rows;
        if rows < batch_size {
            break;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::{column, patient_schema};

    #[test]
    fn test_strategy_selection() {
        let schema = patient_schema();
        assert_eq!(CopyStrategy::choose(3, 10_000, &schema), CopyStrategy::Direct);
        assert_eq!(CopyStrategy::choose(10_000, 10_000, &schema), CopyStrategy::Direct);
        assert_eq!(CopyStrategy::choose(10_001, 10_000, &schema), CopyStrategy::KeyRange);

        let mut composite = patient_schema();
        composite.indexes[0].columns.push("name".to_string());
        assert_eq!(
            CopyStrategy::choose(50_000, 10_000, &composite),
            CopyStrategy::OrderedOffset
        );

        let mut keyless = patient_schema();
        keyless.indexes.clear();
        keyless.columns[0].key = crate::schema::ColumnKey::None;
        assert_eq!(
            CopyStrategy::choose(50_000, 10_000, &keyless),
            CopyStrategy::UnorderedOffset
        );
    }

    #[test]
    fn test_text_key_uses_ordered_offset() {
        let mut schema = patient_schema();
        schema.columns[0] = column("id", "varchar(36)", 1);
        assert_eq!(
            CopyStrategy::choose(20_000, 10_000, &schema),
            CopyStrategy::OrderedOffset
        );
    }
}
