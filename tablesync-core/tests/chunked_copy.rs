//! Chunked copy drivers against an in-memory table.

use async_trait::async_trait;
use proptest::prelude::*;
use std::collections::BTreeMap;
use tablesync_core::Result;
use tablesync_core::replicator::{
    ChunkTransfer, RowChunk, copy_by_key_range, copy_by_offset, copy_direct,
};
use tablesync_core::value::CellValue;

/// Source rows keyed by primary key, plus every row written to the target.
#[derive(Debug, Default)]
struct MemoryTransfer {
    source: BTreeMap<i64, String>,
    written: Vec<i64>,
    transactions: usize,
}

impl MemoryTransfer {
    fn with_keys(keys: impl IntoIterator<Item = i64>) -> Self {
        Self {
            source: keys.into_iter().map(|k| (k, format!("row-{}", k))).collect(),
            ..Default::default()
        }
    }

    fn chunk<'a>(rows: impl Iterator<Item = (&'a i64, &'a String)>) -> RowChunk {
        let rows: Vec<Vec<CellValue>> = rows
            .map(|(k, v)| vec![CellValue::Int(*k), CellValue::Text(v.clone())])
            .collect();
        let last_key = rows.last().and_then(|row| row[0].as_i64());
        RowChunk {
            columns: vec!["id".into(), "name".into()],
            rows,
            last_key,
        }
    }
}

#[async_trait]
impl ChunkTransfer for MemoryTransfer {
    async fn key_bounds(&mut self) -> Result<Option<(i64, i64)>> {
        Ok(self
            .source
            .keys()
            .next()
            .copied()
            .zip(self.source.keys().next_back().copied()))
    }

    async fn fetch_key_range(&mut self, lower: i64, upper: i64, limit: u64) -> Result<RowChunk> {
        Ok(Self::chunk(self.source.range(lower..=upper).take(limit as usize)))
    }

    async fn fetch_page(&mut self, offset: u64, limit: u64) -> Result<RowChunk> {
        Ok(Self::chunk(
            self.source.iter().skip(offset as usize).take(limit as usize),
        ))
    }

    async fn fetch_all(&mut self) -> Result<RowChunk> {
        Ok(Self::chunk(self.source.iter()))
    }

    async fn write_chunk(&mut self, chunk: RowChunk) -> Result<u64> {
        self.transactions += 1;
        for row in &chunk.rows {
            if let Some(key) = row[0].as_i64() {
                self.written.push(key);
            }
        }
        Ok(chunk.len() as u64)
    }
}

fn assert_exact_copy(transfer: &MemoryTransfer) {
    let mut written = transfer.written.clone();
    written.sort_unstable();
    let expected: Vec<i64> = transfer.source.keys().copied().collect();
    assert_eq!(written, expected);
}

#[tokio::test]
async fn test_key_range_chunks_of_large_table() {
    let mut transfer = MemoryTransfer::with_keys(1..=25_000);
    let stats = copy_by_key_range(&mut transfer, 10_000).await.unwrap();

    assert_eq!(stats.chunks, vec![10_000, 10_000, 5_000]);
    assert_eq!(stats.rows, 25_000);
    assert_eq!(transfer.transactions, 3);
    assert_exact_copy(&transfer);
}

#[tokio::test]
async fn test_key_range_with_gaps() {
    let keys = [1, 2, 3, 100, 101, 5_000, 5_001, 5_002, 9_999_999];
    let mut transfer = MemoryTransfer::with_keys(keys);
    let stats = copy_by_key_range(&mut transfer, 2).await.unwrap();

    assert_eq!(stats.chunks, vec![2, 2, 2, 2, 1]);
    assert_exact_copy(&transfer);
}

#[tokio::test]
async fn test_key_range_at_integer_limit() {
    let mut transfer = MemoryTransfer::with_keys([i64::MAX - 1, i64::MAX]);
    let stats = copy_by_key_range(&mut transfer, 1).await.unwrap();
    assert_eq!(stats.rows, 2);
    assert_exact_copy(&transfer);
}

#[tokio::test]
async fn test_empty_table_copies_nothing() {
    let mut transfer = MemoryTransfer::default();
    assert_eq!(copy_by_key_range(&mut transfer, 10).await.unwrap().rows, 0);
    assert_eq!(copy_by_offset(&mut transfer, 10).await.unwrap().rows, 0);
    assert_eq!(copy_direct(&mut transfer).await.unwrap().rows, 0);
    assert_eq!(transfer.transactions, 0);
}

#[tokio::test]
async fn test_offset_pages_stop_on_short_page() {
    let mut transfer = MemoryTransfer::with_keys(1..=25);
    let stats = copy_by_offset(&mut transfer, 10).await.unwrap();
    assert_eq!(stats.chunks, vec![10, 10, 5]);
    assert_exact_copy(&transfer);
}

#[tokio::test]
async fn test_direct_copy_is_one_transaction() {
    let mut transfer = MemoryTransfer::with_keys(1..=3);
    let stats = copy_direct(&mut transfer).await.unwrap();
    assert_eq!(stats.chunks, vec![3]);
    assert_eq!(transfer.transactions, 1);
}

fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn key_range_copy_is_complete(
        keys in prop::collection::btree_set(-1_000i64..1_000, 1..200),
        divisor in prop::sample::select(vec![0u8, 1, 2, 3]),
    ) {
        let n = keys.len() as u64;
        let batch_size = match divisor {
            0 => 1,
            1 => (n / 2).max(1),
            2 => n,
            _ => n * 2,
        };

        let mut transfer = MemoryTransfer::with_keys(keys);
        let stats = run(copy_by_key_range(&mut transfer, batch_size)).unwrap();

        prop_assert_eq!(stats.rows, n);
        prop_assert!(stats.chunks.iter().all(|c| *c <= batch_size));
        let mut written = transfer.written.clone();
        written.sort_unstable();
        written.dedup();
        prop_assert_eq!(written.len() as u64, n);
        prop_assert_eq!(transfer.written.len() as u64, n);
    }

    #[test]
    fn offset_copy_is_complete(
        keys in prop::collection::btree_set(0i64..10_000, 1..200),
        batch_size in 1u64..64,
    ) {
        let n = keys.len() as u64;
        let mut transfer = MemoryTransfer::with_keys(keys);
        let stats = run(copy_by_offset(&mut transfer, batch_size)).unwrap();
        prop_assert_eq!(stats.rows, n);
        prop_assert_eq!(transfer.written.len() as u64, n);
    }
}
