//! In-memory table
//!
//! Holds rows in a vector and keeps one sorted permutation per index.
//! Statistics are computed from the data and are exact unless overridden,
//! which makes the table useful both as a small embedded source and as a
//! deterministic fixture for plan-choice tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::{KeyInfo, TableDef};
use crate::executor::{Datum, Row};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::traits::{KeyRange, RowCursor, RowId, ScanDirection, TableSource};

/// Page size used to turn data volume into scan cost
pub const PAGE_SIZE: usize = 8192;

/// In-memory table with computed statistics
pub struct MemoryTable {
    def: TableDef,
    keys: Vec<KeyInfo>,
    rows: Vec<Row>,
    /// Per index: row positions sorted by key, then row id
    index_order: Vec<Vec<usize>>,
    /// Per index: average rows per distinct key prefix, by prefix length - 1
    rows_per_key: Vec<Vec<f64>>,
    estimated_rows: Option<u64>,
    reads: Arc<AtomicU64>,
    fail_after: Option<u64>,
}

impl MemoryTable {
    /// Create a table holding `rows`, which must match the definition's width
    pub fn new(def: TableDef, rows: Vec<Row>) -> StorageResult<Self> {
        let keys = def
            .key_infos()
            .map_err(|e| StorageError::Schema(e.to_string()))?;
        let width = def.columns.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Err(StorageError::Schema(format!(
                "row {} of '{}' has {} values, expected {}",
                bad,
                def.name,
                rows[bad].len(),
                width
            )));
        }

        let mut index_order = Vec::with_capacity(keys.len());
        let mut rows_per_key = Vec::with_capacity(keys.len());
        for key in &keys {
            let mut order: Vec<usize> = (0..rows.len()).collect();
            order.sort_by(|&a, &b| {
                key_of(&rows[a], key)
                    .cmp(&key_of(&rows[b], key))
                    .then(a.cmp(&b))
            });
            let per_prefix = (1..=key.key_parts())
                .map(|len| {
                    let distinct: HashSet<Vec<Datum>> = rows
                        .iter()
                        .map(|r| key_of(r, key)[..len].to_vec())
                        .collect();
                    if distinct.is_empty() {
                        1.0
                    } else {
                        rows.len() as f64 / distinct.len() as f64
                    }
                })
                .collect();
            index_order.push(order);
            rows_per_key.push(per_prefix);
        }

        Ok(Self {
            def,
            keys,
            rows,
            index_order,
            rows_per_key,
            estimated_rows: None,
            reads: Arc::new(AtomicU64::new(0)),
            fail_after: None,
        })
    }

    /// Report `rows` as an inexact row-count estimate instead of the real count
    #[must_use]
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Fail every read once `reads` rows have been returned
    #[must_use]
    pub fn with_failure_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Rows returned so far by all cursors of this table
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn key(&self, index: usize) -> StorageResult<&KeyInfo> {
        self.keys.get(index).ok_or_else(|| StorageError::UnknownIndex {
            table: self.def.name.clone(),
            index,
        })
    }

    fn cursor(&self, positions: impl IntoIterator<Item = usize>) -> Box<dyn RowCursor> {
        let rows = positions
            .into_iter()
            .map(|pos| (pos as RowId, self.rows[pos].clone()))
            .collect::<Vec<_>>();
        Box::new(MemoryCursor {
            table: self.def.name.clone(),
            rows: rows.into_iter(),
            reads: Arc::clone(&self.reads),
            fail_after: self.fail_after,
        })
    }

    fn ordered(&self, index: usize) -> StorageResult<(&KeyInfo, &[usize])> {
        let key = self.key(index)?;
        Ok((key, &self.index_order[index]))
    }
}

fn key_of(row: &Row, key: &KeyInfo) -> Vec<Datum> {
    key.parts
        .iter()
        .map(|&c| row.get_opt(c).cloned().unwrap_or_default())
        .collect()
}

#[async_trait]
impl TableSource for MemoryTable {
    fn definition(&self) -> &TableDef {
        &self.def
    }

    fn estimate_row_count(&self) -> u64 {
        self.estimated_rows.unwrap_or(self.rows.len() as u64)
    }

    fn stats_are_exact(&self) -> bool {
        self.estimated_rows.is_none()
    }

    fn estimate_scan_cost(&self) -> f64 {
        let bytes = self.estimate_row_count() as usize * self.def.row_width();
        (bytes / PAGE_SIZE) as f64 + 1.0
    }

    fn rows_per_key(&self, index: usize, prefix_len: usize) -> Option<f64> {
        if self.estimated_rows.is_some() || prefix_len == 0 {
            return None;
        }
        self.rows_per_key.get(index)?.get(prefix_len - 1).copied()
    }

    fn records_in_range(&self, index: usize, range: &KeyRange) -> Option<f64> {
        if self.estimated_rows.is_some() {
            return None;
        }
        let key = self.keys.get(index)?;
        let count = self
            .rows
            .iter()
            .filter(|r| range.contains(&key_of(r, key)))
            .count();
        Some(count as f64)
    }

    async fn index_lookup(&self, index: usize, key: &[Datum]) -> StorageResult<Box<dyn RowCursor>> {
        let (info, order) = self.ordered(index)?;
        if key.len() > info.key_parts() {
            return Err(StorageError::Unsupported(format!(
                "lookup key has {} parts, index '{}' has {}",
                key.len(),
                info.name,
                info.key_parts()
            )));
        }
        let matching = order
            .iter()
            .copied()
            .filter(|&pos| key_of(&self.rows[pos], info)[..key.len()] == *key)
            .collect::<Vec<_>>();
        Ok(self.cursor(matching))
    }

    async fn index_scan(
        &self,
        index: usize,
        direction: ScanDirection,
    ) -> StorageResult<Box<dyn RowCursor>> {
        let (_, order) = self.ordered(index)?;
        Ok(match direction {
            ScanDirection::Forward => self.cursor(order.to_vec()),
            ScanDirection::Backward => self.cursor(order.iter().rev().copied().collect::<Vec<_>>()),
        })
    }

    async fn range_scan(
        &self,
        index: usize,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn RowCursor>> {
        let (info, order) = self.ordered(index)?;
        let matching = order
            .iter()
            .copied()
            .filter(|&pos| {
                let key = key_of(&self.rows[pos], info);
                ranges.iter().any(|r| r.contains(&key))
            })
            .collect::<Vec<_>>();
        Ok(self.cursor(matching))
    }

    async fn full_scan(&self) -> StorageResult<Box<dyn RowCursor>> {
        Ok(self.cursor(0..self.rows.len()))
    }

    async fn fulltext_search(
        &self,
        index: usize,
        query: &str,
    ) -> StorageResult<Box<dyn RowCursor>> {
        let info = self.key(index)?;
        if !info.fulltext {
            return Err(StorageError::Unsupported(format!(
                "index '{}' is not a full-text index",
                info.name
            )));
        }
        let matching = (0..self.rows.len())
            .filter(|&pos| {
                info.parts.iter().any(|&c| {
                    self.rows[pos]
                        .get_opt(c)
                        .is_some_and(|d| d.contains_words(query))
                })
            })
            .collect::<Vec<_>>();
        Ok(self.cursor(matching))
    }
}

struct MemoryCursor {
    table: String,
    rows: std::vec::IntoIter<(RowId, Row)>,
    reads: Arc<AtomicU64>,
    fail_after: Option<u64>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>> {
        if let Some(limit) = self.fail_after {
            if self.reads.load(Ordering::Relaxed) >= limit {
                return Err(StorageError::Io(format!(
                    "injected read failure on table '{}'",
                    self.table
                )));
            }
        }
        let next = self.rows.next();
        if next.is_some() {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType, IndexDef};
    use crate::storage::traits::KeyBound;

    fn table() -> MemoryTable {
        let def = TableDef::new("t")
            .column(ColumnDef::new("id", DataType::Int))
            .column(ColumnDef::new("grp", DataType::Int))
            .column(ColumnDef::new("note", DataType::Text))
            .primary_key(&["id"])
            .index(IndexDef::new("grp_idx", ["grp"]))
            .index(IndexDef::new("note_ft", ["note"]).fulltext());
        let rows = vec![
            Row::new(vec![Datum::Int(3), Datum::Int(1), Datum::from("red fox")]),
            Row::new(vec![Datum::Int(1), Datum::Int(2), Datum::from("blue whale")]),
            Row::new(vec![Datum::Int(2), Datum::Int(1), Datum::from("red panda")]),
            Row::new(vec![Datum::Int(4), Datum::Null, Datum::Null]),
        ];
        MemoryTable::new(def, rows).unwrap()
    }

    async fn drain(mut cursor: Box<dyn RowCursor>) -> Vec<RowId> {
        let mut ids = Vec::new();
        while let Some((id, _)) = cursor.next().await.unwrap() {
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_statistics() {
        let t = table();
        assert_eq!(t.estimate_row_count(), 4);
        assert!(t.stats_are_exact());
        assert_eq!(t.rows_per_key(0, 1), Some(1.0));
        // groups: 1, 2, NULL
        assert_eq!(t.rows_per_key(1, 1), Some(4.0 / 3.0));
        assert_eq!(t.estimate_scan_cost(), 1.0);

        let t = table().with_estimated_rows(1000);
        assert!(!t.stats_are_exact());
        assert_eq!(t.rows_per_key(1, 1), None);
    }

    #[tokio::test]
    async fn test_lookup_and_scans() {
        let t = table();
        assert_eq!(drain(t.index_lookup(1, &[Datum::Int(1)]).await.unwrap()).await, vec![0, 2]);
        assert_eq!(drain(t.index_lookup(1, &[Datum::Null]).await.unwrap()).await, vec![3]);
        assert_eq!(
            drain(t.index_scan(0, ScanDirection::Backward).await.unwrap()).await,
            vec![3, 0, 2, 1]
        );
        let range = KeyRange {
            low: KeyBound::Excluded(vec![Datum::Int(1)]),
            high: KeyBound::Unbounded,
        };
        assert_eq!(drain(t.range_scan(0, &[range.clone()]).await.unwrap()).await, vec![2, 0, 3]);
        assert_eq!(t.records_in_range(0, &range), Some(3.0));
        assert_eq!(drain(t.fulltext_search(2, "RED").await.unwrap()).await, vec![0, 2]);
        assert!(t.fulltext_search(1, "red").await.is_err());
        assert_eq!(t.reads(), 2 + 1 + 4 + 3 + 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let t = table().with_failure_after(2);
        let mut cursor = t.full_scan().await.unwrap();
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_some());
        assert!(matches!(cursor.next().await, Err(StorageError::Io(_))));
    }

    #[test]
    fn test_rejects_bad_rows() {
        let def = TableDef::new("t").column(ColumnDef::new("a", DataType::Int));
        let result = MemoryTable::new(def, vec![Row::new(vec![])]);
        assert!(matches!(result, Err(StorageError::Schema(_))));
    }
}
