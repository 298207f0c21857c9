//! Temporary tables
//!
//! Write-once/read-many row buffers keyed by datum tuples. Semi-join
//! materialization fills one with the distinct IN values of a subquery;
//! duplicate weed-out records the row ids of result combinations already
//! sent.

use std::collections::BTreeMap;

use super::datum::Datum;
use super::error::ExecutorResult;
use super::row::Row;

/// Distinct-key row buffer owned by one execution node
pub trait TempTable: Send {
    /// Insert `row` under `key`; returns false when the key is already present
    fn insert(&mut self, key: Vec<Datum>, row: Row) -> ExecutorResult<bool>;

    /// Row stored under `key` with its insertion position
    fn lookup(&self, key: &[Datum]) -> Option<(usize, &Row)>;

    /// Rows in insertion order
    fn rows(&self) -> &[Row];

    fn len(&self) -> usize {
        self.rows().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every row
    fn clear(&mut self);
}

/// Creates temporary tables for one query
pub trait TempTableProvider: Send + Sync {
    fn create(&self) -> Box<dyn TempTable>;
}

/// In-memory temporary table
#[derive(Debug, Default)]
pub struct MemoryTempTable {
    index: BTreeMap<Vec<Datum>, usize>,
    rows: Vec<Row>,
}

impl TempTable for MemoryTempTable {
    fn insert(&mut self, key: Vec<Datum>, row: Row) -> ExecutorResult<bool> {
        if self.index.contains_key(&key) {
            return Ok(false);
        }
        self.index.insert(key, self.rows.len());
        self.rows.push(row);
        Ok(true)
    }

    fn lookup(&self, key: &[Datum]) -> Option<(usize, &Row)> {
        let pos = *self.index.get(key)?;
        self.rows.get(pos).map(|row| (pos, row))
    }

    fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn clear(&mut self) {
        self.index.clear();
        self.rows.clear();
    }
}

/// Provider of [`MemoryTempTable`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryTempTableProvider;

impl TempTableProvider for MemoryTempTableProvider {
    fn create(&self) -> Box<dyn TempTable> {
        Box::new(MemoryTempTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> Vec<Datum> {
        vec![Datum::Int(v)]
    }

    #[test]
    fn test_insert_rejects_duplicate_keys() {
        let mut table = MemoryTempTableProvider.create();
        assert!(table.insert(key(1), Row::new(key(1))).unwrap());
        assert!(table.insert(key(2), Row::new(key(2))).unwrap());
        assert!(!table.insert(key(1), Row::new(key(1))).unwrap());
        assert_eq!(table.len(), 2);

        let (pos, row) = table.lookup(&key(2)).unwrap();
        assert_eq!(pos, 1);
        assert_eq!(row.get(0).unwrap().as_int(), Some(2));
        assert!(table.lookup(&key(3)).is_none());
    }

    #[test]
    fn test_clear_forgets_keys() {
        let mut table = MemoryTempTable::default();
        table.insert(key(1), Row::empty()).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table.insert(key(1), Row::empty()).unwrap());
    }
}
