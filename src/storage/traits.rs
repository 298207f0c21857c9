//! Table access contract consumed by the optimizer and the join executor

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::catalog::TableDef;
use crate::executor::{Datum, Row};
use crate::storage::error::StorageResult;

/// Stable identifier of a row within its table
pub type RowId = u64;

/// Index scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// One end of a key range, expressed over a prefix of the index key
#[derive(Debug, Clone, PartialEq)]
pub enum KeyBound {
    Unbounded,
    Included(Vec<Datum>),
    Excluded(Vec<Datum>),
}

impl KeyBound {
    fn values(&self) -> Option<&[Datum]> {
        match self {
            KeyBound::Unbounded => None,
            KeyBound::Included(v) | KeyBound::Excluded(v) => Some(v),
        }
    }

    fn is_excluded(&self) -> bool {
        matches!(self, KeyBound::Excluded(_))
    }
}

/// Interval of index keys; bounds compare against the same-length prefix
/// of each key. NULL sorts below every value, so `Excluded([NULL])` as a
/// lower bound means "any non-NULL value".
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub low: KeyBound,
    pub high: KeyBound,
}

impl KeyRange {
    /// Range matching keys whose prefix equals `key`
    pub fn point(key: Vec<Datum>) -> Self {
        Self {
            low: KeyBound::Included(key.clone()),
            high: KeyBound::Included(key),
        }
    }

    /// Range matching every key
    pub fn full() -> Self {
        Self {
            low: KeyBound::Unbounded,
            high: KeyBound::Unbounded,
        }
    }

    /// Check whether an index key lies inside this range
    pub fn contains(&self, key: &[Datum]) -> bool {
        let above_low = match &self.low {
            KeyBound::Unbounded => true,
            KeyBound::Included(b) => compare_prefix(key, b) != Ordering::Less,
            KeyBound::Excluded(b) => compare_prefix(key, b) == Ordering::Greater,
        };
        let below_high = match &self.high {
            KeyBound::Unbounded => true,
            KeyBound::Included(b) => compare_prefix(key, b) != Ordering::Greater,
            KeyBound::Excluded(b) => compare_prefix(key, b) == Ordering::Less,
        };
        above_low && below_high
    }

    /// Provably matches no key
    pub fn is_empty(&self) -> bool {
        let (Some(low), Some(high)) = (self.low.values(), self.high.values()) else {
            return false;
        };
        let n = low.len().min(high.len());
        match low[..n].cmp(&high[..n]) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                low.len() == high.len() && (self.low.is_excluded() || self.high.is_excluded())
            }
        }
    }
}

/// Compare the first `bound.len()` parts of `key` against `bound`
fn compare_prefix(key: &[Datum], bound: &[Datum]) -> Ordering {
    let n = bound.len().min(key.len());
    key[..n].cmp(&bound[..n])
}

/// Row-at-a-time iterator returned by every access method
#[async_trait]
pub trait RowCursor: Send {
    /// Next row, or `None` at end of data
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>>;
}

/// Cursor that never yields a row
pub struct EmptyCursor;

#[async_trait]
impl RowCursor for EmptyCursor {
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>> {
        Ok(None)
    }
}

/// Read-only access to one table: statistics plus the access methods the
/// join executor drives.
///
/// Statistics methods are synchronous and must be cheap; they are called
/// repeatedly during plan search.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Schema of the table
    fn definition(&self) -> &TableDef;

    /// Estimated number of rows
    fn estimate_row_count(&self) -> u64;

    /// Whether `estimate_row_count` is exact
    fn stats_are_exact(&self) -> bool {
        false
    }

    /// Cost of one full scan, in page-read units
    fn estimate_scan_cost(&self) -> f64;

    /// Average rows sharing one value of the first `prefix_len` key parts
    fn rows_per_key(&self, index: usize, prefix_len: usize) -> Option<f64>;

    /// Estimated rows inside `range` on `index`
    fn records_in_range(&self, _index: usize, _range: &KeyRange) -> Option<f64> {
        None
    }

    /// Rows whose key prefix equals `key` (NULL matches NULL)
    async fn index_lookup(&self, index: usize, key: &[Datum]) -> StorageResult<Box<dyn RowCursor>>;

    /// All rows in index order
    async fn index_scan(
        &self,
        index: usize,
        direction: ScanDirection,
    ) -> StorageResult<Box<dyn RowCursor>>;

    /// Rows inside any of `ranges`, in index order
    async fn range_scan(
        &self,
        index: usize,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn RowCursor>>;

    /// All rows in storage order
    async fn full_scan(&self) -> StorageResult<Box<dyn RowCursor>>;

    /// Rows matching a natural-language full-text query on `index`
    async fn fulltext_search(
        &self,
        index: usize,
        query: &str,
    ) -> StorageResult<Box<dyn RowCursor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &[i64]) -> Vec<Datum> {
        v.iter().map(|&i| Datum::Int(i)).collect()
    }

    #[test]
    fn test_point_range_matches_prefix() {
        let range = KeyRange::point(ints(&[5]));
        assert!(range.contains(&ints(&[5, 1])));
        assert!(range.contains(&ints(&[5, 99])));
        assert!(!range.contains(&ints(&[6, 0])));
    }

    #[test]
    fn test_not_null_lower_bound() {
        let range = KeyRange {
            low: KeyBound::Excluded(vec![Datum::Null]),
            high: KeyBound::Excluded(ints(&[10])),
        };
        assert!(!range.contains(&[Datum::Null]));
        assert!(range.contains(&ints(&[-3])));
        assert!(!range.contains(&ints(&[10])));
    }

    #[test]
    fn test_empty_ranges() {
        let crossed = KeyRange {
            low: KeyBound::Excluded(ints(&[5])),
            high: KeyBound::Excluded(ints(&[3])),
        };
        assert!(crossed.is_empty());
        let open_point = KeyRange {
            low: KeyBound::Included(ints(&[4])),
            high: KeyBound::Excluded(ints(&[4])),
        };
        assert!(open_point.is_empty());
        assert!(!KeyRange::point(ints(&[4])).is_empty());
        assert!(!KeyRange::full().is_empty());
    }
}
