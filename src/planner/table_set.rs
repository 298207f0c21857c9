//! Bitmap of query tables

use std::fmt;
use std::ops::{BitAnd, BitOr, Not, Sub};

/// Position of a table in the query's FROM list
pub type TableId = usize;

/// Maximum number of tables in one query block
pub const MAX_TABLES: usize = 64;

/// Set of tables, one bit per `TableId`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableSet(u64);

impl TableSet {
    /// The empty set
    pub const EMPTY: TableSet = TableSet(0);

    pub fn new() -> Self {
        Self::EMPTY
    }

    /// Set holding one table
    pub fn single(table: TableId) -> Self {
        debug_assert!(table < MAX_TABLES);
        TableSet(1u64 << table)
    }

    /// Set holding tables `0..n`
    pub fn first_n(n: usize) -> Self {
        if n >= MAX_TABLES {
            TableSet(u64::MAX)
        } else {
            TableSet((1u64 << n) - 1)
        }
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, table: TableId) -> bool {
        table < MAX_TABLES && self.0 & (1u64 << table) != 0
    }

    pub fn insert(&mut self, table: TableId) {
        self.0 |= 1u64 << table;
    }

    pub fn remove(&mut self, table: TableId) {
        self.0 &= !(1u64 << table);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_subset_of(self, other: TableSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(self, other: TableSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Lowest table id in the set
    pub fn first(self) -> Option<TableId> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }

    /// Tables in ascending id order
    pub fn iter(self) -> impl Iterator<Item = TableId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let t = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(t)
            }
        })
    }
}

impl BitOr for TableSet {
    type Output = TableSet;
    fn bitor(self, rhs: TableSet) -> TableSet {
        TableSet(self.0 | rhs.0)
    }
}

impl BitAnd for TableSet {
    type Output = TableSet;
    fn bitand(self, rhs: TableSet) -> TableSet {
        TableSet(self.0 & rhs.0)
    }
}

impl Sub for TableSet {
    type Output = TableSet;
    fn sub(self, rhs: TableSet) -> TableSet {
        TableSet(self.0 & !rhs.0)
    }
}

impl Not for TableSet {
    type Output = TableSet;
    fn not(self) -> TableSet {
        TableSet(!self.0)
    }
}

impl std::ops::BitOrAssign for TableSet {
    fn bitor_assign(&mut self, rhs: TableSet) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<TableId> for TableSet {
    fn from_iter<I: IntoIterator<Item = TableId>>(iter: I) -> Self {
        let mut set = TableSet::EMPTY;
        for t in iter {
            set.insert(t);
        }
        set
    }
}

impl fmt::Debug for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let a: TableSet = [0, 2, 5].into_iter().collect();
        let b = TableSet::single(2) | TableSet::single(3);
        assert_eq!((a & b).iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!((a - b).iter().collect::<Vec<_>>(), vec![0, 5]);
        assert!(TableSet::single(5).is_subset_of(a));
        assert!(!b.is_subset_of(a));
        assert_eq!(a.len(), 3);
        assert_eq!(a.first(), Some(0));
        assert_eq!(TableSet::EMPTY.first(), None);
    }

    #[test]
    fn test_first_n() {
        assert_eq!(TableSet::first_n(3).iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(TableSet::first_n(0), TableSet::EMPTY);
        assert_eq!(TableSet::first_n(64).len(), 64);
        assert!(TableSet::first_n(64).contains(63));
    }
}
