//! Row type - a collection of datums

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};

/// A row of datums
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: Vec<Datum>,
}

impl Row {
    /// Create a new row with the given values
    pub fn new(values: Vec<Datum>) -> Self {
        Row { values }
    }

    /// Create an empty row
    pub fn empty() -> Self {
        Row { values: vec![] }
    }

    /// Create an all-NULL row with `width` columns
    pub fn nulls(width: usize) -> Self {
        Row {
            values: vec![Datum::Null; width],
        }
    }

    /// Get the number of columns in this row
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a datum by index
    pub fn get(&self, index: usize) -> ExecutorResult<&Datum> {
        self.values
            .get(index)
            .ok_or(ExecutorError::ColumnIndexOutOfBounds {
                index,
                row_len: self.values.len(),
            })
    }

    /// Get a datum by index, returning None if out of bounds
    pub fn get_opt(&self, index: usize) -> Option<&Datum> {
        self.values.get(index)
    }

    /// Set a datum by index
    pub fn set(&mut self, index: usize, value: Datum) -> ExecutorResult<()> {
        let row_len = self.values.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or(ExecutorError::ColumnIndexOutOfBounds { index, row_len })?;
        *slot = value;
        Ok(())
    }

    /// Get all values as a slice
    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    /// Consume the row and return the values
    pub fn into_values(self) -> Vec<Datum> {
        self.values
    }

    /// Approximate in-buffer width in bytes
    pub fn width(&self) -> usize {
        self.values.iter().map(Datum::width).sum()
    }

    /// Project the given column positions into a key tuple
    pub fn key(&self, columns: &[usize]) -> ExecutorResult<Vec<Datum>> {
        columns.iter().map(|&c| self.get(c).cloned()).collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for Row {}
