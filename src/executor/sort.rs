//! Sort executor
//!
//! Implements ORDER BY when no index delivers the order. The join appends
//! one sort key per ORDER BY item after the select values; the sort orders
//! by those trailing keys and strips them.

use async_trait::async_trait;

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::row::Row;
use super::Executor;

/// Sort executor
pub struct Sort {
    /// Input executor
    input: Box<dyn Executor>,
    /// One flag per trailing key, true for descending
    descending: Vec<bool>,
    /// Collected and sorted rows
    rows: std::vec::IntoIter<Row>,
}

impl Sort {
    pub fn new(input: Box<dyn Executor>, descending: Vec<bool>) -> Self {
        Sort {
            input,
            descending,
            rows: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Executor for Sort {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.input.open().await?;

        let key_count = self.descending.len();
        let mut keyed_rows: Vec<(Vec<Datum>, Row)> = Vec::new();
        while let Some(row) = self.input.next().await? {
            let width = row.len();
            if width < key_count {
                return Err(ExecutorError::ColumnIndexOutOfBounds {
                    index: key_count - 1,
                    row_len: width,
                });
            }
            let mut values = row.into_values();
            let keys = values.split_off(width - key_count);
            keyed_rows.push((keys, Row::new(values)));
        }

        // Stable: equal keys keep join order
        let descending = &self.descending;
        keyed_rows.sort_by(|(keys_a, _), (keys_b, _)| {
            for (i, (key_a, key_b)) in keys_a.iter().zip(keys_b.iter()).enumerate() {
                let cmp = key_a.cmp(key_b);
                let cmp = if descending[i] { cmp.reverse() } else { cmp };
                if cmp != std::cmp::Ordering::Equal {
                    return cmp;
                }
            }
            std::cmp::Ordering::Equal
        });

        self.rows = keyed_rows
            .into_iter()
            .map(|(_, row)| row)
            .collect::<Vec<_>>()
            .into_iter();
        Ok(())
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        self.rows = Vec::new().into_iter();
        self.input.close().await
    }
}
