//! Fixed-rows executor
//!
//! Source for queries answered without reading tables: the empty input of
//! a zero-row aggregate, or a row computed during optimization.

use super::error::ExecutorResult;
use super::row::Row;
use super::Executor;

/// Executor yielding a fixed list of rows
pub struct Values {
    rows: Vec<Row>,
    position: usize,
}

impl Values {
    pub fn new(rows: Vec<Row>) -> Self {
        Values { rows, position: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait::async_trait]
impl Executor for Values {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.position = 0;
        Ok(())
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        Ok(())
    }
}
