//! Limit executor
//!
//! Applies LIMIT and OFFSET after post-join work (sorting, aggregation).
//! Plans that need neither count rows inside the join instead, so that
//! reaching the limit stops every scan.

use async_trait::async_trait;

use super::error::ExecutorResult;
use super::row::Row;
use super::Executor;

/// Limit executor
pub struct Limit {
    input: Box<dyn Executor>,
    /// Maximum rows to return (None = unlimited)
    limit: Option<u64>,
    offset: u64,
    skipped: u64,
    returned: u64,
}

impl Limit {
    pub fn new(input: Box<dyn Executor>, limit: Option<u64>, offset: u64) -> Self {
        Limit {
            input,
            limit,
            offset,
            skipped: 0,
            returned: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.returned >= limit)
    }
}

#[async_trait]
impl Executor for Limit {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.skipped = 0;
        self.returned = 0;
        self.input.open().await
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        if self.exhausted() {
            return Ok(None);
        }
        while let Some(row) = self.input.next().await? {
            if self.skipped < self.offset {
                self.skipped += 1;
                continue;
            }
            self.returned += 1;
            return Ok(Some(row));
        }
        Ok(None)
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        self.input.close().await
    }
}
