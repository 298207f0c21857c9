//! Distinct executor
//!
//! Drops repeated rows, keeping the first occurrence so an already sorted
//! input stays sorted. Used for GROUP BY queries that select only grouping
//! columns; a loose index scan delivers such groups already distinct.

use std::collections::HashSet;

use async_trait::async_trait;

use super::datum::Datum;
use super::error::ExecutorResult;
use super::row::Row;
use super::Executor;

/// Hash-based distinct executor
pub struct HashDistinct {
    input: Box<dyn Executor>,
    seen: HashSet<Vec<Datum>>,
}

impl HashDistinct {
    pub fn new(input: Box<dyn Executor>) -> Self {
        HashDistinct {
            input,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Executor for HashDistinct {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.seen.clear();
        self.input.open().await
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        while let Some(row) = self.input.next().await? {
            if self.seen.insert(row.values().to_vec()) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        self.seen.clear();
        self.input.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockExecutor {
        rows: Vec<Row>,
        position: usize,
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn open(&mut self) -> ExecutorResult<()> {
            self.position = 0;
            Ok(())
        }

        async fn next(&mut self) -> ExecutorResult<Option<Row>> {
            let row = self.rows.get(self.position).cloned();
            self.position += 1;
            Ok(row)
        }

        async fn close(&mut self) -> ExecutorResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_distinct_keeps_first_occurrence_order() {
        let rows = [3, 1, 3, 2, 1, 3]
            .into_iter()
            .map(|v| Row::new(vec![Datum::Int(v)]))
            .collect();
        let mut distinct = HashDistinct::new(Box::new(MockExecutor { rows, position: 0 }));
        distinct.open().await.unwrap();
        let mut out = Vec::new();
        while let Some(row) = distinct.next().await.unwrap() {
            out.push(row.get(0).unwrap().as_int().unwrap());
        }
        distinct.close().await.unwrap();
        assert_eq!(out, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_null_groups_collapse() {
        let rows = vec![
            Row::new(vec![Datum::Null]),
            Row::new(vec![Datum::Int(1)]),
            Row::new(vec![Datum::Null]),
        ];
        let mut distinct = HashDistinct::new(Box::new(MockExecutor { rows, position: 0 }));
        distinct.open().await.unwrap();
        let mut count = 0;
        while distinct.next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
