//! Aggregate executor
//!
//! Folds the joined rows of a query whose select list holds aggregates
//! into the single row of its implicit group. The join delivers one value
//! per select item; COUNT(*) positions carry a placeholder.

use async_trait::async_trait;

use crate::planner::query::SelectItem;

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::row::Row;
use super::Executor;

/// Accumulator for one select item
#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Min(Option<Datum>),
    Max(Option<Datum>),
    /// Plain expression: value of the first row
    First(Option<Datum>),
}

impl Accumulator {
    fn new(item: &SelectItem) -> Self {
        match item {
            SelectItem::CountStar => Accumulator::Count(0),
            SelectItem::Min(_) => Accumulator::Min(None),
            SelectItem::Max(_) => Accumulator::Max(None),
            SelectItem::Expr(_) => Accumulator::First(None),
        }
    }

    fn accumulate(&mut self, value: &Datum) {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Min(min) => {
                if !value.is_null() {
                    match min {
                        None => *min = Some(value.clone()),
                        Some(m) if *value < *m => *min = Some(value.clone()),
                        _ => {}
                    }
                }
            }
            Accumulator::Max(max) => {
                if !value.is_null() {
                    match max {
                        None => *max = Some(value.clone()),
                        Some(m) if *value > *m => *max = Some(value.clone()),
                        _ => {}
                    }
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value.clone());
                }
            }
        }
    }

    fn finalize(self) -> Datum {
        match self {
            Accumulator::Count(n) => Datum::Int(n),
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => v.unwrap_or(Datum::Null),
        }
    }
}

/// Implicit-group aggregate; always produces exactly one row
pub struct ImplicitAggregate {
    input: Box<dyn Executor>,
    items: Vec<SelectItem>,
    done: bool,
}

impl ImplicitAggregate {
    pub fn new(input: Box<dyn Executor>, items: Vec<SelectItem>) -> Self {
        ImplicitAggregate {
            input,
            items,
            done: false,
        }
    }
}

#[async_trait]
impl Executor for ImplicitAggregate {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.done = false;
        self.input.open().await
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut accs: Vec<Accumulator> = self.items.iter().map(Accumulator::new).collect();
        while let Some(row) = self.input.next().await? {
            if row.len() < accs.len() {
                return Err(ExecutorError::ColumnIndexOutOfBounds {
                    index: accs.len() - 1,
                    row_len: row.len(),
                });
            }
            for (acc, value) in accs.iter_mut().zip(row.values()) {
                acc.accumulate(value);
            }
        }
        Ok(Some(Row::new(accs.into_iter().map(Accumulator::finalize).collect())))
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        self.input.close().await
    }
}
