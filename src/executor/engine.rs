//! Executor engine
//!
//! Builds the executor tree for an optimized query and drives it into a
//! result sink:
//!
//! ```text
//! JoinExecutor → [ImplicitAggregate] → [Sort] → [HashDistinct] → [Limit] → ResultSink
//! ```
//!
//! Degenerate outcomes skip the join: a zero-row query still produces the
//! implicit-group row of an aggregate select list, and a synthesized row is
//! emitted as is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::planner::physical::OutputSpec;
use crate::planner::{Optimizer, PlanOutcome, QueryBlock};

use super::aggregate::ImplicitAggregate;
use super::context::ExecutionContext;
use super::distinct::HashDistinct;
use super::error::ExecutorResult;
use super::join::JoinExecutor;
use super::limit::Limit;
use super::row::Row;
use super::sort::Sort;
use super::temp_table::{MemoryTempTableProvider, TempTableProvider};
use super::values::Values;
use super::Executor;

/// What the consumer of result rows wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Continue,
    Stop,
}

/// Consumer of result rows
pub trait ResultSink: Send {
    fn emit(&mut self, row: Row) -> ExecutorResult<SinkStatus>;
}

impl ResultSink for Vec<Row> {
    fn emit(&mut self, row: Row) -> ExecutorResult<SinkStatus> {
        self.push(row);
        Ok(SinkStatus::Continue)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Every qualifying row was sent
    Completed,
    /// LIMIT cut the result short
    LimitReached,
    /// The sink asked to stop
    SinkStopped,
}

/// Counters of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_sent: u64,
    /// Rows read from storage by the join
    pub rows_examined: u64,
    pub state: ExecState,
}

/// Executor engine - runs optimized queries
pub struct ExecutorEngine {
    ctx: ExecutionContext,
    temp: Arc<dyn TempTableProvider>,
}

impl ExecutorEngine {
    pub fn new(ctx: ExecutionContext) -> Self {
        ExecutorEngine {
            ctx,
            temp: Arc::new(MemoryTempTableProvider),
        }
    }

    /// Use `provider` for materialization and weed-out tables
    #[must_use]
    pub fn with_temp_tables(mut self, provider: Arc<dyn TempTableProvider>) -> Self {
        self.temp = provider;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Optimize `query` and run it into `sink`
    pub async fn execute(&self, query: QueryBlock, sink: &mut dyn ResultSink) -> ExecutorResult<ExecSummary> {
        let outcome = Optimizer::new(self.ctx.config.clone())
            .optimize(query, &self.ctx.kill)
            .await?;
        self.run(outcome, sink).await
    }

    /// Build the executor tree for `outcome`; the counter receives the
    /// rows the join reads
    pub fn build(&self, outcome: PlanOutcome) -> (Box<dyn Executor>, OutputSpec, Arc<AtomicU64>) {
        let examined = Arc::new(AtomicU64::new(0));
        let (mut exec, output): (Box<dyn Executor>, OutputSpec) = match outcome {
            PlanOutcome::Execute(plan) => {
                let output = plan.output.clone();
                let join = JoinExecutor::new(Arc::new(plan), self.ctx.kill.clone())
                    .with_temp_tables(Arc::clone(&self.temp))
                    .with_examined_counter(Arc::clone(&examined));
                (Box::new(join), output)
            }
            PlanOutcome::ZeroRows { output, .. } => (Box::new(Values::empty()), output),
            PlanOutcome::Synthesized { row, output } => {
                // Already the final row: nothing left to fold or sort
                let output = OutputSpec {
                    aggregate: false,
                    sort: false,
                    ..output
                };
                return (
                    Box::new(Limit::new(Box::new(Values::new(vec![row])), output.limit, output.offset)),
                    output,
                    examined,
                );
            }
        };
        if output.aggregate {
            exec = Box::new(ImplicitAggregate::new(exec, output.select.clone()));
        }
        if output.sort {
            let descending = output.order_by.iter().map(|o| o.descending).collect();
            exec = Box::new(Sort::new(exec, descending));
        }
        if output.distinct {
            exec = Box::new(HashDistinct::new(exec));
        }
        if !output.limit_at_join() && (output.limit.is_some() || output.offset > 0) {
            exec = Box::new(Limit::new(exec, output.limit, output.offset));
        }
        (exec, output, examined)
    }

    /// Run an optimized query into `sink`
    pub async fn run(&self, outcome: PlanOutcome, sink: &mut dyn ResultSink) -> ExecutorResult<ExecSummary> {
        if let PlanOutcome::ZeroRows { reason, .. } = &outcome {
            debug!(reason = %reason, "join skipped");
        }
        let (mut exec, output, examined) = self.build(outcome);
        let mut summary = ExecSummary {
            rows_sent: 0,
            rows_examined: 0,
            state: ExecState::Completed,
        };
        if output.limit == Some(0) {
            summary.state = ExecState::LimitReached;
            return Ok(summary);
        }

        exec.open().await?;
        let result = self.drain(exec.as_mut(), sink, &mut summary).await;
        let closed = exec.close().await;
        result?;
        closed?;

        summary.rows_examined = examined.load(Ordering::Relaxed);
        if summary.state == ExecState::Completed && output.limit.is_some_and(|l| summary.rows_sent >= l) {
            summary.state = ExecState::LimitReached;
        }
        info!(
            rows_sent = summary.rows_sent,
            rows_examined = summary.rows_examined,
            state = ?summary.state,
            "query finished"
        );
        Ok(summary)
    }

    async fn drain(
        &self,
        exec: &mut dyn Executor,
        sink: &mut dyn ResultSink,
        summary: &mut ExecSummary,
    ) -> ExecutorResult<()> {
        while let Some(row) = exec.next().await? {
            summary.rows_sent += 1;
            if sink.emit(row)? == SinkStatus::Stop {
                summary.state = ExecState::SinkStopped;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::executor::{Datum, ExecutorError};
    use crate::planner::expr::Expr;
    use crate::planner::query::{QueryBuilder, SelectItem};
    use crate::planner::test_utils::{generated, int_def, source};

    fn engine() -> ExecutorEngine {
        ExecutorEngine::new(ExecutionContext::new(OptimizerConfig::default()))
    }

    fn counting_query(n: usize) -> QueryBuilder {
        let mut qb = QueryBuilder::new();
        qb.table("t", source(int_def("t", &["a"], None), generated(n, 1, |i, _| i as i64)))
            .unwrap();
        qb
    }

    /// Stops after `max` rows
    struct Take {
        rows: Vec<Row>,
        max: usize,
    }

    impl ResultSink for Take {
        fn emit(&mut self, row: Row) -> ExecutorResult<SinkStatus> {
            self.rows.push(row);
            Ok(if self.rows.len() >= self.max {
                SinkStatus::Stop
            } else {
                SinkStatus::Continue
            })
        }
    }

    #[tokio::test]
    async fn test_limit_is_reported() {
        let mut qb = counting_query(10);
        qb.select_column(0, 0).limit(3);
        let mut rows = Vec::new();
        let summary = engine().execute(qb.build().unwrap(), &mut rows).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(summary.rows_sent, 3);
        assert_eq!(summary.rows_examined, 3);
        assert_eq!(summary.state, ExecState::LimitReached);
    }

    #[tokio::test]
    async fn test_sink_can_stop() {
        let mut qb = counting_query(10);
        qb.select_column(0, 0);
        let mut sink = Take {
            rows: Vec::new(),
            max: 2,
        };
        let summary = engine().execute(qb.build().unwrap(), &mut sink).await.unwrap();
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(summary.state, ExecState::SinkStopped);
    }

    #[tokio::test]
    async fn test_zero_rows_aggregate_yields_one_row() {
        let mut qb = counting_query(10);
        qb.filter(Expr::eq(Expr::lit(1i64), Expr::lit(0i64)));
        qb.select(SelectItem::CountStar)
            .select(SelectItem::Max(Expr::col(0, 0)));
        let mut rows = Vec::new();
        let summary = engine().execute(qb.build().unwrap(), &mut rows).await.unwrap();
        assert_eq!(summary.rows_examined, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values(), &[Datum::Int(0), Datum::Null]);
    }

    #[tokio::test]
    async fn test_limit_zero_runs_nothing() {
        let mut qb = counting_query(10);
        qb.select_column(0, 0).limit(0);
        let mut rows = Vec::new();
        let summary = engine().execute(qb.build().unwrap(), &mut rows).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(summary.rows_examined, 0);
    }

    #[tokio::test]
    async fn test_killed_query_reports_killed() {
        let ctx = ExecutionContext::new(OptimizerConfig::default());
        ctx.kill.kill();
        let mut qb = counting_query(10);
        qb.select_column(0, 0);
        let mut rows = Vec::new();
        let err = ExecutorEngine::new(ctx)
            .execute(qb.build().unwrap(), &mut rows)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Killed));
        assert!(rows.is_empty());
    }
}
