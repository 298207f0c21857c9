//! Query executor - Volcano iterator model
//!
//! The nested-loop join runs a [`JoinPlan`](crate::planner::JoinPlan) and
//! yields rows lazily; post-join operators (implicit aggregation, sort,
//! distinct, limit) wrap it. Every operator implements open/next/close.

pub mod access;
pub mod aggregate;
pub mod buffer;
pub mod context;
pub mod datum;
pub mod distinct;
pub mod engine;
pub mod error;
pub mod eval;
pub mod join;
pub mod limit;
pub mod row;
pub mod sort;
pub mod temp_table;
pub mod values;

pub use context::{ExecutionContext, KillFlag};
pub use datum::Datum;
pub use engine::{ExecState, ExecSummary, ExecutorEngine, ResultSink, SinkStatus};
pub use error::{ExecutorError, ExecutorResult};
pub use join::JoinExecutor;
pub use row::Row;
pub use temp_table::{MemoryTempTableProvider, TempTable, TempTableProvider};

use async_trait::async_trait;

/// Volcano-style iterator executor
///
/// Each operator implements:
/// - `open()`: Initialize the operator
/// - `next()`: Return the next row, or None if exhausted
/// - `close()`: Clean up resources
#[async_trait]
pub trait Executor: Send {
    /// Initialize the executor
    async fn open(&mut self) -> ExecutorResult<()>;

    /// Get the next row, or None if exhausted
    async fn next(&mut self) -> ExecutorResult<Option<Row>>;

    /// Close the executor and release resources
    async fn close(&mut self) -> ExecutorResult<()>;
}
