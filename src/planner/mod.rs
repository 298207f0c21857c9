//! Join-order planner
//!
//! Turns a validated [`QueryBlock`] into an executable [`JoinPlan`].
//!
//! ## Pipeline
//!
//! ```text
//! QueryBuilder::build() → QueryBlock
//!   → Optimizer::optimize() → PlanOutcome
//!       Execute(JoinPlan) | ZeroRows | Synthesized
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use joinorder::planner::{Optimizer, PlanOutcome};
//!
//! let outcome = Optimizer::new(config).optimize(query, &kill).await?;
//! ```

pub mod cost;
pub mod error;
pub mod expr;
pub mod keyuse;
pub mod optimizer;
pub mod physical;
pub mod query;
pub mod range;
pub mod search;
pub mod semijoin;
pub mod stats;
pub mod table_set;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{PlannerError, PlannerResult};
pub use expr::{BinaryOp, ColumnRef, Expr, Guard, GuardKind, UnaryOp};
pub use optimizer::{Optimizer, PlanOutcome};
pub use physical::{AccessMethod, BufferKind, JoinNode, JoinPlan, OutputSpec};
pub use query::{NestId, NestKind, OrderItem, QueryBlock, QueryBuilder, SelectItem};
pub use search::{BestPlan, JoinSearch, Position};
pub use table_set::{TableId, TableSet, MAX_TABLES};
