//! joinorder - cost-based join ordering and nested-loop join execution
//!
//! Features:
//! - Greedy-bounded exhaustive search over join orders with pruning
//! - Outer joins, inner-join nests and IN-subquery semi-joins
//! - Constant-table detection and degenerate-query shortcuts
//! - Nested-loop executor with join buffers and semi-join strategies

pub mod catalog;
pub mod config;
pub mod executor;
pub mod planner;
pub mod storage;

pub use config::OptimizerConfig;
