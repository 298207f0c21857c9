//! Executor error types

use std::fmt;

use crate::planner::PlannerError;
use crate::storage::StorageError;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Executor errors
#[derive(Debug)]
pub enum ExecutorError {
    /// Storage layer error other than end-of-data
    Storage(StorageError),

    /// Planning failed while preparing a sub-plan
    Planner(PlannerError),

    /// The query was cancelled
    Killed,

    /// Invalid operation (e.g., division by zero)
    InvalidOperation(String),

    /// Column index out of bounds
    ColumnIndexOutOfBounds { index: usize, row_len: usize },

    /// Table slot referenced by an expression does not exist
    TableNotFound(usize),

    /// Internal executor error
    Internal(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Storage(e) => write!(f, "storage error: {}", e),
            ExecutorError::Planner(e) => write!(f, "planner error: {}", e),
            ExecutorError::Killed => write!(f, "query execution was interrupted"),
            ExecutorError::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            ExecutorError::ColumnIndexOutOfBounds { index, row_len } => {
                write!(
                    f,
                    "column index {} out of bounds (row has {} columns)",
                    index, row_len
                )
            }
            ExecutorError::TableNotFound(id) => write!(f, "table #{} not found", id),
            ExecutorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecutorError::Storage(e) => Some(e),
            ExecutorError::Planner(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for ExecutorError {
    fn from(e: StorageError) -> Self {
        ExecutorError::Storage(e)
    }
}

impl From<PlannerError> for ExecutorError {
    fn from(e: PlannerError) -> Self {
        match e {
            PlannerError::Killed => ExecutorError::Killed,
            other => ExecutorError::Planner(other),
        }
    }
}
