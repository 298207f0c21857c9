//! Planner error types

use std::fmt;

use crate::catalog::CatalogError;
use crate::executor::ExecutorError;
use crate::storage::StorageError;

/// Planner error
#[derive(Debug)]
pub enum PlannerError {
    /// Contradictory join nesting or an impossible forced order
    Configuration(String),
    /// Query references something that does not exist
    InvalidQuery(String),
    /// Unsupported query shape
    UnsupportedOperation(String),
    /// Cancelled while planning
    Killed,
    /// Fatal storage error while reading statistics or constant tables
    Storage(StorageError),
    /// Internal error
    Internal(String),
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::Configuration(msg) => write!(f, "Join configuration error: {}", msg),
            PlannerError::InvalidQuery(msg) => write!(f, "Invalid query: {}", msg),
            PlannerError::UnsupportedOperation(msg) => write!(f, "Unsupported operation: {}", msg),
            PlannerError::Killed => write!(f, "Query planning was interrupted"),
            PlannerError::Storage(e) => write!(f, "Storage error during planning: {}", e),
            PlannerError::Internal(msg) => write!(f, "Internal planner error: {}", msg),
        }
    }
}

impl std::error::Error for PlannerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlannerError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for PlannerError {
    fn from(e: StorageError) -> Self {
        PlannerError::Storage(e)
    }
}

impl From<CatalogError> for PlannerError {
    fn from(e: CatalogError) -> Self {
        PlannerError::InvalidQuery(e.to_string())
    }
}

impl From<ExecutorError> for PlannerError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Killed => PlannerError::Killed,
            ExecutorError::Storage(e) => PlannerError::Storage(e),
            ExecutorError::Planner(e) => e,
            other => PlannerError::InvalidQuery(other.to_string()),
        }
    }
}

/// Result type for planner operations
pub type PlannerResult<T> = Result<T, PlannerError>;
