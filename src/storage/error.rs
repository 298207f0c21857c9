//! Storage error types

use thiserror::Error;

/// Storage operation errors
///
/// Reaching the end of a scan or finding no row for a key is not an error:
/// cursors report it as `Ok(None)`.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O failure in the underlying table
    #[error("IO error: {0}")]
    Io(String),

    /// Data read back does not decode
    #[error("Corrupted row {row_id} in table '{table}'")]
    Corruption { table: String, row_id: u64 },

    /// Index position outside the table's index list
    #[error("Unknown index {index} on table '{table}'")]
    UnknownIndex { table: String, index: usize },

    /// Rows or indexes do not fit the table definition
    #[error("Schema error: {0}")]
    Schema(String),

    /// Operation not supported by this table (e.g. full-text on a plain index)
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
