//! Storage subsystem
//!
//! Defines the table-access contract the optimizer and the join executor
//! consume, and an in-memory implementation of it.

pub mod error;
pub mod memory;
pub mod registry;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryTable;
pub use registry::TableRegistry;
pub use traits::{EmptyCursor, KeyBound, KeyRange, RowCursor, RowId, ScanDirection, TableSource};
