//! Table registry
//!
//! Named table sources shared by every query of a session. Queries only
//! take `Arc` handles out of the registry, so planning and execution never
//! hold the lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::traits::TableSource;

/// Registry of table sources by name
#[derive(Default)]
pub struct TableRegistry {
    tables: RwLock<BTreeMap<String, Arc<dyn TableSource>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under its definition's name
    pub fn register(&self, source: Arc<dyn TableSource>) -> StorageResult<()> {
        let name = source.definition().name.clone();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(StorageError::Schema(format!("table '{}' already exists", name)));
        }
        debug!(table = %name, "table registered");
        tables.insert(name, source);
        Ok(())
    }

    /// Replace or add `source`, returning the previous one
    pub fn replace(&self, source: Arc<dyn TableSource>) -> Option<Arc<dyn TableSource>> {
        let name = source.definition().name.clone();
        self.tables.write().insert(name, source)
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn TableSource>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::Schema(format!("table '{}' does not exist", name)))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn TableSource>> {
        self.tables.write().remove(name)
    }

    /// Registered names in order
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType, TableDef};
    use crate::storage::MemoryTable;

    fn table(name: &str) -> Arc<dyn TableSource> {
        let def = TableDef::new(name).column(ColumnDef::new("a", DataType::Int));
        Arc::new(MemoryTable::new(def, Vec::new()).unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TableRegistry::new();
        registry.register(table("t2")).unwrap();
        registry.register(table("t1")).unwrap();
        assert!(registry.register(table("t1")).is_err());
        assert_eq!(registry.table_names(), vec!["t1", "t2"]);

        assert_eq!(registry.get("t2").unwrap().definition().name, "t2");
        assert!(registry.get("t3").is_err());
        assert!(registry.remove("t2").is_some());
        assert!(registry.get("t2").is_err());
        assert!(registry.replace(table("t1")).is_some());
    }

    #[test]
    fn test_shared_across_threads() {
        let registry = Arc::new(TableRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register(table(&format!("t{}", i))))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(registry.table_names().len(), 4);
    }
}
