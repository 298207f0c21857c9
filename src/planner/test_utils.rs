//! Shared test utilities for planner module tests

use std::sync::Arc;

use crate::catalog::{ColumnDef, DataType, IndexDef, TableDef};
use crate::executor::{Datum, Row};
use crate::storage::{MemoryTable, TableSource};

/// Integer table definition; `pk` becomes the primary key when given
pub fn int_def(name: &str, columns: &[&str], pk: Option<&str>) -> TableDef {
    let mut def = TableDef::new(name);
    for c in columns {
        def = def.column(ColumnDef::new(*c, DataType::Int));
    }
    match pk {
        Some(pk) => def.primary_key(&[pk]),
        None => def,
    }
}

/// Add a secondary index over `columns`
pub fn with_index(def: TableDef, name: &str, columns: &[&str]) -> TableDef {
    def.index(IndexDef::new(name, columns.iter().copied()))
}

/// Rows of integers, `None` standing for NULL
pub fn rows(values: &[&[Option<i64>]]) -> Vec<Row> {
    values
        .iter()
        .map(|r| Row::new(r.iter().map(|v| v.map_or(Datum::Null, Datum::Int)).collect()))
        .collect()
}

/// Rows `0..n` where each column is produced by `f(row, column)`
pub fn generated(n: usize, width: usize, f: impl Fn(usize, usize) -> i64) -> Vec<Row> {
    (0..n)
        .map(|i| Row::new((0..width).map(|c| Datum::Int(f(i, c))).collect()))
        .collect()
}

pub fn source(def: TableDef, rows: Vec<Row>) -> Arc<dyn TableSource> {
    Arc::new(MemoryTable::new(def, rows).unwrap())
}
