//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

use std::sync::Arc;

use joinorder::catalog::{ColumnDef, DataType, IndexDef, TableDef};
use joinorder::executor::{
    Datum, ExecSummary, ExecutionContext, ExecutorEngine, ExecutorResult, Row,
};
use joinorder::planner::QueryBlock;
use joinorder::storage::MemoryTable;
use joinorder::OptimizerConfig;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honoring RUST_LOG (once per binary)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Table of integer columns; `pk` becomes the primary key when given
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

pub fn with_index(def: TableDef, name: &str, columns: &[&str]) -> TableDef {
    def.index(IndexDef::new(name, columns.iter().copied()))
}

/// Rows of integers, `None` standing for NULL
pub fn int_rows(values: &[&[Option<i64>]]) -> Vec<Row> {
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

pub fn table(def: TableDef, rows: Vec<Row>) -> Arc<MemoryTable> {
    Arc::new(MemoryTable::new(def, rows).unwrap())
}

/// `customers(id PK)` with 100 rows and `orders(id PK, cust_id)` with 1000
/// rows, ten per customer, indexed on `cust_id`
pub fn customers_orders() -> (Arc<MemoryTable>, Arc<MemoryTable>) {
    let customers = table(
        int_def("customers", &["id"], Some("id")),
        generated(100, 1, |i, _| i as i64),
    );
    let orders = table(
        with_index(int_def("orders", &["id", "cust_id"], Some("id")), "cust_idx", &["cust_id"]),
        generated(1000, 2, |i, c| if c == 0 { i as i64 } else { (i % 100) as i64 }),
    );
    (customers, orders)
}

/// Run `query` with `config`, returning the rows as nullable integers
pub async fn run_query(
    config: OptimizerConfig,
    query: QueryBlock,
) -> ExecutorResult<(Vec<Vec<Option<i64>>>, ExecSummary)> {
    let engine = ExecutorEngine::new(ExecutionContext::new(config));
    let mut rows: Vec<Row> = Vec::new();
    let summary = engine.execute(query, &mut rows).await?;
    let values = rows
        .iter()
        .map(|r| r.values().iter().map(Datum::as_int).collect())
        .collect();
    Ok((values, summary))
}

/// Rows in a canonical order, for order-insensitive comparisons
pub fn sorted(mut rows: Vec<Vec<Option<i64>>>) -> Vec<Vec<Option<i64>>> {
    rows.sort();
    rows
}

/// Configurations covering every join buffer kind, plus no buffering;
/// the smallest buffers force flushes in the middle of the join
pub fn buffer_configs() -> Vec<OptimizerConfig> {
    let mut configs: Vec<_> = [0u8, 1, 2, 4, 8]
        .into_iter()
        .map(|level| OptimizerConfig::default().with_join_cache_level(level))
        .collect();
    for level in [2u8, 4, 8] {
        configs.push(
            OptimizerConfig::default()
                .with_join_cache_level(level)
                .with_join_buffer_size(128),
        );
    }
    configs
}
