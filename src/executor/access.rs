//! Access methods
//!
//! Turns a node's [`AccessMethod`] plus the current prefix row into a
//! storage request, and opens the cursor that serves it.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::planner::physical::{AccessMethod, KeyPartSource, LookupKey};
use crate::planner::query::QueryTable;
use crate::storage::{
    EmptyCursor, KeyRange, RowCursor, RowId, ScanDirection, StorageResult, TableSource,
};

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::eval::{eval, RowSource};
use super::row::Row;

/// One storage read prepared from a node's access method
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRequest {
    /// The key cannot match any row
    Empty,
    Lookup { index: usize, key: Vec<Datum> },
    /// Lookup `key`, then `null_key`
    LookupOrNull {
        index: usize,
        key: Vec<Datum>,
        null_key: Vec<Datum>,
    },
    FullText { index: usize, query: String },
    IndexScan { index: usize, direction: ScanDirection },
    Range { index: usize, ranges: Vec<KeyRange> },
    Full,
    /// Index order, one row per distinct value of `columns`
    Loose { index: usize, columns: Vec<usize> },
}

/// Evaluate a lookup key; `None` when a NULL reaches a NULL-rejecting part
pub fn build_key(key: &LookupKey, src: &dyn RowSource) -> ExecutorResult<Option<Vec<Datum>>> {
    let mut values = Vec::with_capacity(key.parts.len());
    for part in &key.parts {
        let value = match &part.source {
            KeyPartSource::Const(d) => d.clone(),
            KeyPartSource::Field(col) => src.column(*col)?,
            KeyPartSource::Expr(e) => eval(e, src)?,
        };
        if value.is_null() && part.null_rejecting {
            return Ok(None);
        }
        values.push(value);
    }
    Ok(Some(values))
}

/// Storage request for `access` on `table` given the current prefix row
pub fn scan_request(
    table: &QueryTable,
    access: &AccessMethod,
    src: &dyn RowSource,
) -> ExecutorResult<ScanRequest> {
    let request = match access {
        AccessMethod::UniqueLookup(key) | AccessMethod::NonUniqueLookup(key) => {
            match build_key(key, src)? {
                Some(values) => ScanRequest::Lookup {
                    index: key.index,
                    key: values,
                },
                None => ScanRequest::Empty,
            }
        }
        AccessMethod::RefOrNull { key, null_part } => {
            let Some(values) = build_key(key, src)? else {
                return Ok(ScanRequest::Empty);
            };
            match values.get(*null_part) {
                Some(v) if !v.is_null() => {
                    let mut null_key = values.clone();
                    null_key[*null_part] = Datum::Null;
                    ScanRequest::LookupOrNull {
                        index: key.index,
                        key: values,
                        null_key,
                    }
                }
                _ => ScanRequest::Lookup {
                    index: key.index,
                    key: values,
                },
            }
        }
        AccessMethod::FullTextLookup { index, query } => ScanRequest::FullText {
            index: *index,
            query: query.clone(),
        },
        AccessMethod::IndexScan { index } => ScanRequest::IndexScan {
            index: *index,
            direction: ScanDirection::Forward,
        },
        AccessMethod::IndexScanReverse { index } => ScanRequest::IndexScan {
            index: *index,
            direction: ScanDirection::Backward,
        },
        AccessMethod::RangeScan { index, ranges } => ScanRequest::Range {
            index: *index,
            ranges: ranges.clone(),
        },
        AccessMethod::FullScan | AccessMethod::HashProbe { .. } => ScanRequest::Full,
        AccessMethod::LooseIndexScan { index, prefix } => {
            let key = table.keys.get(*index).ok_or_else(|| {
                ExecutorError::Internal(format!("table '{}' has no index #{}", table.alias, index))
            })?;
            ScanRequest::Loose {
                index: *index,
                columns: key.parts.iter().take(*prefix).copied().collect(),
            }
        }
        AccessMethod::ConstLookup
        | AccessMethod::MaterializedLookup { .. }
        | AccessMethod::MaterializedScan { .. } => {
            return Err(ExecutorError::Internal(format!(
                "access method {} is not a table read",
                access.name()
            )))
        }
    };
    Ok(request)
}

/// Open the cursor serving `request`
pub async fn open_scan(
    source: Arc<dyn TableSource>,
    request: ScanRequest,
) -> ExecutorResult<Box<dyn RowCursor>> {
    let cursor = match request {
        ScanRequest::Empty => Box::new(EmptyCursor),
        ScanRequest::Lookup { index, key } => source.index_lookup(index, &key).await?,
        ScanRequest::LookupOrNull {
            index,
            key,
            null_key,
        } => {
            let first = source.index_lookup(index, &key).await?;
            let second = source.index_lookup(index, &null_key).await?;
            Box::new(ChainCursor {
                cursors: VecDeque::from([first, second]),
            })
        }
        ScanRequest::FullText { index, query } => source.fulltext_search(index, &query).await?,
        ScanRequest::IndexScan { index, direction } => source.index_scan(index, direction).await?,
        ScanRequest::Range { index, ranges } => source.range_scan(index, &ranges).await?,
        ScanRequest::Full => source.full_scan().await?,
        ScanRequest::Loose { index, columns } => Box::new(DistinctPrefixCursor {
            inner: source.index_scan(index, ScanDirection::Forward).await?,
            columns,
            last: None,
        }),
    };
    Ok(cursor)
}

/// Values of `columns` in `row`
pub fn prefix_key(row: &Row, columns: &[usize]) -> Vec<Datum> {
    columns
        .iter()
        .map(|&c| row.get_opt(c).cloned().unwrap_or(Datum::Null))
        .collect()
}

/// Cursor over rows already in memory
pub struct VecCursor {
    rows: std::vec::IntoIter<(RowId, Row)>,
}

impl VecCursor {
    pub fn new(rows: Vec<(RowId, Row)>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>> {
        Ok(self.rows.next())
    }
}

/// Cursors read one after another
struct ChainCursor {
    cursors: VecDeque<Box<dyn RowCursor>>,
}

#[async_trait]
impl RowCursor for ChainCursor {
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>> {
        while let Some(cursor) = self.cursors.front_mut() {
            if let Some(row) = cursor.next().await? {
                return Ok(Some(row));
            }
            self.cursors.pop_front();
        }
        Ok(None)
    }
}

/// Index-ordered cursor yielding the first row of each key prefix
struct DistinctPrefixCursor {
    inner: Box<dyn RowCursor>,
    columns: Vec<usize>,
    last: Option<Vec<Datum>>,
}

#[async_trait]
impl RowCursor for DistinctPrefixCursor {
    async fn next(&mut self) -> StorageResult<Option<(RowId, Row)>> {
        while let Some((rowid, row)) = self.inner.next().await? {
            let key = prefix_key(&row, &self.columns);
            if self.last.as_ref() == Some(&key) {
                continue;
            }
            self.last = Some(key);
            return Ok(Some((rowid, row)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType, IndexDef, TableDef};
    use crate::executor::eval::NoRows;
    use crate::planner::physical::KeyPart;
    use crate::planner::query::QueryBuilder;
    use crate::storage::MemoryTable;

    fn table() -> Arc<dyn TableSource> {
        let def = TableDef::new("t")
            .column(ColumnDef::new("a", DataType::Int))
            .column(ColumnDef::new("b", DataType::Int))
            .index(IndexDef::new("ab", ["a", "b"]));
        let rows = [(1, 1), (1, 2), (2, 1), (3, 3)]
            .iter()
            .map(|&(a, b)| Row::new(vec![Datum::Int(a), Datum::Int(b)]))
            .chain(std::iter::once(Row::new(vec![Datum::Null, Datum::Int(9)])))
            .collect();
        Arc::new(MemoryTable::new(def, rows).unwrap())
    }

    async fn drain(mut cursor: Box<dyn RowCursor>) -> Vec<Row> {
        let mut out = Vec::new();
        while let Some((_, row)) = cursor.next().await.unwrap() {
            out.push(row);
        }
        out
    }

    fn key(parts: Vec<(Datum, bool)>) -> LookupKey {
        LookupKey {
            index: 0,
            parts: parts
                .into_iter()
                .map(|(d, null_rejecting)| KeyPart {
                    source: KeyPartSource::Const(d),
                    null_rejecting,
                })
                .collect(),
        }
    }

    #[test]
    fn test_null_rejecting_key_matches_nothing() {
        let k = key(vec![(Datum::Null, true)]);
        assert_eq!(build_key(&k, &NoRows).unwrap(), None);
        let k = key(vec![(Datum::Null, false)]);
        assert_eq!(build_key(&k, &NoRows).unwrap(), Some(vec![Datum::Null]));
    }

    #[tokio::test]
    async fn test_ref_or_null_reads_both_keys() {
        let mut qb = QueryBuilder::new();
        let t = qb.table("t", table()).unwrap();
        let query = qb.build().unwrap();
        let access = AccessMethod::RefOrNull {
            key: key(vec![(Datum::Int(3), false)]),
            null_part: 0,
        };
        let request = scan_request(query.table(t), &access, &NoRows).unwrap();
        assert!(matches!(request, ScanRequest::LookupOrNull { .. }));
        let rows = drain(open_scan(Arc::clone(&query.table(t).source), request).await.unwrap()).await;
        let firsts: Vec<_> = rows.iter().map(|r| r.get(0).unwrap().clone()).collect();
        assert_eq!(firsts, vec![Datum::Int(3), Datum::Null]);
    }

    #[tokio::test]
    async fn test_loose_scan_yields_one_row_per_prefix() {
        let rows = drain(
            open_scan(
                table(),
                ScanRequest::Loose {
                    index: 0,
                    columns: vec![0],
                },
            )
            .await
            .unwrap(),
        )
        .await;
        let firsts: Vec<_> = rows.iter().map(|r| r.get(0).unwrap().clone()).collect();
        assert_eq!(firsts, vec![Datum::Null, Datum::Int(1), Datum::Int(2), Datum::Int(3)]);
    }
}
