//! Table statistics and constant tables
//!
//! Collects per-table row estimates, computes outer-join dependencies, and
//! reads the tables that can yield at most one row before the join starts:
//! exact 0/1-row tables and tables whose unique key is bound entirely by
//! constants. Reading one constant table can make another constant, so the
//! search repeats until nothing changes.

use tracing::{debug, trace};

use crate::executor::context::KillFlag;
use crate::executor::eval::{eval_predicate, RowSource};
use crate::executor::{Datum, ExecutorError, ExecutorResult, Row};
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::expr::{ColumnRef, Expr};
use crate::planner::keyuse::{KeyOptimize, KeyUseSet};
use crate::planner::query::{QueryBlock, SelectItem};
use crate::planner::range::{RangeEstimate, RangeEstimator};
use crate::planner::table_set::{TableId, TableSet};
use crate::storage::{RowId, ScanDirection};

/// Row bound to a constant table
#[derive(Debug, Clone, PartialEq)]
pub enum ConstRow {
    Found { rowid: RowId, row: Row },
    /// Inner table of an outer join with no matching row
    NullRow,
}

/// How a constant table was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstAccess {
    /// Table known to hold at most one row
    System,
    /// Unique index bound by constants
    UniqueKey(usize),
}

/// Statistics of one table
#[derive(Debug, Clone)]
pub struct TableStats {
    /// Estimated row count
    pub records: f64,
    pub exact: bool,
    /// Cost of one full scan
    pub scan_cost: f64,
    pub row_width: usize,
    /// Tables that must precede this one (outer-join dependencies)
    pub dependent: TableSet,
    /// Tables referenced by key-usage candidates of this table
    pub key_dependent: TableSet,
    /// Rows left after the best range restriction
    pub found_records: f64,
    /// Cost of reading `found_records` without any join key
    pub read_time: f64,
    /// Upper bound on seeks charged for one ref lookup
    pub worst_seeks: f64,
    pub range: Option<RangeEstimate>,
}

/// Statistics of a query block after constant-table detection
#[derive(Debug, Clone)]
pub struct JoinStatistics {
    pub tables: Vec<TableStats>,
    /// Constant tables in the order they were read
    pub const_order: Vec<(TableId, ConstAccess)>,
    pub const_rows: Vec<Option<ConstRow>>,
    pub const_map: TableSet,
}

impl JoinStatistics {
    /// Tables left for join-order search
    pub fn free_tables(&self) -> TableSet {
        TableSet::first_n(self.tables.len()) - self.const_map
    }

    /// Column source over the constant rows
    pub fn const_source(&self) -> ConstRows<'_> {
        ConstRows {
            rows: &self.const_rows,
        }
    }
}

/// Reads columns of constant tables
pub struct ConstRows<'a> {
    rows: &'a [Option<ConstRow>],
}

impl<'a> ConstRows<'a> {
    pub fn new(rows: &'a [Option<ConstRow>]) -> Self {
        Self { rows }
    }
}

impl RowSource for ConstRows<'_> {
    fn column(&self, col: ColumnRef) -> ExecutorResult<Datum> {
        match self.rows.get(col.table) {
            Some(Some(ConstRow::Found { row, .. })) => row.get(col.column).cloned(),
            Some(Some(ConstRow::NullRow)) => Ok(Datum::Null),
            _ => Err(ExecutorError::TableNotFound(col.table)),
        }
    }
}

/// Result of statistics collection
#[derive(Debug)]
pub enum StatsOutcome {
    Ready(JoinStatistics),
    /// The query provably returns no rows
    ZeroRows(String),
}

/// Tables each table must follow because of outer joins.
///
/// Inner tables of a LEFT JOIN depend on the outside tables referenced by
/// its ON expression, or on every table declared before the nest when the
/// ON reads only inner tables. A nest inside another nest also follows the
/// tables of its parent declared before it. Dependencies of enclosing nests
/// are inherited, and the result is closed transitively.
pub fn outer_join_dependencies(query: &QueryBlock) -> PlannerResult<Vec<TableSet>> {
    let n = query.table_count();
    let mut nest_deps = vec![TableSet::EMPTY; query.nests.len()];
    for (id, nest) in query.nests.iter().enumerate() {
        let on_tables = nest
            .on_expr
            .as_ref()
            .map_or(TableSet::EMPTY, |on| on.used_tables());
        let scope = match nest.parent {
            Some(p) => query.nests[p].tables,
            None => query.all_tables(),
        };
        let earlier = (scope & TableSet::first_n(nest.tables.first().unwrap_or(0))) - nest.tables;
        let mut deps = on_tables - nest.tables;
        // A nested bracket never opens its parent bracket
        if deps.is_empty() || nest.parent.is_some() {
            deps |= earlier;
        }
        nest_deps[id] = deps;
    }

    let mut deps = vec![TableSet::EMPTY; n];
    for (t, dep) in deps.iter_mut().enumerate() {
        for nest in query.nest_chain(t) {
            *dep |= nest_deps[nest];
        }
    }

    loop {
        let mut changed = false;
        for t in 0..n {
            let mut closure = deps[t];
            for d in deps[t].iter() {
                closure |= deps[d];
            }
            if closure != deps[t] {
                deps[t] = closure;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    if let Some(t) = (0..n).find(|&t| deps[t].contains(t)) {
        return Err(PlannerError::Configuration(format!(
            "table '{}' depends on itself through outer-join conditions",
            query.table(t).alias
        )));
    }
    Ok(deps)
}

/// Collects statistics and reads constant tables
pub struct StatisticsCollector<'a> {
    query: &'a QueryBlock,
    keyuses: &'a KeyUseSet,
    kill: &'a KillFlag,
    const_tables: bool,
}

impl<'a> StatisticsCollector<'a> {
    pub fn new(query: &'a QueryBlock, keyuses: &'a KeyUseSet, kill: &'a KillFlag) -> Self {
        Self {
            query,
            keyuses,
            kill,
            const_tables: true,
        }
    }

    /// Skip constant-table detection; every table stays free
    #[must_use]
    pub fn without_const_tables(mut self) -> Self {
        self.const_tables = false;
        self
    }

    pub async fn collect(&self) -> PlannerResult<StatsOutcome> {
        let query = self.query;
        let n = query.table_count();

        // Literal predicates need no table reads
        for c in query.conjuncts() {
            if c.expr.used_tables().is_empty() && !eval_predicate(&c.expr, &ConstRows::new(&[]))? {
                return Ok(StatsOutcome::ZeroRows("Impossible WHERE".to_string()));
            }
        }

        let deps = outer_join_dependencies(query)?;
        let mut tables: Vec<TableStats> = query
            .tables
            .iter()
            .map(|t| {
                let source = &t.source;
                let records = source.estimate_row_count() as f64;
                let scan_cost = source.estimate_scan_cost();
                TableStats {
                    records,
                    exact: source.stats_are_exact(),
                    scan_cost,
                    row_width: t.row_width,
                    dependent: deps[t.id],
                    key_dependent: self.keyuses.key_dependent(t.id),
                    found_records: records,
                    read_time: scan_cost,
                    worst_seeks: 2.0,
                    range: None,
                }
            })
            .collect();

        let mut const_rows: Vec<Option<ConstRow>> = vec![None; n];
        let mut const_order = Vec::new();
        let mut const_map = TableSet::EMPTY;

        for t in 0..n {
            let stats = &tables[t];
            if !self.const_tables
                || !self.const_eligible(t) || !stats.exact || stats.records > 1.0 || !stats.dependent.is_empty() {
                continue;
            }
            let mut cursor = query.table(t).source.full_scan().await?;
            let found = cursor.next().await?;
            match self.bind_const(t, found, &mut const_rows, const_map)? {
                Some(row) => const_rows[t] = Some(row),
                None => {
                    return Ok(StatsOutcome::ZeroRows(format!(
                        "no matching row in const table '{}'",
                        query.table(t).alias
                    )))
                }
            }
            const_map.insert(t);
            const_order.push((t, ConstAccess::System));
        }

        while self.const_tables {
            if self.kill.is_killed() {
                return Err(PlannerError::Killed);
            }
            let mut progress = false;
            for t in 0..n {
                if const_map.contains(t)
                    || !self.const_eligible(t)
                    || !tables[t].dependent.is_subset_of(const_map)
                {
                    continue;
                }
                let Some((index, key)) = self.const_key(t, const_map, &const_rows)? else {
                    continue;
                };
                let found = match key {
                    Some(key) => {
                        let mut cursor = query.table(t).source.index_lookup(index, &key).await?;
                        cursor.next().await?
                    }
                    None => None,
                };
                match self.bind_const(t, found, &mut const_rows, const_map)? {
                    Some(row) => const_rows[t] = Some(row),
                    None => {
                        return Ok(StatsOutcome::ZeroRows(format!(
                            "no matching row in const table '{}'",
                            query.table(t).alias
                        )))
                    }
                }
                trace!(table = %query.table(t).alias, index, "constant table via unique key");
                const_map.insert(t);
                const_order.push((t, ConstAccess::UniqueKey(index)));
                progress = true;
            }
            if !progress {
                break;
            }
        }

        let consts = ConstRows::new(&const_rows);
        for c in query.conjuncts() {
            if c.expr.used_tables().is_subset_of(const_map) && !eval_predicate(&c.expr, &consts)? {
                return Ok(StatsOutcome::ZeroRows(
                    "Impossible WHERE noticed after reading const tables".to_string(),
                ));
            }
        }

        let outer_inner = query.outer_join_inner_tables();
        let ranges = RangeEstimator::new(self.keyuses, const_map, &consts);
        for t in (0..n).filter(|t| !const_map.contains(*t)) {
            let analysis = ranges.analyze(query.table(t), tables[t].records);
            if analysis.impossible && !outer_inner.contains(t) {
                return Ok(StatsOutcome::ZeroRows(format!(
                    "Impossible range on table '{}'",
                    query.table(t).alias
                )));
            }
            let stats = &mut tables[t];
            if let Some(range) = analysis.best {
                if range.cost + range.rows * crate::planner::cost::ROW_EVALUATE_COST
                    < stats.scan_cost + stats.records * crate::planner::cost::ROW_EVALUATE_COST
                {
                    stats.found_records = range.rows;
                    stats.read_time = range.cost;
                }
                stats.range = Some(range);
            }
            stats.worst_seeks = (stats.found_records / 10.0)
                .min(stats.read_time * 3.0)
                .max(2.0);
        }

        debug!(
            tables = n,
            const_tables = const_order.len(),
            "table statistics collected"
        );
        Ok(StatsOutcome::Ready(JoinStatistics {
            tables,
            const_order,
            const_rows,
            const_map,
        }))
    }

    /// Constant candidates: not a semi-join inner table, and either outside
    /// every outer join or the only table of a top-level outer-join nest
    fn const_eligible(&self, t: TableId) -> bool {
        let query = self.query;
        if query.table(t).semi_join.is_some() {
            return false;
        }
        match query.outer_join_nest(t) {
            None => true,
            Some(n) => query.nests[n].tables.len() == 1 && query.nest_chain(t).len() == 1,
        }
    }

    /// Unique index of `t` whose every key part is bound by constants,
    /// with its key values; `Some((index, None))` when a NULL key value
    /// means no row can match
    fn const_key(
        &self,
        t: TableId,
        const_map: TableSet,
        const_rows: &[Option<ConstRow>],
    ) -> PlannerResult<Option<(usize, Option<Vec<Datum>>)>> {
        let consts = ConstRows::new(const_rows);
        for (index, key) in self.query.table(t).keys.iter().enumerate() {
            if !key.unique || key.fulltext {
                continue;
            }
            let uses = self.keyuses.for_table(t);
            let bound: Option<Vec<_>> = (0..key.key_parts())
                .map(|part| {
                    uses.iter().find(|k| {
                        k.index == index
                            && k.keypart == part
                            && k.optimize == KeyOptimize::Plain
                            && k.used_tables.is_subset_of(const_map)
                    })
                })
                .collect();
            let Some(bound) = bound else {
                continue;
            };
            let mut values = Vec::with_capacity(bound.len());
            let mut null_key = false;
            for k in bound {
                let v = crate::executor::eval::eval(&k.val, &consts)?;
                null_key |= v.is_null() && k.null_rejecting;
                values.push(v);
            }
            return Ok(Some((index, (!null_key).then_some(values))));
        }
        Ok(None)
    }

    /// Turn a read result into the table's constant row; `None` means the
    /// whole query has no rows
    fn bind_const(
        &self,
        t: TableId,
        found: Option<(RowId, Row)>,
        const_rows: &mut [Option<ConstRow>],
        const_map: TableSet,
    ) -> PlannerResult<Option<ConstRow>> {
        let query = self.query;
        let nest = query.outer_join_nest(t);
        let Some((rowid, row)) = found else {
            return Ok(nest.map(|_| ConstRow::NullRow));
        };
        let row = ConstRow::Found { rowid, row };
        let Some(nest) = nest else {
            return Ok(Some(row));
        };
        let Some(on) = &query.nests[nest].on_expr else {
            return Ok(Some(row));
        };
        if !on.used_tables().is_subset_of(TableSet::single(t) | const_map) {
            return Ok(Some(row));
        }
        const_rows[t] = Some(row.clone());
        let matched = eval_predicate(on, &ConstRows::new(const_rows))?;
        const_rows[t] = None;
        Ok(Some(if matched { row } else { ConstRow::NullRow }))
    }
}

/// Answer a single-table MIN/MAX/COUNT(*) query from index ends and the
/// exact row count, without running the join
pub async fn aggregate_from_indexes(
    query: &QueryBlock,
    stats: &JoinStatistics,
) -> PlannerResult<Option<Row>> {
    if query.table_count() != 1
        || !query.is_aggregate()
        || query.where_cond.is_some()
        || !query.semi_joins.is_empty()
        || !query.group_by.is_empty()
        || !stats.const_map.is_empty()
        || !stats.tables[0].exact
    {
        return Ok(None);
    }
    let table = query.table(0);
    let mut values = Vec::with_capacity(query.select_list.len());
    for item in &query.select_list {
        let (expr, direction) = match item {
            SelectItem::CountStar => {
                values.push(Datum::Int(stats.tables[0].records as i64));
                continue;
            }
            SelectItem::Min(e) => (e, ScanDirection::Forward),
            SelectItem::Max(e) => (e, ScanDirection::Backward),
            SelectItem::Expr(_) => return Ok(None),
        };
        let Expr::Column(col) = expr else {
            return Ok(None);
        };
        let Some(index) = table
            .keys
            .iter()
            .position(|k| !k.fulltext && k.parts.first() == Some(&col.column))
        else {
            return Ok(None);
        };
        let mut cursor = table.source.index_scan(index, direction).await?;
        let mut value = Datum::Null;
        while let Some((_, row)) = cursor.next().await? {
            let v = row.get(col.column)?.clone();
            if !v.is_null() {
                value = v;
                break;
            }
        }
        values.push(value);
    }
    debug!(table = %table.alias, "aggregate answered from index ends");
    Ok(Some(Row::new(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::keyuse::KeyUseAnalyzer;
    use crate::planner::query::QueryBuilder;
    use crate::planner::test_utils::{generated, int_def, rows, source};

    async fn collect(query: &QueryBlock) -> StatsOutcome {
        let keyuses = KeyUseAnalyzer::new(query).analyze();
        let kill = KillFlag::new();
        StatisticsCollector::new(query, &keyuses, &kill)
            .collect()
            .await
            .unwrap()
    }

    fn ready(outcome: StatsOutcome) -> JoinStatistics {
        match outcome {
            StatsOutcome::Ready(stats) => stats,
            StatsOutcome::ZeroRows(reason) => panic!("unexpected zero rows: {}", reason),
        }
    }

    #[test]
    fn test_dependencies_follow_on_expressions() {
        let mut qb = QueryBuilder::new();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let name = format!("t{}", i);
                qb.table(&name, source(int_def(&name, &["a"], None), vec![])).unwrap()
            })
            .collect();
        qb.left_join(&[ids[2]], Expr::eq(Expr::col(2, 0), Expr::col(1, 0)))
            .unwrap();
        // ON reading only the inner table depends on everything before it
        qb.left_join(&[ids[3]], Expr::eq(Expr::col(3, 0), Expr::lit(1i64)))
            .unwrap();
        let deps = outer_join_dependencies(&qb.build().unwrap()).unwrap();
        assert_eq!(deps[0], TableSet::EMPTY);
        assert_eq!(deps[2], TableSet::single(1));
        assert_eq!(deps[3], TableSet::first_n(3));
    }

    #[test]
    fn test_dependencies_are_transitive() {
        let mut qb = QueryBuilder::new();
        for i in 0..3 {
            let name = format!("t{}", i);
            qb.table(&name, source(int_def(&name, &["a"], None), vec![])).unwrap();
        }
        qb.left_join(&[1], Expr::eq(Expr::col(1, 0), Expr::col(0, 0))).unwrap();
        qb.left_join(&[2], Expr::eq(Expr::col(2, 0), Expr::col(1, 0))).unwrap();
        let deps = outer_join_dependencies(&qb.build().unwrap()).unwrap();
        assert_eq!(deps[2], TableSet::single(0) | TableSet::single(1));
    }

    #[test]
    fn test_mutual_dependency_is_configuration_error() {
        let mut qb = QueryBuilder::new();
        for i in 0..3 {
            let name = format!("t{}", i);
            qb.table(&name, source(int_def(&name, &["a"], None), vec![])).unwrap();
        }
        qb.left_join(&[1], Expr::eq(Expr::col(1, 0), Expr::col(2, 0))).unwrap();
        qb.left_join(&[2], Expr::eq(Expr::col(2, 0), Expr::col(1, 0))).unwrap();
        let err = outer_join_dependencies(&qb.build().unwrap()).unwrap_err();
        assert!(matches!(err, PlannerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unique_key_bound_by_constant() {
        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["id", "v"], Some("id")), generated(50, 2, |i, _| i as i64)))
            .unwrap();
        let t1 = qb
            .table("t1", source(int_def("t1", &["id", "v"], Some("id")), generated(50, 2, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t0, 0), Expr::lit(7i64)));
        // t1 becomes constant once t0's row is known
        qb.filter(Expr::eq(Expr::col(t1, 0), Expr::col(t0, 1)));
        let stats = ready(collect(&qb.build().unwrap()).await);
        assert_eq!(
            stats.const_order,
            vec![(t0, ConstAccess::UniqueKey(0)), (t1, ConstAccess::UniqueKey(0))]
        );
        assert!(stats.free_tables().is_empty());
        assert!(matches!(
            &stats.const_rows[t1],
            Some(ConstRow::Found { rowid: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_const_row() {
        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["id"], Some("id")), generated(5, 1, |i, _| i as i64)))
            .unwrap();
        let t1 = qb
            .table("t1", source(int_def("t1", &["id"], Some("id")), generated(5, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t0, 0), Expr::lit(1i64)));
        qb.left_join(&[t1], Expr::eq(Expr::col(t1, 0), Expr::lit(99i64)))
            .unwrap();
        let stats = ready(collect(&qb.build().unwrap()).await);
        assert_eq!(stats.const_rows[t1], Some(ConstRow::NullRow));
        assert!(stats.free_tables().is_empty());

        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["id"], Some("id")), generated(5, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t0, 0), Expr::lit(99i64)));
        assert!(matches!(
            collect(&qb.build().unwrap()).await,
            StatsOutcome::ZeroRows(_)
        ));
    }

    #[tokio::test]
    async fn test_outer_table_waits_for_dependencies() {
        let mut qb = QueryBuilder::new();
        qb.table("t0", source(int_def("t0", &["id"], Some("id")), generated(5, 1, |i, _| i as i64)))
            .unwrap();
        let t1 = qb
            .table("t1", source(int_def("t1", &["id"], Some("id")), generated(5, 1, |i, _| i as i64)))
            .unwrap();
        qb.left_join(&[t1], Expr::eq(Expr::col(t1, 0), Expr::lit(2i64)))
            .unwrap();
        let stats = ready(collect(&qb.build().unwrap()).await);
        assert!(stats.const_order.is_empty());
    }

    #[tokio::test]
    async fn test_system_table_and_impossible_where() {
        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["a"], None), rows(&[&[Some(3)]])))
            .unwrap();
        let t1 = qb
            .table("t1", source(int_def("t1", &["a"], None), generated(10, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t1, 0), Expr::col(t0, 0)));
        let stats = ready(collect(&qb.build().unwrap()).await);
        assert_eq!(stats.const_order, vec![(t0, ConstAccess::System)]);

        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["a"], None), rows(&[&[Some(3)]])))
            .unwrap();
        qb.table("t1", source(int_def("t1", &["a"], None), generated(10, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::gt(Expr::col(t0, 0), Expr::lit(5i64)));
        assert!(matches!(
            collect(&qb.build().unwrap()).await,
            StatsOutcome::ZeroRows(_)
        ));
    }

    #[tokio::test]
    async fn test_range_restricts_found_records() {
        let mut qb = QueryBuilder::new();
        let t0 = qb
            .table("t0", source(int_def("t0", &["id"], Some("id")), generated(1000, 1, |i, _| i as i64)))
            .unwrap();
        qb.table("t1", source(int_def("t1", &["a"], None), generated(10, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::lt(Expr::col(t0, 0), Expr::lit(10i64)));
        let stats = ready(collect(&qb.build().unwrap()).await);
        assert_eq!(stats.tables[t0].found_records, 10.0);
        assert!(stats.tables[t0].range.is_some());
    }

    #[tokio::test]
    async fn test_aggregate_from_index_ends() {
        let mut qb = QueryBuilder::new();
        qb.table(
            "t",
            source(
                int_def("t", &["id", "v"], Some("id")),
                rows(&[&[Some(4), None], &[Some(9), Some(1)], &[Some(2), Some(5)]]),
            ),
        )
        .unwrap();
        qb.select(SelectItem::Min(Expr::col(0, 0)));
        qb.select(SelectItem::Max(Expr::col(0, 0)));
        qb.select(SelectItem::CountStar);
        let query = qb.build().unwrap();
        let stats = ready(collect(&query).await);
        let row = aggregate_from_indexes(&query, &stats).await.unwrap().unwrap();
        assert_eq!(row.values(), &[Datum::Int(2), Datum::Int(9), Datum::Int(3)]);

        // MAX over an unindexed column needs the executor
        let mut qb = QueryBuilder::new();
        qb.table(
            "t",
            source(int_def("t", &["id", "v"], Some("id")), generated(3, 2, |i, c| (i + c) as i64)),
        )
        .unwrap();
        qb.select(SelectItem::Max(Expr::col(0, 1)));
        let query = qb.build().unwrap();
        let stats = ready(collect(&query).await);
        assert!(aggregate_from_indexes(&query, &stats).await.unwrap().is_none());
    }
}
