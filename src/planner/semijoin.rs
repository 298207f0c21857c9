//! Semi-join strategy selection
//!
//! IN-subqueries pulled up into the join leave their inner tables free to
//! move around the join order. Once a prefix holds every table a semi-join
//! needs, one of the strategies below removes the duplicate matches the
//! inner tables would otherwise produce, and the prefix cost and row
//! estimate are corrected accordingly:
//!
//! - duplicate weed-out: remember the row ids of the outer tables in the
//!   range and drop combinations seen before
//! - first match: after the first match of the inner tables, jump back to
//!   the last outer table
//! - loose scan: scan the first inner table through an index covering the
//!   IN columns and take one row per distinct key
//! - materialization: fill a distinct temporary table from the inner tables
//!   alone, then look it up per outer row or scan it as the outer side

use tracing::trace;

use crate::executor::context::KillFlag;
use crate::planner::cost::{CostModel, ROW_EVALUATE_COST, TEMPTABLE_ROW_COST};
use crate::planner::error::PlannerResult;
use crate::planner::query::{QueryBlock, SemiJoinNest};
use crate::planner::search::{JoinSearch, Position};
use crate::planner::table_set::{TableId, TableSet};

/// How duplicates of one semi-join are removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemiJoinStrategy {
    DuplicateWeedout,
    FirstMatch,
    LooseScan { index: usize, key_parts: usize },
    MaterializeLookup,
    MaterializeScan,
}

/// Strategy chosen for one semi-join nest over positions `first..=last`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemiJoinDecision {
    pub nest: usize,
    pub strategy: SemiJoinStrategy,
    pub first: usize,
    pub last: usize,
}

/// Independently optimized join of one semi-join's inner tables
#[derive(Debug, Clone)]
pub struct SjmPlan {
    pub nest: usize,
    /// Inner tables in their own best order
    pub positions: Vec<Position>,
    /// Estimated rows in the temporary table
    pub rows: f64,
    /// Cost of filling the temporary table once
    pub materialize_cost: f64,
    /// Cost of one lookup by the IN expressions
    pub lookup_cost: f64,
    /// Cost of reading the whole temporary table once
    pub scan_cost: f64,
}

/// Whether a nest's subquery reads outside tables
fn is_correlated(sj: &SemiJoinNest, const_map: TableSet) -> bool {
    !(sj.correlation() - const_map).is_empty()
}

/// Optimize the inner tables of every nest that materialization may serve
pub fn plan_materializations(
    model: &CostModel<'_>,
    kill: &KillFlag,
) -> PlannerResult<Vec<Option<SjmPlan>>> {
    let query = model.query();
    let const_map = model.stats().const_map;
    let switches = &model.config().switches;
    let mut plans = Vec::with_capacity(query.semi_joins.len());
    for (nest, sj) in query.semi_joins.iter().enumerate() {
        if !switches.semijoin || !switches.materialization || is_correlated(sj, const_map) {
            plans.push(None);
            continue;
        }
        let best = JoinSearch::new(model, &[], kill)
            .with_allowed(sj.inner_tables)
            .without_semi_joins()
            .run()?;
        let positions = best.positions[best.const_count..].to_vec();
        let rows = distinct_rows(query, nest).map_or(best.rows, |d| d.min(best.rows));
        let plan = SjmPlan {
            nest,
            positions,
            rows,
            materialize_cost: best.cost + rows * TEMPTABLE_ROW_COST,
            lookup_cost: TEMPTABLE_ROW_COST,
            scan_cost: rows * (TEMPTABLE_ROW_COST + ROW_EVALUATE_COST),
        };
        trace!(nest, rows, cost = plan.materialize_cost, "materialization planned");
        plans.push(Some(plan));
    }
    Ok(plans)
}

/// Distinct IN tuples when an index of a single inner table covers them
fn distinct_rows(query: &QueryBlock, nest: usize) -> Option<f64> {
    let table = query.semi_joins[nest].inner_exprs.first()?.as_column()?.table;
    let (index, key_parts) = loose_scan_index(query, nest, table)?;
    let source = &query.table(table).source;
    let per_key = source.rows_per_key(index, key_parts)?;
    Some((source.estimate_row_count() as f64 / per_key.max(1.0)).max(1.0))
}

/// Index of the nest's first inner table whose leading key parts are
/// exactly the IN columns; the IN expressions must all be its columns
pub fn loose_scan_index(query: &QueryBlock, nest: usize, first: TableId) -> Option<(usize, usize)> {
    let sj = &query.semi_joins[nest];
    let mut columns = Vec::with_capacity(sj.inner_exprs.len());
    for e in &sj.inner_exprs {
        let c = e.as_column()?;
        if c.table != first {
            return None;
        }
        if !columns.contains(&c.column) {
            columns.push(c.column);
        }
    }
    let n = columns.len();
    query
        .table(first)
        .keys
        .iter()
        .enumerate()
        .find(|(_, k)| {
            !k.fulltext && k.parts.len() >= n && k.parts[..n].iter().all(|p| columns.contains(p))
        })
        .map(|(index, _)| (index, n))
}

fn decided(positions: &[Position], nest: usize) -> bool {
    positions
        .iter()
        .any(|p| p.semi_joins.iter().any(|d| d.nest == nest))
}

/// Pick strategies for every semi-join completed by the last position and
/// correct that position's row count and cost
pub fn advance_sj_state(model: &CostModel<'_>, sjm: &[Option<SjmPlan>], positions: &mut [Position]) {
    let Some(idx) = positions.len().checked_sub(1) else {
        return;
    };
    let query = model.query();
    let const_map = model.stats().const_map;
    let switches = &model.config().switches;
    let placed: TableSet = positions.iter().map(|p| p.table).collect();
    let new_table = positions[idx].table;

    for (nest, sj) in query.semi_joins.iter().enumerate() {
        let inner = sj.inner_tables;
        if !inner.is_subset_of(placed) || decided(positions, nest) {
            continue;
        }
        let Some(first) = positions.iter().position(|p| inner.contains(p.table)) else {
            continue;
        };
        let outer_needed = (sj.outer_expr_tables() | sj.correlation()) - const_map - inner;
        let (rows_before, cost_before) = if first == 0 {
            (1.0, 0.0)
        } else {
            (positions[first - 1].prefix_rows, positions[first - 1].prefix_cost)
        };
        let before: TableSet = positions[..first].iter().map(|p| p.table).collect();
        let outer_before = outer_needed.is_subset_of(before);
        let contiguous = positions[first..=idx].iter().all(|p| inner.contains(p.table));
        let correlated = is_correlated(sj, const_map);

        let mut candidates: Vec<(SemiJoinStrategy, f64, f64)> = Vec::new();
        if inner.contains(new_table) && contiguous && switches.semijoin {
            if switches.firstmatch && outer_before {
                let (rows, cost) = first_match_cost(model, positions, first, rows_before, cost_before);
                candidates.push((SemiJoinStrategy::FirstMatch, rows, cost));
            }
            if switches.loosescan && !correlated {
                let first_table = positions[first].table;
                if let Some((index, key_parts)) = loose_scan_index(query, nest, first_table) {
                    if let Some((rows, cost)) =
                        loose_scan_cost(model, positions, first, index, key_parts, rows_before, cost_before)
                    {
                        candidates.push((SemiJoinStrategy::LooseScan { index, key_parts }, rows, cost));
                    }
                }
            }
            if let Some(Some(plan)) = sjm.get(nest) {
                if outer_before {
                    candidates.push((
                        SemiJoinStrategy::MaterializeLookup,
                        rows_before,
                        cost_before + plan.materialize_cost + rows_before * plan.lookup_cost,
                    ));
                } else if sj.inner_exprs.iter().all(|e| e.as_column().is_some()) {
                    let rows = rows_before * plan.rows;
                    candidates.push((
                        SemiJoinStrategy::MaterializeScan,
                        rows,
                        cost_before + plan.materialize_cost + rows_before * plan.scan_cost,
                    ));
                }
            }
        }
        if outer_needed.is_subset_of(placed) {
            let outer_fanout = positions[first..=idx]
                .iter()
                .filter(|p| !inner.contains(p.table))
                .fold(1.0, |acc, p| acc * p.access.records);
            let current = &positions[idx];
            candidates.push((
                SemiJoinStrategy::DuplicateWeedout,
                rows_before * outer_fanout,
                current.prefix_cost + current.prefix_rows * 2.0 * TEMPTABLE_ROW_COST,
            ));
        }

        let mut best: Option<(SemiJoinStrategy, f64, f64)> = None;
        for c in candidates {
            if best.map_or(true, |b| c.2 < b.2) {
                best = Some(c);
            }
        }
        if let Some((strategy, rows, cost)) = best {
            let pos = &mut positions[idx];
            pos.prefix_rows = rows;
            pos.prefix_cost = cost;
            pos.semi_joins.push(SemiJoinDecision {
                nest,
                strategy,
                first,
                last: idx,
            });
        }
    }
}

/// Re-cost the inner run without join buffers; the inner fan-out is capped
/// at one row per outer row
fn first_match_cost(
    model: &CostModel<'_>,
    positions: &[Position],
    first: usize,
    rows_before: f64,
    cost_before: f64,
) -> (f64, f64) {
    let mut prefix: Vec<Position> = positions[..first].to_vec();
    let mut rows = rows_before;
    let mut cost = cost_before;
    for p in &positions[first..] {
        let access = model.best_access_path(p.table, &prefix, rows, false);
        let next = Position::new(p.table, access, rows, cost);
        rows = next.prefix_rows;
        cost = next.prefix_cost;
        prefix.push(next);
    }
    let fanout = rows / rows_before.max(f64::MIN_POSITIVE);
    (rows_before * fanout.min(1.0), cost)
}

/// Index scan of the first inner table, one group per distinct IN value
fn loose_scan_cost(
    model: &CostModel<'_>,
    positions: &[Position],
    first: usize,
    index: usize,
    key_parts: usize,
    rows_before: f64,
    cost_before: f64,
) -> Option<(f64, f64)> {
    let table = positions[first].table;
    let stats = &model.stats().tables[table];
    let per_key = model
        .query()
        .table(table)
        .source
        .rows_per_key(index, key_parts)?;
    let groups = (stats.records / per_key.max(1.0)).max(1.0);
    let mut cost = cost_before + rows_before * (stats.scan_cost + stats.records * ROW_EVALUATE_COST);
    let mut fanout = 1.0;
    let scale = (rows_before * groups) / positions[first].prefix_rows.max(f64::MIN_POSITIVE);
    for p in &positions[first + 1..] {
        fanout *= p.access.records;
        cost += scale * (p.access.read_cost + p.prefix_rows * ROW_EVALUATE_COST);
    }
    Some((rows_before * groups * fanout.min(1.0), cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType, TableDef};
    use crate::config::OptimizerConfig;
    use crate::planner::expr::Expr;
    use crate::planner::keyuse::KeyUseAnalyzer;
    use crate::planner::query::QueryBuilder;
    use crate::planner::stats::{StatisticsCollector, StatsOutcome};
    use crate::planner::test_utils::{generated, int_def, source, with_index};

    async fn plan_with(query: &QueryBlock, config: OptimizerConfig) -> crate::planner::search::BestPlan {
        let keyuses = KeyUseAnalyzer::new(query).analyze();
        let kill = KillFlag::new();
        let stats = match StatisticsCollector::new(query, &keyuses, &kill)
            .collect()
            .await
            .unwrap()
        {
            StatsOutcome::Ready(stats) => stats,
            StatsOutcome::ZeroRows(reason) => panic!("unexpected zero rows: {}", reason),
        };
        let model = CostModel::new(query, &stats, &keyuses, &config);
        let sjm = plan_materializations(&model, &kill).unwrap();
        JoinSearch::new(&model, &sjm, &kill).run().unwrap()
    }

    /// outer(a) x`outer_rows` IN-joined with inner(b idx) x`inner_rows`
    fn in_query(outer_rows: usize, inner_rows: usize, distinct: usize) -> QueryBlock {
        let mut qb = QueryBuilder::new();
        let outer = qb
            .table("o", source(int_def("o", &["a"], None), generated(outer_rows, 1, |i, _| i as i64)))
            .unwrap();
        let inner = qb
            .table(
                "i",
                source(
                    with_index(int_def("i", &["b"], None), "b", &["b"]),
                    generated(inner_rows, 1, |i, _| (i % distinct) as i64),
                ),
            )
            .unwrap();
        qb.semi_join(&[inner], vec![Expr::col(outer, 0)], vec![Expr::col(inner, 0)], None)
            .unwrap();
        qb.select_column(outer, 0);
        qb.build().unwrap()
    }

    fn decisions(plan: &crate::planner::search::BestPlan) -> Vec<SemiJoinDecision> {
        plan.positions
            .iter()
            .flat_map(|p| p.semi_joins.iter().copied())
            .collect()
    }

    #[test]
    fn test_loose_scan_index_needs_covering_prefix() {
        let def = TableDef::new("t")
            .column(ColumnDef::new("a", DataType::Int))
            .column(ColumnDef::new("b", DataType::Int))
            .index(crate::catalog::IndexDef::new("ab", ["a", "b"]));
        let mut qb = QueryBuilder::new();
        let o = qb.table("o", source(int_def("o", &["x", "y"], None), vec![])).unwrap();
        let t = qb.table("t", source(def, vec![])).unwrap();
        qb.semi_join(
            &[t],
            vec![Expr::col(o, 1), Expr::col(o, 0)],
            vec![Expr::col(t, 1), Expr::col(t, 0)],
            None,
        )
        .unwrap();
        let query = qb.build().unwrap();
        assert_eq!(loose_scan_index(&query, 0, t), Some((0, 2)));

        let mut qb = QueryBuilder::new();
        let o = qb.table("o", source(int_def("o", &["x"], None), vec![])).unwrap();
        let def = TableDef::new("t")
            .column(ColumnDef::new("a", DataType::Int))
            .column(ColumnDef::new("b", DataType::Int))
            .index(crate::catalog::IndexDef::new("ab", ["a", "b"]));
        let t = qb.table("t", source(def, vec![])).unwrap();
        qb.semi_join(&[t], vec![Expr::col(o, 0)], vec![Expr::col(t, 1)], None)
            .unwrap();
        let query = qb.build().unwrap();
        assert_eq!(loose_scan_index(&query, 0, t), None);
    }

    #[tokio::test]
    async fn test_every_semi_join_gets_a_strategy() {
        let query = in_query(20, 500, 50);
        let plan = plan_with(&query, OptimizerConfig::default()).await;
        let chosen = decisions(&plan);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].nest, 0);
        assert!(chosen[0].first <= chosen[0].last);
    }

    #[tokio::test]
    async fn test_weedout_is_the_fallback() {
        let mut switches = crate::config::OptimizerSwitches::default();
        switches.semijoin = false;
        let query = in_query(20, 500, 50);
        let plan = plan_with(&query, OptimizerConfig::default().with_switches(switches)).await;
        let chosen = decisions(&plan);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].strategy, SemiJoinStrategy::DuplicateWeedout);
    }

    #[tokio::test]
    async fn test_strategy_caps_rows_at_outer_rows() {
        let mut query = in_query(20, 500, 50);
        query.straight_join = true;
        let plan = plan_with(&query, OptimizerConfig::default()).await;
        assert_eq!(plan.table_order(), vec![0, 1]);
        // Each outer row survives at most once
        assert!(plan.rows <= 20.0 + 1e-9);
        let chosen = decisions(&plan);
        assert_eq!(chosen.len(), 1);
        assert_ne!(chosen[0].strategy, SemiJoinStrategy::MaterializeScan);
    }

    #[tokio::test]
    async fn test_materialization_counts_distinct_keys() {
        let query = in_query(20, 500, 50);
        let config = OptimizerConfig::default();
        let keyuses = KeyUseAnalyzer::new(&query).analyze();
        let kill = KillFlag::new();
        let stats = match StatisticsCollector::new(&query, &keyuses, &kill)
            .collect()
            .await
            .unwrap()
        {
            StatsOutcome::Ready(stats) => stats,
            StatsOutcome::ZeroRows(reason) => panic!("unexpected zero rows: {}", reason),
        };
        let model = CostModel::new(&query, &stats, &keyuses, &config);
        let plans = plan_materializations(&model, &kill).unwrap();
        let plan = plans[0].as_ref().unwrap();
        assert_eq!(plan.positions.len(), 1);
        assert_eq!(plan.positions[0].table, 1);
        assert!((plan.rows - 50.0).abs() < 1e-9);
    }
}
