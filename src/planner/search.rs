//! Join order search
//!
//! Greedy search over depth-limited exhaustive extensions: from the current
//! prefix, every ordering of up to `search_depth` further tables is costed,
//! the first table of the cheapest one is committed, and the search repeats
//! until the remaining tables fit within one exhaustive extension.
//!
//! A table may follow a prefix only when every table it depends on is
//! already placed and the outer-join nests stay contiguous: once a nest has
//! a table in the prefix, the nest must be completed before any table
//! outside it is placed.

use tracing::{debug, trace};

use crate::config::PruneLevel;
use crate::executor::context::KillFlag;
use crate::planner::cost::{AccessPath, CostModel, COST_EPS, ROW_EVALUATE_COST};
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::query::QueryBlock;
use crate::planner::semijoin::{advance_sj_state, SemiJoinDecision, SjmPlan};
use crate::planner::table_set::{TableId, TableSet};

/// One table of a join order with the cost of the prefix ending there
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub table: TableId,
    pub access: AccessPath,
    /// Rows produced by the prefix ending at this position
    pub prefix_rows: f64,
    /// Cost of the prefix ending at this position
    pub prefix_cost: f64,
    /// Semi-joins whose strategy was fixed at this position
    pub semi_joins: Vec<SemiJoinDecision>,
}

impl Position {
    /// Place `table` after a prefix that produced `rows_before` rows at
    /// `cost_before`
    pub fn new(table: TableId, access: AccessPath, rows_before: f64, cost_before: f64) -> Self {
        let prefix_rows = rows_before * access.records;
        let prefix_cost = cost_before + access.read_cost + prefix_rows * ROW_EVALUATE_COST;
        Self {
            table,
            access,
            prefix_rows,
            prefix_cost,
            semi_joins: Vec::new(),
        }
    }

    /// Position of a constant table
    pub fn constant(table: TableId) -> Self {
        Self {
            table,
            access: AccessPath::constant(),
            prefix_rows: 1.0,
            prefix_cost: 0.0,
            semi_joins: Vec::new(),
        }
    }
}

/// Complete join order, constant tables first
#[derive(Debug, Clone)]
pub struct BestPlan {
    pub positions: Vec<Position>,
    pub const_count: usize,
    pub cost: f64,
    pub rows: f64,
}

impl BestPlan {
    pub fn table_order(&self) -> Vec<TableId> {
        self.positions.iter().map(|p| p.table).collect()
    }
}

/// Progress through the outer-join nests of a partial order
#[derive(Debug, Clone)]
struct NestTracker {
    /// Placed children of each nest; a completed child nest counts as one
    counters: Vec<usize>,
    /// Children of each nest left to place, constant tables excluded
    sizes: Vec<usize>,
    /// Nests with some but not all children placed
    open: u64,
}

impl NestTracker {
    fn new(query: &QueryBlock, const_map: TableSet) -> Self {
        let mut sizes = vec![0; query.nests.len()];
        for t in query.all_tables().iter() {
            if const_map.contains(t) {
                continue;
            }
            if let Some(n) = query.table(t).embedding {
                sizes[n] += 1;
            }
        }
        let depth = |mut n: usize| {
            let mut d = 0;
            while let Some(p) = query.nests[n].parent {
                d += 1;
                n = p;
            }
            d
        };
        let mut innermost_first: Vec<usize> = (0..query.nests.len()).collect();
        innermost_first.sort_by_key(|&n| std::cmp::Reverse(depth(n)));
        for n in innermost_first {
            if sizes[n] > 0 {
                if let Some(parent) = query.nests[n].parent {
                    sizes[parent] += 1;
                }
            }
        }
        Self {
            counters: vec![0; query.nests.len()],
            sizes,
            open: 0,
        }
    }

    /// Tracker after placing `table`, or `None` when placing it now would
    /// interleave an open nest with an outside table
    fn place(&self, query: &QueryBlock, table: TableId) -> Option<Self> {
        let chain = query.nest_chain(table);
        let embedding = chain.iter().fold(0u64, |acc, &n| acc | (1 << n));
        if self.open & !embedding != 0 {
            return None;
        }
        let mut next = self.clone();
        for n in chain {
            next.counters[n] += 1;
            if next.counters[n] == 1 {
                next.open |= 1 << n;
            }
            if next.counters[n] < next.sizes[n] {
                break;
            }
            next.open &= !(1 << n);
        }
        Some(next)
    }
}

/// Join order search for one query block
pub struct JoinSearch<'a> {
    model: &'a CostModel<'a>,
    sjm: &'a [Option<SjmPlan>],
    kill: &'a KillFlag,
    allowed: TableSet,
    semi_joins: bool,
    sort_by_table: Option<TableId>,
    /// Free tables ordered by estimated rows
    candidates: Vec<TableId>,
    best: Option<(Vec<Position>, f64)>,
    best_read: f64,
}

impl<'a> JoinSearch<'a> {
    pub fn new(model: &'a CostModel<'a>, sjm: &'a [Option<SjmPlan>], kill: &'a KillFlag) -> Self {
        let stats = model.stats();
        let mut search = Self {
            model,
            sjm,
            kill,
            allowed: stats.free_tables(),
            semi_joins: true,
            sort_by_table: sort_by_table(model.query(), stats.const_map),
            candidates: Vec::new(),
            best: None,
            best_read: f64::INFINITY,
        };
        search.order_candidates();
        search
    }

    /// Only place tables of `allowed`
    #[must_use]
    pub fn with_allowed(mut self, allowed: TableSet) -> Self {
        self.allowed = allowed - self.model.stats().const_map;
        self.sort_by_table = self.sort_by_table.filter(|t| allowed.contains(*t));
        self.order_candidates();
        self
    }

    /// Skip semi-join strategy selection
    #[must_use]
    pub fn without_semi_joins(mut self) -> Self {
        self.semi_joins = false;
        self
    }

    fn order_candidates(&mut self) {
        let tables = &self.model.stats().tables;
        let mut candidates: Vec<TableId> = self.allowed.iter().collect();
        candidates.sort_by(|&a, &b| {
            tables[a]
                .found_records
                .total_cmp(&tables[b].found_records)
                .then(a.cmp(&b))
        });
        self.candidates = candidates;
    }

    /// Find the cheapest complete order
    pub fn run(mut self) -> PlannerResult<BestPlan> {
        let stats = self.model.stats();
        let query = self.model.query();
        let positions: Vec<Position> = stats
            .const_order
            .iter()
            .map(|&(t, _)| Position::constant(t))
            .collect();
        let const_count = positions.len();
        let tracker = NestTracker::new(query, stats.const_map);

        let plan = if self.allowed.is_empty() {
            BestPlan {
                positions,
                const_count,
                cost: 0.0,
                rows: 1.0,
            }
        } else if query.straight_join {
            let order: Vec<TableId> = self.allowed.iter().collect();
            self.forced(&order, positions, tracker, const_count)?
        } else {
            self.greedy(positions, tracker, const_count)?
        };
        debug!(
            order = ?plan.table_order(),
            cost = plan.cost,
            rows = plan.rows,
            "join order chosen"
        );
        Ok(plan)
    }

    /// Cost a caller-chosen order of the free tables
    pub fn run_in_order(self, order: &[TableId]) -> PlannerResult<BestPlan> {
        let stats = self.model.stats();
        let given: TableSet = order.iter().copied().collect();
        if given != self.allowed || given.len() != order.len() {
            return Err(PlannerError::InvalidQuery(
                "order must list every non-constant table once".to_string(),
            ));
        }
        let positions: Vec<Position> = stats
            .const_order
            .iter()
            .map(|&(t, _)| Position::constant(t))
            .collect();
        let const_count = positions.len();
        let tracker = NestTracker::new(self.model.query(), stats.const_map);
        self.forced(order, positions, tracker, const_count)
    }

    /// Fixed order, rejected when it violates a dependency
    fn forced(
        &self,
        order: &[TableId],
        mut positions: Vec<Position>,
        mut tracker: NestTracker,
        const_count: usize,
    ) -> PlannerResult<BestPlan> {
        let query = self.model.query();
        let stats = self.model.stats();
        for &t in order {
            let placed: TableSet = positions.iter().map(|p| p.table).collect();
            if !stats.tables[t].dependent.is_subset_of(placed | stats.const_map) {
                return Err(PlannerError::Configuration(format!(
                    "table '{}' is joined before the tables it depends on",
                    query.table(t).alias
                )));
            }
            tracker = tracker.place(query, t).ok_or_else(|| {
                PlannerError::Configuration(format!(
                    "table '{}' would split a nested join",
                    query.table(t).alias
                ))
            })?;
            self.push(&mut positions, t, const_count);
        }
        let cost = self.total_cost(&positions, const_count);
        let rows = positions.last().map_or(1.0, |p| p.prefix_rows);
        Ok(BestPlan {
            positions,
            const_count,
            cost,
            rows,
        })
    }

    fn greedy(
        &mut self,
        mut positions: Vec<Position>,
        mut tracker: NestTracker,
        const_count: usize,
    ) -> PlannerResult<BestPlan> {
        let query = self.model.query();
        let mut remaining = self.allowed;
        loop {
            let depth = self.model.config().effective_search_depth(remaining.len());
            self.best = None;
            self.best_read = f64::INFINITY;
            self.extend(&mut positions, &tracker, remaining, depth, const_count)?;
            let Some((best, cost)) = self.best.take() else {
                return Err(PlannerError::Configuration(
                    "no join order satisfies the table dependencies".to_string(),
                ));
            };
            if remaining.len() <= depth {
                let rows = best.last().map_or(1.0, |p| p.prefix_rows);
                return Ok(BestPlan {
                    positions: best,
                    const_count,
                    cost,
                    rows,
                });
            }
            let next = best[positions.len()].clone();
            trace!(table = next.table, "greedy search committed table");
            tracker = tracker
                .place(query, next.table)
                .ok_or_else(|| PlannerError::Internal("committed table breaks nesting".to_string()))?;
            remaining.remove(next.table);
            positions.push(next);
        }
    }

    /// Append `table` with its best access and settle semi-joins it completes
    fn push(&self, positions: &mut Vec<Position>, table: TableId, const_count: usize) {
        let (rows, cost) = positions
            .last()
            .map_or((1.0, 0.0), |p| (p.prefix_rows, p.prefix_cost));
        let allow_buffer = positions.len() > const_count && self.model.join_buffer_allowed(table);
        let access = self
            .model
            .best_access_path(table, positions, rows, allow_buffer);
        positions.push(Position::new(table, access, rows, cost));
        if self.semi_joins {
            advance_sj_state(self.model, self.sjm, positions);
        }
    }

    /// Prefix cost plus sorting when the first table does not deliver the
    /// requested order
    fn total_cost(&self, positions: &[Position], const_count: usize) -> f64 {
        let Some(last) = positions.last() else {
            return 0.0;
        };
        match (self.sort_by_table, positions.get(const_count)) {
            (Some(sort), Some(first)) if first.table != sort => last.prefix_cost + last.prefix_rows,
            _ => last.prefix_cost,
        }
    }

    fn extend(
        &mut self,
        positions: &mut Vec<Position>,
        tracker: &NestTracker,
        remaining: TableSet,
        depth: usize,
        const_count: usize,
    ) -> PlannerResult<()> {
        let query = self.model.query();
        let stats = self.model.stats();
        let heuristic = self.model.config().prune_level == PruneLevel::Heuristic;
        let idx = positions.len();
        let mut level_rows = f64::INFINITY;
        let mut level_cost = f64::INFINITY;

        for i in 0..self.candidates.len() {
            let t = self.candidates[i];
            if !remaining.contains(t) || stats.tables[t].dependent.intersects(remaining) {
                continue;
            }
            let Some(next_tracker) = tracker.place(query, t) else {
                continue;
            };
            self.push(positions, t, const_count);
            let (rows, cost) = (positions[idx].prefix_rows, positions[idx].prefix_cost);

            if cost >= self.best_read {
                trace!(table = t, cost, "prefix pruned by best plan");
                positions.pop();
                continue;
            }
            if heuristic {
                let sort_first = idx == const_count && Some(t) == self.sort_by_table;
                if level_rows > rows || level_cost > cost || sort_first {
                    let key_dependent = stats.tables[t].key_dependent & self.allowed & remaining;
                    if level_rows >= rows
                        && level_cost >= cost
                        && (key_dependent.is_empty() || positions[idx].access.records < 2.0)
                    {
                        level_rows = rows;
                        level_cost = cost;
                    }
                } else {
                    trace!(table = t, "prefix pruned by heuristic");
                    positions.pop();
                    continue;
                }
            }

            let rest = remaining - TableSet::single(t);
            if depth > 1 && !rest.is_empty() {
                self.extend(positions, &next_tracker, rest, depth - 1, const_count)?;
            } else {
                let total = self.total_cost(positions, const_count);
                if total < self.best_read {
                    if self.kill.is_killed() {
                        return Err(PlannerError::Killed);
                    }
                    trace!(order = ?positions.iter().map(|p| p.table).collect::<Vec<_>>(), total, "new best plan");
                    self.best = Some((positions.clone(), total));
                    self.best_read = total - COST_EPS;
                }
            }
            positions.pop();
        }
        Ok(())
    }
}

/// Table supplying every ORDER BY and GROUP BY column, unless constant
fn sort_by_table(query: &QueryBlock, const_map: TableSet) -> Option<TableId> {
    let mut columns = query
        .order_by
        .iter()
        .map(|o| o.column)
        .chain(query.group_by.iter().copied());
    let first = columns.next()?.table;
    if columns.all(|c| c.table == first) && !const_map.contains(first) {
        Some(first)
    } else {
        None
    }
}
