//! Plan materializer
//!
//! Turns the positions chosen by the search into a [`JoinPlan`]: resolves
//! access paths into lookup-key builders, links outer-join brackets,
//! distributes conditions to the earliest node that can evaluate them,
//! marks semi-join ranges and attaches join buffers where allowed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::OptimizerConfig;
use crate::executor::eval::eval;
use crate::planner::cost::{AccessKind, AccessPath, CostModel};
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::expr::{Expr, Guard, GuardKind};
use crate::planner::keyuse::{KeyOptimize, KeyUse, KeyUseSet};
use crate::planner::query::{ConjunctOrigin, NestKind, OrderItem, QueryBlock, SelectItem};
use crate::planner::search::{BestPlan, Position};
use crate::planner::semijoin::{SemiJoinDecision, SemiJoinStrategy};
use crate::planner::stats::JoinStatistics;
use crate::planner::table_set::{TableId, TableSet};

use super::{
    AccessMethod, Bracket, BufferKind, JoinNode, JoinPlan, KeyPart, KeyPartSource, LookupKey,
    LooseScanSpec, MaterializedNest, OutputSpec, WeedoutRange,
};

/// Builds executable plans for one optimized query block
pub struct PlanMaterializer<'a> {
    query: Arc<QueryBlock>,
    stats: &'a JoinStatistics,
    keyuses: &'a KeyUseSet,
    config: &'a OptimizerConfig,
}

impl<'a> PlanMaterializer<'a> {
    pub fn new(
        query: Arc<QueryBlock>,
        stats: &'a JoinStatistics,
        keyuses: &'a KeyUseSet,
        config: &'a OptimizerConfig,
    ) -> Self {
        Self {
            query,
            stats,
            keyuses,
            config,
        }
    }

    /// Materialize a complete order; materialized semi-joins must already
    /// have their inner order written into `best`
    pub fn materialize(&self, best: &BestPlan) -> PlannerResult<JoinPlan> {
        let query = &*self.query;
        let positions = &best.positions[best.const_count..];
        let decisions: Vec<SemiJoinDecision> = positions
            .iter()
            .flat_map(|p| p.semi_joins.iter().copied())
            .map(|d| SemiJoinDecision {
                first: d.first - best.const_count,
                last: d.last - best.const_count,
                ..d
            })
            .collect();
        let strategy_of = |nest: usize| {
            decisions
                .iter()
                .find(|d| d.nest == nest)
                .map(|d| d.strategy)
        };

        let mut nodes: Vec<JoinNode> = Vec::with_capacity(positions.len());
        let mut node_of_pos = vec![0; positions.len()];
        let mut node_of_table: Vec<Option<usize>> = vec![None; query.table_count()];
        let mut materialized = Vec::new();
        let mut buffer_requests = Vec::new();
        for (p, pos) in positions.iter().enumerate() {
            if let Some(existing) = node_of_table[pos.table] {
                node_of_pos[p] = existing;
                continue;
            }
            let sj = query.table(pos.table).semi_join;
            let node = match (sj, sj.and_then(strategy_of)) {
                (
                    Some(nest),
                    Some(s @ (SemiJoinStrategy::MaterializeLookup | SemiJoinStrategy::MaterializeScan)),
                ) => {
                    let sj = &query.semi_joins[nest];
                    let block: Vec<Position> = positions
                        .iter()
                        .filter(|q| sj.inner_tables.contains(q.table))
                        .cloned()
                        .collect();
                    let sub = self.sub_plan(nest, &block)?;
                    let lookup = s == SemiJoinStrategy::MaterializeLookup;
                    let access = if lookup {
                        AccessMethod::MaterializedLookup {
                            nest,
                            key: sj.outer_exprs.clone(),
                        }
                    } else {
                        AccessMethod::MaterializedScan { nest }
                    };
                    let mut node = JoinNode::new(pos.table, access);
                    node.tables = sj.inner_tables;
                    node.estimated_rows = if lookup { 1.0 } else { sub.rows };
                    materialized.push(MaterializedNest {
                        nest,
                        plan: Arc::new(sub),
                        copy_back: sj.inner_exprs.iter().map(Expr::as_column).collect(),
                    });
                    buffer_requests.push(false);
                    node
                }
                _ => {
                    let mut node = JoinNode::new(pos.table, self.access_method(pos.table, &pos.access)?);
                    node.estimated_rows = pos.access.records;
                    node.not_exists = self.keyuses.not_exists_tables.contains(pos.table)
                        && query.outer_join_nest(pos.table).is_some();
                    buffer_requests.push(pos.access.use_join_buffer);
                    node
                }
            };
            for t in node.tables.iter() {
                node_of_table[t] = Some(nodes.len());
            }
            node_of_pos[p] = nodes.len();
            nodes.push(node);
        }

        let is_materialized = |nest: usize| {
            matches!(
                strategy_of(nest),
                Some(SemiJoinStrategy::MaterializeLookup | SemiJoinStrategy::MaterializeScan)
            )
        };
        let mut brackets = self.link_brackets(&mut nodes, &node_of_table)?;
        self.attach_conditions(&mut nodes, &mut brackets, &node_of_table, |origin| match origin {
            ConjunctOrigin::Where => true,
            // The lookup itself enforces the IN equalities
            ConjunctOrigin::SemiJoinEquality { nest, .. } => {
                strategy_of(nest) != Some(SemiJoinStrategy::MaterializeLookup)
            }
            ConjunctOrigin::SemiJoinWhere { nest } => !is_materialized(nest),
        })?;

        let mut unbuffered = Vec::new();
        let mut weedouts = Vec::new();
        for d in &decisions {
            let (first, last) = (node_of_pos[d.first], node_of_pos[d.last]);
            match d.strategy {
                SemiJoinStrategy::DuplicateWeedout => weedouts.push(WeedoutRange {
                    nest: d.nest,
                    first,
                    last,
                    key_nodes: Vec::new(),
                }),
                SemiJoinStrategy::FirstMatch => {
                    nodes[last].return_after_match = Some(first.checked_sub(1));
                    unbuffered.push((first, last));
                }
                SemiJoinStrategy::LooseScan { index, key_parts } => {
                    let table = nodes[first].table;
                    let columns = query.table(table).keys[index].parts[..key_parts].to_vec();
                    nodes[first].access = AccessMethod::IndexScan { index };
                    nodes[first].loose_scan = Some(LooseScanSpec { columns, last });
                    nodes[last].return_after_match = Some(Some(first));
                    unbuffered.push((first, last));
                }
                SemiJoinStrategy::MaterializeLookup | SemiJoinStrategy::MaterializeScan => {}
            }
        }

        let model = CostModel::new(query, self.stats, self.keyuses, self.config);
        self.attach_buffers(&mut nodes, &buffer_requests, &unbuffered, &model);

        for (id, w) in weedouts.iter_mut().enumerate() {
            if nodes[w.first..=w.last].iter().any(|n| n.buffer.is_some()) {
                w.first = 0;
            }
            let inner = query.semi_joins[w.nest].inner_tables;
            w.key_nodes = (w.first..=w.last)
                .filter(|&i| !nodes[i].tables.intersects(inner))
                .collect();
            nodes[w.first].weedout_reset.push(id);
            nodes[w.last].weedout_check.push(id);
        }

        let output = self.output_spec(&mut nodes);
        let plan = JoinPlan {
            query: Arc::clone(&self.query),
            const_tables: self.stats.const_order.iter().map(|&(t, _)| t).collect(),
            const_rows: self.stats.const_rows.clone(),
            nodes,
            brackets,
            weedouts,
            materialized,
            output,
            buffer_size: self.config.buffer_size(),
            cost: best.cost,
            rows: best.rows,
        };
        debug!(
            order = ?plan.table_order(),
            access = ?plan.nodes.iter().map(|n| n.access.name()).collect::<Vec<_>>(),
            buffers = plan.nodes.iter().filter(|n| n.buffer.is_some()).count(),
            sort = plan.output.sort,
            "join plan materialized"
        );
        Ok(plan)
    }

    /// Plan producing the IN values of one materialized semi-join
    fn sub_plan(&self, nest: usize, block: &[Position]) -> PlannerResult<JoinPlan> {
        let query = &*self.query;
        let mut nodes = Vec::with_capacity(block.len());
        let mut node_of_table: Vec<Option<usize>> = vec![None; query.table_count()];
        let mut requests = Vec::with_capacity(block.len());
        for pos in block {
            let mut node = JoinNode::new(pos.table, self.access_method(pos.table, &pos.access)?);
            node.estimated_rows = pos.access.records;
            node_of_table[pos.table] = Some(nodes.len());
            requests.push(pos.access.use_join_buffer);
            nodes.push(node);
        }
        let mut brackets = vec![None; query.nests.len()];
        self.attach_conditions(&mut nodes, &mut brackets, &node_of_table, |origin| {
            origin == ConjunctOrigin::SemiJoinWhere { nest }
        })?;
        let model = CostModel::new(query, self.stats, self.keyuses, self.config);
        self.attach_buffers(&mut nodes, &requests, &[], &model);
        let (cost, rows) = block
            .last()
            .map_or((0.0, 1.0), |p| (p.prefix_cost, p.prefix_rows));
        Ok(JoinPlan {
            query: Arc::clone(&self.query),
            const_tables: Vec::new(),
            const_rows: self.stats.const_rows.clone(),
            nodes,
            brackets,
            weedouts: Vec::new(),
            materialized: Vec::new(),
            output: OutputSpec {
                select: query.semi_joins[nest]
                    .inner_exprs
                    .iter()
                    .cloned()
                    .map(SelectItem::Expr)
                    .collect(),
                ..OutputSpec::default()
            },
            buffer_size: self.config.buffer_size(),
            cost,
            rows,
        })
    }

    fn access_method(&self, table: TableId, path: &AccessPath) -> PlannerResult<AccessMethod> {
        let key = path.key.as_ref();
        let method = match path.kind {
            AccessKind::Const => AccessMethod::ConstLookup,
            AccessKind::EqRef => AccessMethod::UniqueLookup(self.lookup_key(path)?),
            AccessKind::Ref => AccessMethod::NonUniqueLookup(self.lookup_key(path)?),
            AccessKind::RefOrNull => {
                let key = self.lookup_key(path)?;
                let null_part = path
                    .key
                    .iter()
                    .flat_map(|k| k.parts.iter())
                    .position(|k| k.optimize == KeyOptimize::RefOrNull)
                    .ok_or_else(|| PlannerError::Internal("ref_or_null without NULL part".to_string()))?;
                AccessMethod::RefOrNull { key, null_part }
            }
            AccessKind::FullText => {
                let k = key.ok_or_else(|| PlannerError::Internal("fulltext access without key".to_string()))?;
                match k.parts.first().map(|p| &p.val) {
                    Some(Expr::Match { query, .. }) => AccessMethod::FullTextLookup {
                        index: k.index,
                        query: query.clone(),
                    },
                    _ => return Err(PlannerError::Internal("fulltext access without query".to_string())),
                }
            }
            AccessKind::Hash => AccessMethod::HashProbe {
                probe: key
                    .map(|k| k.parts.iter().map(|p| (p.val.clone(), p.keypart)).collect())
                    .unwrap_or_default(),
            },
            AccessKind::Range => match &self.stats.tables[table].range {
                Some(range) => AccessMethod::RangeScan {
                    index: range.index,
                    ranges: range.ranges.clone(),
                },
                None => AccessMethod::FullScan,
            },
            AccessKind::Scan => AccessMethod::FullScan,
            AccessKind::LooseIndexScan => AccessMethod::LooseIndexScan {
                index: key.map_or(0, |k| k.index),
                prefix: path.loose_prefix,
            },
        };
        Ok(method)
    }

    fn lookup_key(&self, path: &AccessPath) -> PlannerResult<LookupKey> {
        let key = path
            .key
            .as_ref()
            .ok_or_else(|| PlannerError::Internal("lookup access without key".to_string()))?;
        let parts = key
            .parts
            .iter()
            .map(|k| {
                Ok(KeyPart {
                    source: self.key_source(k)?,
                    null_rejecting: k.null_rejecting && k.optimize == KeyOptimize::Plain,
                })
            })
            .collect::<PlannerResult<Vec<_>>>()?;
        Ok(LookupKey {
            index: key.index,
            parts,
        })
    }

    fn key_source(&self, keyuse: &KeyUse) -> PlannerResult<KeyPartSource> {
        let val = &keyuse.val;
        if val.used_tables().is_subset_of(self.stats.const_map) {
            return Ok(KeyPartSource::Const(eval(val, &self.stats.const_source())?));
        }
        Ok(match val.as_column() {
            Some(c) => KeyPartSource::Field(c),
            None => KeyPartSource::Expr(val.clone()),
        })
    }

    fn link_brackets(
        &self,
        nodes: &mut [JoinNode],
        node_of_table: &[Option<usize>],
    ) -> PlannerResult<Vec<Option<Bracket>>> {
        let query = &*self.query;
        let mut brackets: Vec<Option<Bracket>> = vec![None; query.nests.len()];
        for (id, nest) in query.nests.iter().enumerate() {
            if nest.kind != NestKind::LeftOuter {
                continue;
            }
            let placed: Vec<usize> = nest.tables.iter().filter_map(|t| node_of_table[t]).collect();
            let (Some(&first), Some(&last)) = (placed.iter().min(), placed.iter().max()) else {
                continue;
            };
            if last - first + 1 != placed.len() {
                return Err(PlannerError::Internal(format!(
                    "outer join nest {} is not contiguous in the join order",
                    id
                )));
            }
            brackets[id] = Some(Bracket {
                nest: id,
                first,
                last,
                parent: None,
                precondition: None,
            });
            nodes[first].bracket = Some(id);
        }
        for id in 0..brackets.len() {
            if brackets[id].is_none() {
                continue;
            }
            let mut cur = query.nests[id].parent;
            while let Some(p) = cur {
                if brackets[p].is_some() {
                    break;
                }
                cur = query.nests[p].parent;
            }
            if let Some(b) = brackets[id].as_mut() {
                b.parent = cur;
            }
        }
        Ok(brackets)
    }

    /// Wrap `expr` in match-found guards of the brackets enclosing `table`,
    /// innermost first, stopping below `stop`
    fn guard_found(&self, brackets: &[Option<Bracket>], table: TableId, stop: Option<usize>, expr: Expr) -> Expr {
        let mut expr = expr;
        for nest in self.query.nest_chain(table) {
            if Some(nest) == stop {
                break;
            }
            if brackets.get(nest).is_some_and(Option::is_some) {
                expr = Expr::guarded(
                    Guard {
                        bracket: nest,
                        kind: GuardKind::Found,
                    },
                    expr,
                );
            }
        }
        expr
    }

    fn attach_conditions(
        &self,
        nodes: &mut [JoinNode],
        brackets: &mut [Option<Bracket>],
        node_of_table: &[Option<usize>],
        keep: impl Fn(ConjunctOrigin) -> bool,
    ) -> PlannerResult<()> {
        let query = &*self.query;
        let const_map = self.stats.const_map;
        let mut attached: Vec<Vec<Expr>> = vec![Vec::new(); nodes.len()];
        let last_node = |used: TableSet| -> PlannerResult<Option<usize>> {
            used.iter().try_fold(None, |acc: Option<usize>, t| {
                let n = node_of_table[t].ok_or_else(|| {
                    PlannerError::Internal(format!("condition reads table #{} outside the plan", t))
                })?;
                Ok(Some(acc.map_or(n, |a| a.max(n))))
            })
        };

        for c in query.conjuncts() {
            if !keep(c.origin) {
                continue;
            }
            let used = c.expr.used_tables() - const_map;
            let Some(n) = last_node(used)? else {
                continue;
            };
            let expr = self.guard_found(brackets, nodes[n].table, None, c.expr);
            attached[n].push(expr);
        }

        let mut preconditions = Vec::new();
        for (id, bracket) in brackets.iter().enumerate() {
            let Some(bracket) = bracket else {
                continue;
            };
            let Some(on) = &query.nests[id].on_expr else {
                continue;
            };
            let inner = query.nests[id].tables;
            let mut pre = Vec::new();
            for part in on.clone().into_conjuncts() {
                let used = part.used_tables() - const_map;
                if !used.intersects(inner) {
                    pre.push(part);
                    continue;
                }
                let Some(n) = last_node(used)? else {
                    continue;
                };
                if n < bracket.first || n > bracket.last {
                    return Err(PlannerError::Internal(format!(
                        "ON condition of nest {} evaluated outside its bracket",
                        id
                    )));
                }
                let guarded = self.guard_found(brackets, nodes[n].table, Some(id), part);
                attached[n].push(Expr::guarded(
                    Guard {
                        bracket: id,
                        kind: GuardKind::NotNullComplemented,
                    },
                    guarded,
                ));
            }
            preconditions.push((id, Expr::conjoin(pre)));
        }
        for (id, pre) in preconditions {
            if let Some(b) = brackets[id].as_mut() {
                b.precondition = pre;
            }
        }
        for (node, exprs) in nodes.iter_mut().zip(attached) {
            node.condition = Expr::conjoin(exprs);
        }
        Ok(())
    }

    fn attach_buffers(
        &self,
        nodes: &mut [JoinNode],
        requests: &[bool],
        unbuffered: &[(usize, usize)],
        model: &CostModel<'_>,
    ) {
        for (i, node) in nodes.iter_mut().enumerate() {
            let is_lookup = node.access.lookup_key().is_some();
            let wants_bka = is_lookup && self.config.key_batched_buffers_allowed();
            if !requests[i] && !wants_bka {
                continue;
            }
            let kind = match &node.access {
                AccessMethod::HashProbe { .. } => Some(BufferKind::Hashed),
                AccessMethod::FullScan | AccessMethod::RangeScan { .. } | AccessMethod::IndexScan { .. } => {
                    Some(BufferKind::Flat)
                }
                _ if wants_bka => Some(BufferKind::KeyBatched),
                _ => None,
            };
            let allowed = i > 0
                && kind.is_some()
                && model.join_buffer_allowed(node.table)
                && !unbuffered.iter().any(|&(f, l)| f <= i && i <= l);
            if allowed {
                node.buffer = kind;
                continue;
            }
            if requests[i] {
                warn!(
                    table = node.table,
                    access = node.access.name(),
                    "join buffer refused, reading without buffer"
                );
                if matches!(node.access, AccessMethod::HashProbe { .. }) {
                    node.access = AccessMethod::FullScan;
                }
            }
        }
    }

    /// Select list, ordering and LIMIT handling; replaces a full scan of the
    /// first table by an ordered index scan when that delivers ORDER BY
    fn output_spec(&self, nodes: &mut [JoinNode]) -> OutputSpec {
        let query = &*self.query;
        let select = if query.select_list.is_empty() {
            let hidden = query.semi_join_inner_tables();
            query
                .tables
                .iter()
                .filter(|t| !hidden.contains(t.id))
                .flat_map(|t| (0..t.column_count).map(move |c| SelectItem::Expr(Expr::col(t.id, c))))
                .collect()
        } else {
            query.select_list.clone()
        };
        let aggregate = query.is_aggregate();
        let order: Vec<_> = query
            .order_by
            .iter()
            .filter(|o| !self.stats.const_map.contains(o.column.table))
            .copied()
            .collect();
        let sort = !aggregate && !order.is_empty() && !self.index_delivers_order(nodes, &order);
        OutputSpec {
            select,
            having: query.having.clone(),
            order_by: query.order_by.clone(),
            sort,
            aggregate,
            distinct: query.selects_only_groups(),
            limit: query.limit,
            offset: query.offset,
        }
    }

    fn index_delivers_order(&self, nodes: &mut [JoinNode], order: &[OrderItem]) -> bool {
        let Some(first) = nodes.first_mut() else {
            return true;
        };
        if order.iter().any(|o| o.column.table != first.table) || first.loose_scan.is_some() {
            return false;
        }
        let descending = order[0].descending;
        if order.iter().any(|o| o.descending != descending) {
            return false;
        }
        let columns: Vec<usize> = order.iter().map(|o| o.column.column).collect();
        let keys = &self.query.table(first.table).keys;
        let Some(index) = keys
            .iter()
            .position(|k| !k.fulltext && k.parts.len() >= columns.len() && k.parts[..columns.len()] == columns[..])
        else {
            return false;
        };
        match first.access {
            AccessMethod::FullScan => {
                first.access = if descending {
                    AccessMethod::IndexScanReverse { index }
                } else {
                    AccessMethod::IndexScan { index }
                };
                true
            }
            AccessMethod::IndexScan { index: i } if i == index && !descending => true,
            _ => false,
        }
    }
}
