//! Query optimizer
//!
//! Drives one query block from its declared form to an executable plan:
//!
//! ```text
//! QueryBlock
//!   → rewrite rules (constant folding, nest flattening, outer-join simplification)
//!   → KeyUseAnalyzer          key-usage candidates
//!   → StatisticsCollector     row estimates, constant tables, dependencies
//!   → plan_materializations   independent plans for materializable semi-joins
//!   → JoinSearch              cheapest table order
//!   → PlanMaterializer        JoinPlan
//! ```

pub mod rules;

pub use rules::{ConstantFolding, FlattenInnerNests, OptimizationRule, OuterJoinSimplification};

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::executor::context::KillFlag;
use crate::executor::Row;
use crate::planner::cost::CostModel;
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::keyuse::KeyUseAnalyzer;
use crate::planner::physical::{JoinPlan, OutputSpec, PlanMaterializer};
use crate::planner::query::{QueryBlock, SelectItem};
use crate::planner::search::{BestPlan, JoinSearch};
use crate::planner::semijoin::{plan_materializations, SemiJoinStrategy, SjmPlan};
use crate::planner::stats::{aggregate_from_indexes, StatisticsCollector, StatsOutcome};
use crate::planner::table_set::TableId;

/// Result of optimizing one query block
#[derive(Debug)]
pub enum PlanOutcome {
    /// Run the nested-loop join
    Execute(JoinPlan),
    /// The query provably returns no join rows
    ZeroRows { reason: String, output: OutputSpec },
    /// The single result row was computed during optimization
    Synthesized { row: Row, output: OutputSpec },
}

/// Query optimizer that applies rewrite rules, then orders the joins
pub struct Optimizer {
    config: OptimizerConfig,
    rules: Vec<Box<dyn OptimizationRule>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl Optimizer {
    /// Create an optimizer with the default rules for `config`
    pub fn new(config: OptimizerConfig) -> Self {
        let mut rules: Vec<Box<dyn OptimizationRule>> = vec![Box::new(ConstantFolding)];
        if config.switches.outer_join_simplification {
            rules.push(Box::new(OuterJoinSimplification));
        } else {
            rules.push(Box::new(FlattenInnerNests));
        }
        Self { config, rules }
    }

    /// Create an optimizer with custom rules
    pub fn with_rules(config: OptimizerConfig, rules: Vec<Box<dyn OptimizationRule>>) -> Self {
        Self { config, rules }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Get the names of all rewrite rules
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Apply every rewrite rule in order
    pub fn rewrite(&self, query: QueryBlock) -> QueryBlock {
        self.rules.iter().fold(query, |q, rule| rule.apply(q))
    }

    /// Optimize a query block into an executable outcome
    pub async fn optimize(&self, query: QueryBlock, kill: &KillFlag) -> PlannerResult<PlanOutcome> {
        if kill.is_killed() {
            return Err(PlannerError::Killed);
        }
        let query = Arc::new(self.rewrite(query));
        let keyuses = KeyUseAnalyzer::new(&query).analyze();
        let stats = match StatisticsCollector::new(&query, &keyuses, kill).collect().await? {
            StatsOutcome::Ready(stats) => stats,
            StatsOutcome::ZeroRows(reason) => {
                info!(reason = %reason, "query returns no rows");
                return Ok(PlanOutcome::ZeroRows {
                    reason,
                    output: simple_output(&query),
                });
            }
        };
        if let Some(row) = aggregate_from_indexes(&query, &stats).await? {
            return Ok(PlanOutcome::Synthesized {
                row,
                output: simple_output(&query),
            });
        }

        let model = CostModel::new(&query, &stats, &keyuses, &self.config);
        let sjm = plan_materializations(&model, kill)?;
        let mut best = JoinSearch::new(&model, &sjm, kill).run()?;
        expand_materialized(&mut best, &sjm)?;
        let plan = PlanMaterializer::new(Arc::clone(&query), &stats, &keyuses, &self.config)
            .materialize(&best)?;
        Ok(PlanOutcome::Execute(plan))
    }

    /// Estimated cost of joining the non-constant tables in `order`
    pub async fn estimate_order(&self, query: QueryBlock, order: &[TableId]) -> PlannerResult<f64> {
        let query = self.rewrite(query);
        let keyuses = KeyUseAnalyzer::new(&query).analyze();
        let kill = KillFlag::new();
        let stats = match StatisticsCollector::new(&query, &keyuses, &kill)
            .without_const_tables()
            .collect()
            .await?
        {
            StatsOutcome::Ready(stats) => stats,
            StatsOutcome::ZeroRows(reason) => {
                return Err(PlannerError::InvalidQuery(format!("nothing to cost: {}", reason)));
            }
        };
        let model = CostModel::new(&query, &stats, &keyuses, &self.config);
        let plan = JoinSearch::new(&model, &[], &kill)
            .without_semi_joins()
            .run_in_order(order)?;
        debug!(order = ?order, cost = plan.cost, "forced order costed");
        Ok(plan.cost)
    }
}

/// Output of a query answered without the join
fn simple_output(query: &QueryBlock) -> OutputSpec {
    OutputSpec {
        select: query.select_list.clone(),
        having: query.having.clone(),
        order_by: Vec::new(),
        sort: false,
        aggregate: query.select_list.iter().any(SelectItem::is_aggregate),
        distinct: query.selects_only_groups(),
        limit: query.limit,
        offset: query.offset,
    }
}

/// Replace the inner positions of each materialized semi-join by the order
/// its own plan chose, keeping the costs the search charged for the block
fn expand_materialized(best: &mut BestPlan, sjm: &[Option<SjmPlan>]) -> PlannerResult<()> {
    let decisions: Vec<_> = best
        .positions
        .iter()
        .flat_map(|p| p.semi_joins.iter().copied())
        .filter(|d| {
            matches!(
                d.strategy,
                SemiJoinStrategy::MaterializeLookup | SemiJoinStrategy::MaterializeScan
            )
        })
        .collect();
    for d in decisions {
        let plan = sjm
            .get(d.nest)
            .and_then(Option::as_ref)
            .ok_or_else(|| PlannerError::Internal(format!("semi-join {} has no materialization plan", d.nest)))?;
        if plan.positions.len() != d.last - d.first + 1 {
            return Err(PlannerError::Internal(format!(
                "semi-join {} block does not match its materialization plan",
                d.nest
            )));
        }
        let last = &best.positions[d.last];
        let (rows, cost, settled) = (last.prefix_rows, last.prefix_cost, last.semi_joins.clone());
        for (slot, pos) in best.positions[d.first..=d.last].iter_mut().zip(&plan.positions) {
            *slot = pos.clone();
        }
        let last = &mut best.positions[d.last];
        last.prefix_rows = rows;
        last.prefix_cost = cost;
        last.semi_joins = settled;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::expr::Expr;
    use crate::planner::query::QueryBuilder;
    use crate::planner::test_utils::{generated, int_def, source, with_index};

    #[test]
    fn test_rules_follow_switches() {
        let optimizer = Optimizer::default();
        assert_eq!(
            optimizer.rule_names(),
            vec!["constant_folding", "outer_join_simplification"]
        );

        let mut config = OptimizerConfig::default();
        config.switches.outer_join_simplification = false;
        let optimizer = Optimizer::new(config);
        assert_eq!(optimizer.rule_names(), vec!["constant_folding", "flatten_inner_nests"]);
    }

    #[tokio::test]
    async fn test_killed_before_planning() {
        let mut qb = QueryBuilder::new();
        qb.table("t", source(int_def("t", &["a"], None), generated(3, 1, |i, _| i as i64)))
            .unwrap();
        let kill = KillFlag::new();
        kill.kill();
        let err = Optimizer::default()
            .optimize(qb.build().unwrap(), &kill)
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Killed));
    }

    #[tokio::test]
    async fn test_false_where_gives_zero_rows() {
        let mut qb = QueryBuilder::new();
        let t = qb
            .table("t", source(int_def("t", &["a"], None), generated(3, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::lit(1i64), Expr::lit(2i64)));
        qb.select_column(t, 0);
        let outcome = Optimizer::default()
            .optimize(qb.build().unwrap(), &KillFlag::new())
            .await
            .unwrap();
        assert!(matches!(outcome, PlanOutcome::ZeroRows { .. }));
    }

    #[tokio::test]
    async fn test_materialized_block_uses_inner_order() {
        let mut qb = QueryBuilder::new();
        let o = qb
            .table("o", source(int_def("o", &["a"], None), generated(200, 1, |i, _| i as i64)))
            .unwrap();
        let i = qb
            .table(
                "i",
                source(
                    with_index(int_def("i", &["b"], None), "ib", &["b"]),
                    generated(500, 1, |i, _| (i % 50) as i64),
                ),
            )
            .unwrap();
        qb.semi_join(&[i], vec![Expr::col(o, 0)], vec![Expr::col(i, 0)], None)
            .unwrap();
        qb.select_column(o, 0);
        let outcome = Optimizer::default()
            .optimize(qb.build().unwrap(), &KillFlag::new())
            .await
            .unwrap();
        let PlanOutcome::Execute(plan) = outcome else {
            panic!("expected an executable plan");
        };
        let mut order = plan.table_order();
        order.sort_unstable();
        assert_eq!(order, vec![o, i]);
    }

    #[tokio::test]
    async fn test_materialized_plan_keeps_search_order() {
        let mut qb = QueryBuilder::new();
        let a = qb
            .table("a", source(int_def("a", &["x"], None), generated(40, 1, |i, _| i as i64)))
            .unwrap();
        let b = qb
            .table(
                "b",
                source(
                    with_index(int_def("b", &["a_id", "c_id"], None), "a_idx", &["a_id"]),
                    generated(400, 2, |i, c| if c == 0 { (i % 40) as i64 } else { (i % 8) as i64 }),
                ),
            )
            .unwrap();
        let c = qb
            .table("c", source(int_def("c", &["y"], None), generated(8, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(b, 0), Expr::col(a, 0)))
            .filter(Expr::eq(Expr::col(b, 1), Expr::col(c, 0)));
        let query = Arc::new(qb.build().unwrap());

        let config = OptimizerConfig::default();
        let kill = KillFlag::new();
        let keyuses = KeyUseAnalyzer::new(&query).analyze();
        let StatsOutcome::Ready(stats) = StatisticsCollector::new(&query, &keyuses, &kill)
            .collect()
            .await
            .unwrap()
        else {
            panic!("expected statistics");
        };
        let model = CostModel::new(&query, &stats, &keyuses, &config);
        let best = JoinSearch::new(&model, &[], &kill).run().unwrap();
        let plan = PlanMaterializer::new(Arc::clone(&query), &stats, &keyuses, &config)
            .materialize(&best)
            .unwrap();
        assert_eq!(plan.table_order(), best.table_order());
        assert_eq!(plan.cost, best.cost);
    }
}
