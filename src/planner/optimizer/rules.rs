//! Optimization rules
//!
//! Rewrites applied to a query block before cost-based join ordering.

use tracing::debug;

use crate::executor::eval::{eval, NoRows};
use crate::planner::expr::{BinaryOp, Expr};
use crate::planner::query::{NestId, NestKind, QueryBlock};

/// Optimization rule trait
pub trait OptimizationRule: Send + Sync {
    /// Rule name for debugging
    fn name(&self) -> &'static str;

    /// Apply the rule to a query block
    fn apply(&self, query: QueryBlock) -> QueryBlock;
}

/// Evaluate sub-expressions that reference no table
pub struct ConstantFolding;

impl OptimizationRule for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn apply(&self, mut query: QueryBlock) -> QueryBlock {
        query.where_cond = query.where_cond.take().and_then(fold_predicate);
        for nest in &mut query.nests {
            nest.on_expr = nest.on_expr.take().and_then(fold_predicate);
        }
        for sj in &mut query.semi_joins {
            sj.where_cond = sj.where_cond.take().and_then(fold_predicate);
        }
        query.having = query.having.take().and_then(fold_predicate);
        if query.where_cond.as_ref().is_some_and(Expr::is_false_literal) {
            debug!("WHERE folded to a constant that is never true");
        }
        query
    }
}

/// Fold a predicate, dropping it when it became literal TRUE
fn fold_predicate(expr: Expr) -> Option<Expr> {
    let folded = fold(expr);
    (!folded.is_true_literal()).then_some(folded)
}

fn fold(expr: Expr) -> Expr {
    let expr = match expr {
        Expr::BinaryOp { left, op, right } => {
            let left = fold(*left);
            let right = fold(*right);
            match op {
                BinaryOp::And if left.is_true_literal() => return right,
                BinaryOp::And if right.is_true_literal() => return left,
                BinaryOp::And if is_false(&left) || is_false(&right) => {
                    return Expr::lit(false);
                }
                BinaryOp::Or if left.is_true_literal() || right.is_true_literal() => {
                    return Expr::lit(true);
                }
                BinaryOp::Or if is_false(&left) => return right,
                BinaryOp::Or if is_false(&right) => return left,
                _ => Expr::binary(left, op, right),
            }
        }
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op,
            expr: Box::new(fold(*expr)),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(fold(*expr)),
            negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(fold(*expr)),
            list: list.into_iter().map(fold).collect(),
            negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: Box::new(fold(*expr)),
            low: Box::new(fold(*low)),
            high: Box::new(fold(*high)),
            negated,
        },
        other => other,
    };

    if matches!(expr, Expr::Literal(_) | Expr::Guarded { .. }) || !expr.used_tables().is_empty()
    {
        return expr;
    }
    // Evaluation errors are left for execution to report
    match eval(&expr, &NoRows) {
        Ok(value) => Expr::Literal(value),
        Err(_) => expr,
    }
}

fn is_false(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal(d) if d.as_bool() == Some(false))
}

/// Dissolve parenthesized inner-join nests, moving their ON conditions to
/// the enclosing outer join (or WHERE)
pub struct FlattenInnerNests;

impl OptimizationRule for FlattenInnerNests {
    fn name(&self) -> &'static str {
        "flatten_inner_nests"
    }

    fn apply(&self, query: QueryBlock) -> QueryBlock {
        flatten_inner_nests(query)
    }
}

/// Turn LEFT JOINs into inner joins when the condition governing the nest
/// rejects the NULL-complemented rows
pub struct OuterJoinSimplification;

impl OptimizationRule for OuterJoinSimplification {
    fn name(&self) -> &'static str {
        "outer_join_simplification"
    }

    fn apply(&self, mut query: QueryBlock) -> QueryBlock {
        let mut converted = 0;
        for n in nests_top_down(&query) {
            if query.nests[n].kind != NestKind::LeftOuter {
                continue;
            }
            let tables = query.nests[n].tables;
            let owner = owning_outer_nest(&query, query.nests[n].parent);
            let rejects = match owner {
                Some(o) => query.nests[o]
                    .on_expr
                    .as_ref()
                    .is_some_and(|on| on.rejects_nulls_of(tables)),
                None => {
                    query
                        .where_cond
                        .as_ref()
                        .is_some_and(|w| w.rejects_nulls_of(tables))
                        || query
                            .semi_joins
                            .iter()
                            .flat_map(|sj| sj.equalities())
                            .any(|e| e.rejects_nulls_of(tables))
                }
            };
            if rejects {
                query.nests[n].kind = NestKind::Inner;
                if let Some(on) = query.nests[n].on_expr.take() {
                    conjoin_into_owner(&mut query, owner, on);
                }
                converted += 1;
            }
        }
        if converted > 0 {
            debug!(converted, "outer joins converted to inner joins");
        }
        flatten_inner_nests(query)
    }
}

fn flatten_inner_nests(mut query: QueryBlock) -> QueryBlock {
    for n in nests_top_down(&query) {
        if query.nests[n].kind != NestKind::Inner {
            continue;
        }
        if let Some(on) = query.nests[n].on_expr.take() {
            let owner = owning_outer_nest(&query, query.nests[n].parent);
            conjoin_into_owner(&mut query, owner, on);
        }
    }

    let mut remap: Vec<Option<NestId>> = vec![None; query.nests.len()];
    let mut kept = Vec::new();
    for (i, nest) in query.nests.iter().enumerate() {
        if nest.kind == NestKind::LeftOuter {
            remap[i] = Some(kept.len());
            kept.push(i);
        }
    }
    if kept.len() == query.nests.len() {
        return query;
    }

    let resolve = |query: &QueryBlock, start: Option<NestId>| owning_outer_nest(query, start)
        .and_then(|n| remap[n]);
    let embeddings: Vec<Option<NestId>> = query
        .tables
        .iter()
        .map(|t| resolve(&query, t.embedding))
        .collect();
    let nests = kept
        .iter()
        .map(|&i| {
            let mut nest = query.nests[i].clone();
            nest.parent = resolve(&query, query.nests[i].parent);
            nest
        })
        .collect();
    for (table, embedding) in query.tables.iter_mut().zip(embeddings) {
        table.embedding = embedding;
    }
    query.nests = nests;
    query
}

/// Nearest outer-join nest at or above `start`
fn owning_outer_nest(query: &QueryBlock, start: Option<NestId>) -> Option<NestId> {
    let mut cur = start;
    while let Some(n) = cur {
        if query.nests[n].kind == NestKind::LeftOuter {
            return Some(n);
        }
        cur = query.nests[n].parent;
    }
    None
}

fn conjoin_into_owner(query: &mut QueryBlock, owner: Option<NestId>, expr: Expr) {
    let slot = match owner {
        Some(o) => &mut query.nests[o].on_expr,
        None => &mut query.where_cond,
    };
    *slot = Some(match slot.take() {
        Some(existing) => Expr::and(existing, expr),
        None => expr,
    });
}

/// Nest ids ordered so that every nest follows its parent
fn nests_top_down(query: &QueryBlock) -> Vec<NestId> {
    let depth = |mut n: NestId| {
        let mut d = 0;
        while let Some(p) = query.nests[n].parent {
            d += 1;
            n = p;
        }
        d
    };
    let mut order: Vec<NestId> = (0..query.nests.len()).collect();
    order.sort_by_key(|&n| (depth(n), n));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::query::QueryBuilder;
    use crate::planner::test_utils::{int_def, source};

    fn three_tables() -> (QueryBuilder, [usize; 3]) {
        let mut qb = QueryBuilder::new();
        let t1 = qb.table("t1", source(int_def("t1", &["a", "b"], None), vec![])).unwrap();
        let t2 = qb.table("t2", source(int_def("t2", &["a", "b"], None), vec![])).unwrap();
        let t3 = qb.table("t3", source(int_def("t3", &["a", "b"], None), vec![])).unwrap();
        (qb, [t1, t2, t3])
    }

    #[test]
    fn test_constant_folding() {
        let (mut qb, [t1, ..]) = three_tables();
        qb.filter(Expr::and(
            Expr::eq(Expr::col(t1, 0), Expr::binary(Expr::lit(2i64), BinaryOp::Add, Expr::lit(3i64))),
            Expr::lt(Expr::lit(1i64), Expr::lit(2i64)),
        ));
        let query = ConstantFolding.apply(qb.build().unwrap());
        assert_eq!(
            query.where_cond,
            Some(Expr::eq(Expr::col(t1, 0), Expr::lit(5i64)))
        );

        let (mut qb, [t1, ..]) = three_tables();
        qb.filter(Expr::and(
            Expr::eq(Expr::col(t1, 0), Expr::lit(1i64)),
            Expr::eq(Expr::lit(1i64), Expr::lit(2i64)),
        ));
        let query = ConstantFolding.apply(qb.build().unwrap());
        assert_eq!(query.where_cond, Some(Expr::lit(false)));
    }

    #[test]
    fn test_folding_keeps_errors_for_execution() {
        let (mut qb, [t1, ..]) = three_tables();
        let div = Expr::binary(Expr::lit(1i64), BinaryOp::Div, Expr::lit(0i64));
        qb.filter(Expr::eq(Expr::col(t1, 0), div.clone()));
        let query = ConstantFolding.apply(qb.build().unwrap());
        assert_eq!(query.where_cond, Some(Expr::eq(Expr::col(t1, 0), div)));
    }

    #[test]
    fn test_null_rejecting_where_converts_left_join() {
        let (mut qb, [t1, t2, t3]) = three_tables();
        qb.left_join(&[t2], Expr::eq(Expr::col(t2, 0), Expr::col(t1, 0)))
            .unwrap();
        qb.left_join(&[t3], Expr::eq(Expr::col(t3, 0), Expr::col(t1, 0)))
            .unwrap();
        qb.filter(Expr::gt(Expr::col(t2, 1), Expr::lit(0i64)));
        let query = OuterJoinSimplification.apply(qb.build().unwrap());

        assert_eq!(query.nests.len(), 1);
        assert_eq!(query.tables[t2].embedding, None);
        assert_eq!(query.tables[t3].embedding, Some(0));
        let conjuncts = query.where_cond.unwrap().into_conjuncts();
        assert_eq!(conjuncts.len(), 2);
    }

    #[test]
    fn test_is_null_keeps_left_join() {
        let (mut qb, [t1, t2, _]) = three_tables();
        qb.left_join(&[t2], Expr::eq(Expr::col(t2, 0), Expr::col(t1, 0)))
            .unwrap();
        qb.filter(Expr::is_null(Expr::col(t2, 1)));
        let query = OuterJoinSimplification.apply(qb.build().unwrap());
        assert_eq!(query.nests.len(), 1);
        assert_eq!(query.nests[0].kind, NestKind::LeftOuter);
    }

    #[test]
    fn test_conversion_cascades_into_nested_joins() {
        let (mut qb, [t1, t2, t3]) = three_tables();
        qb.left_join(&[t3], Expr::eq(Expr::col(t3, 0), Expr::col(t2, 0)))
            .unwrap();
        qb.left_join(&[t2, t3], Expr::eq(Expr::col(t2, 0), Expr::col(t1, 0)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t3, 1), Expr::lit(1i64)));
        let query = OuterJoinSimplification.apply(qb.build().unwrap());
        assert!(query.nests.is_empty());
        assert_eq!(query.where_cond.unwrap().into_conjuncts().len(), 3);
    }

    #[test]
    fn test_flatten_moves_on_to_enclosing_outer_join() {
        let (mut qb, [t1, t2, t3]) = three_tables();
        qb.inner_nest(&[t2, t3], Some(Expr::eq(Expr::col(t3, 0), Expr::col(t2, 0))))
            .unwrap();
        qb.left_join(&[t2, t3], Expr::eq(Expr::col(t2, 0), Expr::col(t1, 0)))
            .unwrap();
        let query = FlattenInnerNests.apply(qb.build().unwrap());
        assert_eq!(query.nests.len(), 1);
        assert_eq!(query.nests[0].parent, None);
        assert_eq!(query.tables[t3].embedding, Some(0));
        assert_eq!(
            query.nests[0].on_expr.clone().unwrap().into_conjuncts().len(),
            2
        );
        assert!(query.where_cond.is_none());
    }
}
