//! Join execution integration tests

mod test_utils;

use std::sync::Arc;

use joinorder::config::OptimizerSwitches;
use joinorder::executor::{
    ExecState, ExecutionContext, ExecutorEngine, ExecutorError, ExecutorResult, KillFlag,
    ResultSink, Row, SinkStatus,
};
use joinorder::planner::{
    AccessMethod, ColumnRef, Expr, JoinPlan, Optimizer, PlanOutcome, PlannerError, QueryBlock,
    QueryBuilder, SelectItem,
};
use joinorder::storage::{MemoryTable, TableRegistry};
use joinorder::OptimizerConfig;

use test_utils::{
    buffer_configs, customers_orders, generated, init_tracing, int_def, int_rows, run_query,
    sorted, table, with_index,
};

fn ints(values: &[i64]) -> Vec<Option<i64>> {
    values.iter().map(|&v| Some(v)).collect()
}

/// Run `query()` under every buffer configuration and check that each
/// produces `expected` as a set
async fn assert_same_rows_everywhere(query: impl Fn() -> QueryBlock, expected: Vec<Vec<Option<i64>>>) {
    let expected = sorted(expected);
    for config in buffer_configs() {
        let level = config.join_cache_level;
        let size = config.join_buffer_size;
        let (rows, _) = run_query(config, query()).await.unwrap();
        assert_eq!(
            sorted(rows),
            expected,
            "join_cache_level {} join_buffer_size {}",
            level,
            size
        );
    }
}

#[tokio::test]
async fn test_inner_join_produces_each_pair_once() {
    init_tracing();
    let query = || {
        let mut qb = QueryBuilder::new();
        let a = qb
            .table("a", table(int_def("a", &["x"], None), generated(3, 1, |i, _| i as i64)))
            .unwrap();
        let b = qb
            .table("b", table(int_def("b", &["y"], None), generated(2, 1, |i, _| 10 + i as i64)))
            .unwrap();
        qb.filter(Expr::lit(true));
        qb.select_column(a, 0).select_column(b, 0);
        qb.build().unwrap()
    };
    let mut expected = Vec::new();
    for x in 0..3 {
        for y in 10..12 {
            expected.push(ints(&[x, y]));
        }
    }
    assert_same_rows_everywhere(query, expected).await;
}

fn left_join_query() -> QueryBlock {
    let a = table(int_def("a", &["id"], None), int_rows(&[&[Some(1)], &[Some(2)], &[Some(3)]]));
    let b = table(int_def("b", &["a_id"], None), int_rows(&[&[Some(1)], &[Some(7)]]));
    let mut qb = QueryBuilder::new();
    let ta = qb.table("a", a).unwrap();
    let tb = qb.table("b", b).unwrap();
    qb.left_join(&[tb], Expr::eq(Expr::col(tb, 0), Expr::col(ta, 0)))
        .unwrap();
    qb.select_column(ta, 0).select_column(tb, 0);
    qb.build().unwrap()
}

#[tokio::test]
async fn test_left_join_complements_unmatched_rows() {
    assert_same_rows_everywhere(
        left_join_query,
        vec![vec![Some(1), Some(1)], vec![Some(2), None], vec![Some(3), None]],
    )
    .await;
}

#[tokio::test]
async fn test_left_join_is_null_keeps_only_unmatched() {
    // b.id is NOT NULL, so b.id IS NULL holds only for complemented rows
    let query = || {
        let a = table(int_def("a", &["id"], None), generated(6, 1, |i, _| i as i64 + 1));
        let b = table(
            int_def("b", &["id", "a_id"], Some("id")),
            int_rows(&[&[Some(10), Some(2)], &[Some(11), Some(4)], &[Some(12), Some(4)]]),
        );
        let mut qb = QueryBuilder::new();
        let ta = qb.table("a", a).unwrap();
        let tb = qb.table("b", b).unwrap();
        qb.left_join(&[tb], Expr::eq(Expr::col(tb, 1), Expr::col(ta, 0)))
            .unwrap();
        qb.filter(Expr::is_null(Expr::col(tb, 0)));
        qb.select_column(ta, 0);
        qb.build().unwrap()
    };
    assert_same_rows_everywhere(query, vec![ints(&[1]), ints(&[3]), ints(&[5]), ints(&[6])]).await;
}

#[tokio::test]
async fn test_left_join_of_nested_inner_join() {
    // a LEFT JOIN (b JOIN c ON c.k = b.k) ON b.k = a.k
    let query = || {
        let mk = |name: &str, keys: &[i64]| {
            let rows: Vec<Row> = keys
                .iter()
                .map(|&k| Row::new(vec![k.into()]))
                .collect();
            table(int_def(name, &["k"], None), rows)
        };
        let mut qb = QueryBuilder::new();
        let a = qb.table("a", mk("a", &[1, 2, 3])).unwrap();
        let b = qb.table("b", mk("b", &[1, 2])).unwrap();
        let c = qb.table("c", mk("c", &[1, 1])).unwrap();
        qb.left_join(
            &[b, c],
            Expr::and(
                Expr::eq(Expr::col(b, 0), Expr::col(a, 0)),
                Expr::eq(Expr::col(c, 0), Expr::col(b, 0)),
            ),
        )
        .unwrap();
        qb.select_column(a, 0).select_column(b, 0).select_column(c, 0);
        qb.build().unwrap()
    };
    assert_same_rows_everywhere(
        query,
        vec![
            ints(&[1, 1, 1]),
            ints(&[1, 1, 1]),
            vec![Some(2), None, None],
            vec![Some(3), None, None],
        ],
    )
    .await;
}

/// `SELECT o.id FROM o WHERE o.a IN (SELECT i.b FROM i)` with duplicate
/// outer values and heavily duplicated inner values
fn semi_join_query() -> QueryBlock {
    let outer = table(
        int_def("o", &["id", "a"], Some("id")),
        generated(30, 2, |i, c| if c == 0 { i as i64 } else { (i % 10) as i64 }),
    );
    let inner = table(
        with_index(int_def("i", &["b"], None), "b_idx", &["b"]),
        generated(50, 1, |i, _| (i % 5) as i64),
    );
    let mut qb = QueryBuilder::new();
    let o = qb.table("o", outer).unwrap();
    let i = qb.table("i", inner).unwrap();
    qb.semi_join(&[i], vec![Expr::col(o, 1)], vec![Expr::col(i, 0)], None)
        .unwrap();
    qb.select_column(o, 0);
    qb.build().unwrap()
}

fn uses_weedout(plan: &JoinPlan) -> bool {
    !plan.weedouts.is_empty()
}

fn uses_first_match(plan: &JoinPlan) -> bool {
    plan.nodes.iter().any(|n| n.return_after_match.is_some())
}

fn uses_loose_scan(plan: &JoinPlan) -> bool {
    plan.nodes.iter().any(|n| n.loose_scan.is_some())
}

fn uses_materialization(plan: &JoinPlan) -> bool {
    !plan.materialized.is_empty()
}

/// Switch sets, each with the plan feature its strategy leaves behind
fn strategy_configs() -> Vec<(&'static str, OptimizerSwitches, Option<fn(&JoinPlan) -> bool>)> {
    let only = |firstmatch: bool, loosescan: bool, materialization: bool| OptimizerSwitches {
        firstmatch,
        loosescan,
        materialization,
        ..OptimizerSwitches::default()
    };
    let weedout_only = OptimizerSwitches {
        semijoin: false,
        ..OptimizerSwitches::default()
    };
    let check = |f: fn(&JoinPlan) -> bool| Some(f);
    vec![
        ("all strategies", OptimizerSwitches::default(), None),
        ("weed-out", weedout_only, check(uses_weedout)),
        ("first-match", only(true, false, false), check(uses_first_match)),
        ("loose scan", only(false, true, false), check(uses_loose_scan)),
        ("materialization", only(false, false, true), check(uses_materialization)),
    ]
}

async fn optimize(config: OptimizerConfig, query: QueryBlock) -> JoinPlan {
    match Optimizer::new(config)
        .optimize(query, &KillFlag::new())
        .await
        .unwrap()
    {
        PlanOutcome::Execute(plan) => plan,
        other => panic!("expected an executable plan, got {:?}", other),
    }
}

#[tokio::test]
async fn test_semi_join_returns_each_outer_row_once() {
    let expected: Vec<_> = (0..30).filter(|i| i % 10 < 5).map(|i| ints(&[i])).collect();
    for (name, switches, check) in strategy_configs() {
        if let Some(check) = check {
            let config = OptimizerConfig::default().with_switches(switches.clone());
            let plan = optimize(config, semi_join_query()).await;
            assert!(check(&plan), "{} not chosen: {:?}", name, plan.nodes);
        }
        for level in [0u8, 2, 8] {
            let config = OptimizerConfig::default()
                .with_switches(switches.clone())
                .with_join_cache_level(level);
            let (rows, _) = run_query(config, semi_join_query()).await.unwrap();
            assert_eq!(sorted(rows), expected, "{} at join_cache_level {}", name, level);
        }
    }
}

/// `SELECT a FROM t [WHERE filter] GROUP BY a` over `t(a = i % 5, b = i)`;
/// `t` is table 0
fn group_query(indexed: bool, filter: Option<Expr>) -> QueryBlock {
    let def = int_def("t", &["a", "b"], None);
    let def = if indexed { with_index(def, "a_idx", &["a"]) } else { def };
    let t = table(def, generated(100, 2, |i, c| if c == 0 { (i % 5) as i64 } else { i as i64 }));
    let mut qb = QueryBuilder::new();
    let id = qb.table("t", t).unwrap();
    if let Some(filter) = filter {
        qb.filter(filter);
    }
    qb.select_column(id, 0).group_by(ColumnRef::new(id, 0));
    qb.build().unwrap()
}

fn is_loose_index_scan(plan: &JoinPlan) -> bool {
    plan.nodes
        .iter()
        .any(|n| matches!(n.access, AccessMethod::LooseIndexScan { .. }))
}

#[tokio::test]
async fn test_group_by_gives_one_row_per_group_on_every_plan() {
    let expected: Vec<_> = (0..5).map(|a| ints(&[a])).collect();
    let plan = optimize(OptimizerConfig::default(), group_query(true, None)).await;
    assert!(is_loose_index_scan(&plan), "{:?}", plan.nodes);
    for indexed in [true, false] {
        let (rows, _) = run_query(OptimizerConfig::default(), group_query(indexed, None))
            .await
            .unwrap();
        assert_eq!(sorted(rows), expected, "indexed: {}", indexed);
    }
}

#[tokio::test]
async fn test_group_by_with_filter_outside_group_columns() {
    // Only the row with b = 97 qualifies; it is not the first row of group 2
    let b_is_97 = || Some(Expr::eq(Expr::col(0, 1), Expr::lit(97i64)));
    let plan = optimize(OptimizerConfig::default(), group_query(true, b_is_97())).await;
    assert!(!is_loose_index_scan(&plan), "{:?}", plan.nodes);
    for indexed in [true, false] {
        let (rows, _) = run_query(OptimizerConfig::default(), group_query(indexed, b_is_97()))
            .await
            .unwrap();
        assert_eq!(rows, vec![ints(&[2])], "indexed: {}", indexed);
    }

    let b_above_90 = || Some(Expr::gt(Expr::col(0, 1), Expr::lit(90i64)));
    for indexed in [true, false] {
        let (rows, _) = run_query(OptimizerConfig::default(), group_query(indexed, b_above_90()))
            .await
            .unwrap();
        let expected: Vec<_> = (0..5).map(|a| ints(&[a])).collect();
        assert_eq!(sorted(rows), expected, "indexed: {}", indexed);
    }
}

#[tokio::test]
async fn test_group_by_with_filter_on_group_column() {
    let a_is_3 = || Some(Expr::eq(Expr::col(0, 0), Expr::lit(3i64)));
    for indexed in [true, false] {
        let (rows, _) = run_query(OptimizerConfig::default(), group_query(indexed, a_is_3()))
            .await
            .unwrap();
        assert_eq!(rows, vec![ints(&[3])], "indexed: {}", indexed);
    }
}

#[tokio::test]
async fn test_group_by_applies_limit_after_grouping() {
    for indexed in [true, false] {
        let mut query = group_query(indexed, None);
        query.limit = Some(3);
        let (rows, summary) = run_query(OptimizerConfig::default(), query).await.unwrap();
        assert_eq!(rows.len(), 3, "indexed: {}", indexed);
        let mut seen = sorted(rows);
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert_eq!(summary.state, ExecState::LimitReached);
    }
}

#[tokio::test]
async fn test_query_over_registered_tables() {
    let registry = TableRegistry::new();
    let (customers, orders) = customers_orders();
    registry.register(customers).unwrap();
    registry.register(orders).unwrap();

    let mut qb = QueryBuilder::new();
    let c = qb.table_named(&registry, "customers", "c").unwrap();
    let o = qb.table_named(&registry, "orders", "o").unwrap();
    qb.filter(Expr::eq(Expr::col(o, 1), Expr::col(c, 0)))
        .filter(Expr::eq(Expr::col(c, 0), Expr::lit(7i64)));
    qb.select_column(o, 0);
    let (rows, _) = run_query(OptimizerConfig::default(), qb.build().unwrap())
        .await
        .unwrap();
    let expected: Vec<_> = (0..10).map(|k| ints(&[7 + 100 * k])).collect();
    assert_eq!(sorted(rows), expected);

    let err = QueryBuilder::new()
        .table_named(&registry, "invoices", "i")
        .unwrap_err();
    assert!(matches!(err, PlannerError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_limit_stops_probing() {
    let (customers, orders) = customers_orders();
    let mut qb = QueryBuilder::new();
    let o = qb.table("o", orders).unwrap();
    let c = qb.table("c", customers).unwrap();
    qb.filter(Expr::eq(Expr::col(c, 0), Expr::col(o, 1)));
    qb.select_column(o, 0).select_column(c, 0).limit(5);
    let config = OptimizerConfig::default().with_join_cache_level(0);
    let (rows, summary) = run_query(config, qb.build().unwrap()).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(summary.state, ExecState::LimitReached);
    // Five result rows need at most two reads each
    assert!(summary.rows_examined <= 10, "examined {}", summary.rows_examined);
}

#[tokio::test]
async fn test_limit_with_buffers_emits_exactly_k_rows() {
    for config in buffer_configs() {
        let (customers, orders) = customers_orders();
        let mut qb = QueryBuilder::new();
        let o = qb.table("o", orders).unwrap();
        let c = qb.table("c", customers).unwrap();
        qb.filter(Expr::eq(Expr::col(c, 0), Expr::col(o, 1)));
        qb.select_column(o, 0).limit(7).offset(3);
        let (rows, summary) = run_query(config, qb.build().unwrap()).await.unwrap();
        assert_eq!(rows.len(), 7);
        assert_eq!(summary.state, ExecState::LimitReached);
    }
}

#[tokio::test]
async fn test_order_by_sorts_output() {
    let (customers, orders) = customers_orders();
    let mut qb = QueryBuilder::new();
    let c = qb.table("c", customers).unwrap();
    let o = qb.table("o", orders).unwrap();
    qb.filter(Expr::eq(Expr::col(o, 1), Expr::col(c, 0)))
        .filter(Expr::lt(Expr::col(c, 0), Expr::lit(3i64)));
    qb.select_column(o, 0).order_by(ColumnRef::new(o, 0), true);
    let (rows, _) = run_query(OptimizerConfig::default(), qb.build().unwrap())
        .await
        .unwrap();
    let mut expected: Vec<i64> = (0..1000).filter(|i| i % 100 < 3).collect();
    expected.reverse();
    let expected: Vec<_> = expected.into_iter().map(|i| ints(&[i])).collect();
    assert_eq!(rows, expected);
}

#[tokio::test]
async fn test_aggregate_over_join() {
    let query = || {
        let (customers, orders) = customers_orders();
        let mut qb = QueryBuilder::new();
        let c = qb.table("c", customers).unwrap();
        let o = qb.table("o", orders).unwrap();
        qb.filter(Expr::eq(Expr::col(o, 1), Expr::col(c, 0)))
            .filter(Expr::lt(Expr::col(c, 0), Expr::lit(10i64)));
        qb.select(SelectItem::CountStar)
            .select(SelectItem::Min(Expr::col(o, 0)))
            .select(SelectItem::Max(Expr::col(o, 0)));
        qb.build().unwrap()
    };
    assert_same_rows_everywhere(query, vec![ints(&[100, 0, 909])]).await;
}

#[tokio::test]
async fn test_having_filters_rows() {
    let mut qb = QueryBuilder::new();
    let t = qb
        .table("t", table(int_def("t", &["v"], None), generated(1000, 1, |i, _| i as i64)))
        .unwrap();
    qb.select_column(t, 0)
        .having(Expr::gt(Expr::col(t, 0), Expr::lit(995i64)));
    let (rows, _) = run_query(OptimizerConfig::default(), qb.build().unwrap())
        .await
        .unwrap();
    assert_eq!(sorted(rows), vec![ints(&[996]), ints(&[997]), ints(&[998]), ints(&[999])]);
}

#[tokio::test]
async fn test_unique_lookup_reuses_last_key() {
    let customers = table(
        int_def("customers", &["id"], Some("id")),
        generated(100, 1, |i, _| i as i64),
    );
    // Ten consecutive orders per customer
    let orders = table(
        int_def("orders", &["id", "cust_id"], Some("id")),
        generated(1000, 2, |i, c| if c == 0 { i as i64 } else { (i / 10) as i64 }),
    );
    let mut qb = QueryBuilder::new();
    let o = qb.table("o", Arc::<MemoryTable>::clone(&orders)).unwrap();
    let c = qb.table("c", Arc::<MemoryTable>::clone(&customers)).unwrap();
    qb.filter(Expr::eq(Expr::col(c, 0), Expr::col(o, 1)));
    qb.select_column(o, 0).straight_join();
    let config = OptimizerConfig::default().with_join_cache_level(0);
    let (rows, _) = run_query(config, qb.build().unwrap()).await.unwrap();
    assert_eq!(rows.len(), 1000);
    assert_eq!(customers.reads(), 100);
}

/// Kills the query once the first row arrives
struct KillOnFirstRow {
    kill: KillFlag,
    rows: usize,
}

impl ResultSink for KillOnFirstRow {
    fn emit(&mut self, _row: Row) -> ExecutorResult<SinkStatus> {
        self.rows += 1;
        self.kill.kill();
        Ok(SinkStatus::Continue)
    }
}

#[tokio::test]
async fn test_kill_during_join_reports_killed() {
    let (customers, orders) = customers_orders();
    let mut qb = QueryBuilder::new();
    let o = qb.table("o", orders).unwrap();
    let c = qb.table("c", customers).unwrap();
    qb.filter(Expr::eq(Expr::col(c, 0), Expr::col(o, 1)));
    qb.select_column(o, 0);

    let kill = KillFlag::new();
    let ctx = ExecutionContext::new(OptimizerConfig::default().with_join_cache_level(0))
        .with_kill_flag(kill.clone());
    let mut sink = KillOnFirstRow { kill, rows: 0 };
    let err = ExecutorEngine::new(ctx)
        .execute(qb.build().unwrap(), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Killed));
    assert_eq!(sink.rows, 1);
}

#[tokio::test]
async fn test_storage_failure_aborts_query() {
    for config in buffer_configs() {
        let failing = MemoryTable::new(
            int_def("t", &["v"], None),
            generated(100, 1, |i, _| i as i64),
        )
        .unwrap()
        .with_failure_after(40);
        let mut qb = QueryBuilder::new();
        let t = qb.table("t", Arc::new(failing)).unwrap();
        let u = qb
            .table("u", table(int_def("u", &["w"], None), generated(3, 1, |i, _| i as i64)))
            .unwrap();
        qb.filter(Expr::eq(Expr::col(t, 0), Expr::col(u, 0)));
        qb.select_column(t, 0);
        let err = run_query(config, qb.build().unwrap()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Storage(_)), "{}", err);
    }
}
