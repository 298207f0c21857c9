//! Query block - the optimizer's input
//!
//! A query block lists its tables in declaration order, the outer-join and
//! inner-join nests grouping them, the IN-subquery semi-join nests pulled up
//! into it, and the WHERE/ON predicates. [`QueryBuilder`] validates every
//! reference before the optimizer sees the block.

use std::fmt;
use std::sync::Arc;

use crate::catalog::KeyInfo;
use crate::planner::error::{PlannerError, PlannerResult};
use crate::planner::expr::{ColumnRef, Expr};
use crate::planner::table_set::{TableId, TableSet, MAX_TABLES};
use crate::storage::{StorageError, TableRegistry, TableSource};

/// Position of a nest in [`QueryBlock::nests`]
pub type NestId = usize;

/// Kind of join nest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestKind {
    /// Parenthesized inner join, flattened before optimization
    Inner,
    /// Inner side of a LEFT JOIN
    LeftOuter,
}

/// Group of tables joined together under one ON expression
#[derive(Debug, Clone)]
pub struct JoinNest {
    pub kind: NestKind,
    /// Every table inside the nest, including nested nests
    pub tables: TableSet,
    pub parent: Option<NestId>,
    pub on_expr: Option<Expr>,
}

/// Table reference in a query block
#[derive(Clone)]
pub struct QueryTable {
    pub id: TableId,
    pub alias: String,
    pub source: Arc<dyn TableSource>,
    /// Indexes resolved to column positions
    pub keys: Vec<KeyInfo>,
    pub column_count: usize,
    pub nullable: Vec<bool>,
    pub row_width: usize,
    /// Innermost join nest containing this table
    pub embedding: Option<NestId>,
    /// Semi-join nest this table is an inner table of
    pub semi_join: Option<usize>,
}

impl fmt::Debug for QueryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryTable")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("embedding", &self.embedding)
            .field("semi_join", &self.semi_join)
            .finish()
    }
}

/// IN-subquery converted to a semi-join:
/// `(outer_exprs) IN (SELECT inner_exprs FROM inner_tables WHERE where_cond)`
#[derive(Debug, Clone)]
pub struct SemiJoinNest {
    pub inner_tables: TableSet,
    pub outer_exprs: Vec<Expr>,
    pub inner_exprs: Vec<Expr>,
    pub where_cond: Option<Expr>,
}

impl SemiJoinNest {
    /// `outer_i = inner_i` for every IN column
    pub fn equalities(&self) -> Vec<Expr> {
        self.outer_exprs
            .iter()
            .zip(&self.inner_exprs)
            .map(|(o, i)| Expr::eq(o.clone(), i.clone()))
            .collect()
    }

    /// Tables outside the nest referenced by the subquery WHERE or the
    /// inner expressions; non-empty means the subquery is correlated
    pub fn correlation(&self) -> TableSet {
        let mut used = TableSet::EMPTY;
        if let Some(w) = &self.where_cond {
            used |= w.used_tables();
        }
        for e in &self.inner_exprs {
            used |= e.used_tables();
        }
        used - self.inner_tables
    }

    /// Outside tables referenced by the IN left-hand side
    pub fn outer_expr_tables(&self) -> TableSet {
        self.outer_exprs
            .iter()
            .fold(TableSet::EMPTY, |acc, e| acc | e.used_tables())
    }
}

/// Where a WHERE-level conjunct came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConjunctOrigin {
    Where,
    /// Equality between IN expressions number `pos` of a semi-join
    SemiJoinEquality { nest: usize, pos: usize },
    /// Part of a semi-join's subquery WHERE
    SemiJoinWhere { nest: usize },
}

/// Top-level conjunct of the effective WHERE clause
#[derive(Debug, Clone)]
pub struct Conjunct {
    pub expr: Expr,
    pub origin: ConjunctOrigin,
}

/// Select list item
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Expr(Expr),
    Min(Expr),
    Max(Expr),
    CountStar,
}

impl SelectItem {
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, SelectItem::Expr(_))
    }

    fn used_tables(&self) -> TableSet {
        match self {
            SelectItem::Expr(e) | SelectItem::Min(e) | SelectItem::Max(e) => e.used_tables(),
            SelectItem::CountStar => TableSet::EMPTY,
        }
    }
}

/// ORDER BY item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderItem {
    pub column: ColumnRef,
    pub descending: bool,
}

/// One SELECT block ready for join optimization
#[derive(Debug, Clone)]
pub struct QueryBlock {
    pub tables: Vec<QueryTable>,
    pub nests: Vec<JoinNest>,
    pub semi_joins: Vec<SemiJoinNest>,
    pub where_cond: Option<Expr>,
    pub select_list: Vec<SelectItem>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderItem>,
    pub having: Option<Expr>,
    pub limit: Option<u64>,
    pub offset: u64,
    /// Join tables in declaration order
    pub straight_join: bool,
}

impl QueryBlock {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn all_tables(&self) -> TableSet {
        TableSet::first_n(self.tables.len())
    }

    pub fn table(&self, id: TableId) -> &QueryTable {
        &self.tables[id]
    }

    /// Select list contains MIN/MAX/COUNT(*) (implicit grouping)
    pub fn is_aggregate(&self) -> bool {
        self.select_list.iter().any(SelectItem::is_aggregate)
    }

    /// GROUP BY whose select list reads only grouping columns, so the
    /// result holds one row per distinct group
    pub fn selects_only_groups(&self) -> bool {
        !self.group_by.is_empty()
            && !self.select_list.is_empty()
            && self.select_list.iter().all(|item| match item {
                SelectItem::Expr(e) => e.as_column().is_some_and(|c| self.group_by.contains(&c)),
                _ => false,
            })
    }

    /// Nests containing `table`, innermost first
    pub fn nest_chain(&self, table: TableId) -> Vec<NestId> {
        let mut chain = Vec::new();
        let mut cur = self.tables[table].embedding;
        while let Some(n) = cur {
            chain.push(n);
            cur = self.nests[n].parent;
        }
        chain
    }

    /// Innermost outer-join nest containing `table`
    pub fn outer_join_nest(&self, table: TableId) -> Option<NestId> {
        self.nest_chain(table)
            .into_iter()
            .find(|&n| self.nests[n].kind == NestKind::LeftOuter)
    }

    /// Tables that are inner tables of some outer join
    pub fn outer_join_inner_tables(&self) -> TableSet {
        self.nests
            .iter()
            .filter(|n| n.kind == NestKind::LeftOuter)
            .fold(TableSet::EMPTY, |acc, n| acc | n.tables)
    }

    /// Tables that are inner tables of some semi-join
    pub fn semi_join_inner_tables(&self) -> TableSet {
        self.semi_joins
            .iter()
            .fold(TableSet::EMPTY, |acc, sj| acc | sj.inner_tables)
    }

    /// WHERE conjuncts plus every semi-join's pulled-up conditions
    pub fn conjuncts(&self) -> Vec<Conjunct> {
        let mut out: Vec<Conjunct> = self
            .where_cond
            .iter()
            .flat_map(|w| w.clone().into_conjuncts())
            .map(|expr| Conjunct {
                expr,
                origin: ConjunctOrigin::Where,
            })
            .collect();
        for (nest, sj) in self.semi_joins.iter().enumerate() {
            for (pos, expr) in sj.equalities().into_iter().enumerate() {
                out.push(Conjunct {
                    expr,
                    origin: ConjunctOrigin::SemiJoinEquality { nest, pos },
                });
            }
            for expr in sj.where_cond.iter().flat_map(|w| w.clone().into_conjuncts()) {
                out.push(Conjunct {
                    expr,
                    origin: ConjunctOrigin::SemiJoinWhere { nest },
                });
            }
        }
        out
    }
}

/// Incrementally assembles and validates a [`QueryBlock`]
#[derive(Default)]
pub struct QueryBuilder {
    tables: Vec<QueryTable>,
    nests: Vec<JoinNest>,
    semi_joins: Vec<SemiJoinNest>,
    where_parts: Vec<Expr>,
    select_list: Vec<SelectItem>,
    group_by: Vec<ColumnRef>,
    order_by: Vec<OrderItem>,
    having: Option<Expr>,
    limit: Option<u64>,
    offset: u64,
    straight_join: bool,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table to the FROM list
    pub fn table(
        &mut self,
        alias: impl Into<String>,
        source: Arc<dyn TableSource>,
    ) -> PlannerResult<TableId> {
        let id = self.tables.len();
        if id >= MAX_TABLES {
            return Err(PlannerError::UnsupportedOperation(format!(
                "too many tables; at most {} tables can be joined",
                MAX_TABLES
            )));
        }
        let def = source.definition();
        let keys = def.key_infos()?;
        let nullable = def.columns.iter().map(|c| c.nullable).collect();
        let column_count = def.columns.len();
        let row_width = def.row_width();
        self.tables.push(QueryTable {
            id,
            alias: alias.into(),
            source,
            keys,
            column_count,
            nullable,
            row_width,
            embedding: None,
            semi_join: None,
        });
        Ok(id)
    }

    /// Add the table registered as `name` to the FROM list
    pub fn table_named(
        &mut self,
        registry: &TableRegistry,
        name: &str,
        alias: impl Into<String>,
    ) -> PlannerResult<TableId> {
        let source = registry.get(name).map_err(|e| match e {
            StorageError::Schema(msg) => PlannerError::InvalidQuery(msg),
            other => PlannerError::Storage(other),
        })?;
        self.table(alias, source)
    }

    /// Make `inner` the inner side of a LEFT JOIN with condition `on`.
    ///
    /// Tables already grouped in nests may be wrapped only by listing every
    /// table of their outermost nest.
    pub fn left_join(&mut self, inner: &[TableId], on: Expr) -> PlannerResult<NestId> {
        self.add_nest(NestKind::LeftOuter, inner, Some(on))
    }

    /// Group `tables` into a parenthesized inner join
    pub fn inner_nest(&mut self, tables: &[TableId], on: Option<Expr>) -> PlannerResult<NestId> {
        self.add_nest(NestKind::Inner, tables, on)
    }

    fn add_nest(
        &mut self,
        kind: NestKind,
        tables: &[TableId],
        on: Option<Expr>,
    ) -> PlannerResult<NestId> {
        let set = self.table_set(tables)?;
        if set.is_empty() {
            return Err(PlannerError::InvalidQuery("join nest has no tables".to_string()));
        }
        if let Some(t) = set.iter().find(|&t| self.tables[t].semi_join.is_some()) {
            return Err(PlannerError::InvalidQuery(format!(
                "table '{}' is a semi-join inner table",
                self.tables[t].alias
            )));
        }
        if kind == NestKind::LeftOuter {
            if set.first() == Some(0) {
                return Err(PlannerError::InvalidQuery(
                    "LEFT JOIN needs an outer table declared before its inner tables".to_string(),
                ));
            }
        }

        let id = self.nests.len();
        let mut children = Vec::new();
        for t in set.iter() {
            match self.outermost_nest(t) {
                None => {}
                Some(top) => {
                    if !self.nests[top].tables.is_subset_of(set) {
                        return Err(PlannerError::Configuration(format!(
                            "join nest would split the nest containing '{}'",
                            self.tables[t].alias
                        )));
                    }
                    if !children.contains(&top) {
                        children.push(top);
                    }
                }
            }
        }
        for t in set.iter() {
            if self.tables[t].embedding.is_none() {
                self.tables[t].embedding = Some(id);
            }
        }
        for child in children {
            self.nests[child].parent = Some(id);
        }
        self.nests.push(JoinNest {
            kind,
            tables: set,
            parent: None,
            on_expr: on,
        });
        Ok(id)
    }

    fn outermost_nest(&self, table: TableId) -> Option<NestId> {
        let mut cur = self.tables[table].embedding?;
        while let Some(p) = self.nests[cur].parent {
            cur = p;
        }
        Some(cur)
    }

    /// Add `(outer_exprs) IN (SELECT inner_exprs FROM inner WHERE where_cond)`
    pub fn semi_join(
        &mut self,
        inner: &[TableId],
        outer_exprs: Vec<Expr>,
        inner_exprs: Vec<Expr>,
        where_cond: Option<Expr>,
    ) -> PlannerResult<usize> {
        let set = self.table_set(inner)?;
        if set.is_empty() {
            return Err(PlannerError::InvalidQuery("semi-join has no tables".to_string()));
        }
        if outer_exprs.len() != inner_exprs.len() {
            return Err(PlannerError::InvalidQuery(format!(
                "IN compares {} outer expressions with {} inner expressions",
                outer_exprs.len(),
                inner_exprs.len()
            )));
        }
        for t in set.iter() {
            let table = &self.tables[t];
            if table.embedding.is_some() || table.semi_join.is_some() {
                return Err(PlannerError::UnsupportedOperation(format!(
                    "semi-join inner table '{}' must not be part of another nest",
                    table.alias
                )));
            }
        }
        if outer_exprs.iter().any(|e| e.used_tables().intersects(set)) {
            return Err(PlannerError::InvalidQuery(
                "IN left-hand side references subquery tables".to_string(),
            ));
        }
        if inner_exprs.iter().any(|e| !e.used_tables().is_subset_of(set)) {
            return Err(PlannerError::InvalidQuery(
                "IN select list references outer tables".to_string(),
            ));
        }
        let id = self.semi_joins.len();
        for t in set.iter() {
            self.tables[t].semi_join = Some(id);
        }
        self.semi_joins.push(SemiJoinNest {
            inner_tables: set,
            outer_exprs,
            inner_exprs,
            where_cond,
        });
        Ok(id)
    }

    fn table_set(&self, tables: &[TableId]) -> PlannerResult<TableSet> {
        tables
            .iter()
            .map(|&t| {
                if t < self.tables.len() {
                    Ok(t)
                } else {
                    Err(PlannerError::InvalidQuery(format!("unknown table #{}", t)))
                }
            })
            .collect()
    }

    /// AND a predicate into the WHERE clause
    pub fn filter(&mut self, pred: Expr) -> &mut Self {
        self.where_parts.push(pred);
        self
    }

    pub fn select(&mut self, item: SelectItem) -> &mut Self {
        self.select_list.push(item);
        self
    }

    /// Select a plain column
    pub fn select_column(&mut self, table: TableId, column: usize) -> &mut Self {
        self.select(SelectItem::Expr(Expr::col(table, column)))
    }

    pub fn group_by(&mut self, column: ColumnRef) -> &mut Self {
        self.group_by.push(column);
        self
    }

    pub fn order_by(&mut self, column: ColumnRef, descending: bool) -> &mut Self {
        self.order_by.push(OrderItem { column, descending });
        self
    }

    pub fn having(&mut self, pred: Expr) -> &mut Self {
        self.having = Some(pred);
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Force declaration order
    pub fn straight_join(&mut self) -> &mut Self {
        self.straight_join = true;
        self
    }

    /// Validate every reference and produce the query block
    pub fn build(self) -> PlannerResult<QueryBlock> {
        if self.tables.is_empty() {
            return Err(PlannerError::InvalidQuery("query has no tables".to_string()));
        }
        let block = QueryBlock {
            tables: self.tables,
            nests: self.nests,
            semi_joins: self.semi_joins,
            where_cond: Expr::conjoin(self.where_parts),
            select_list: self.select_list,
            group_by: self.group_by,
            order_by: self.order_by,
            having: self.having,
            limit: self.limit,
            offset: self.offset,
            straight_join: self.straight_join,
        };
        validate(&block)?;
        Ok(block)
    }
}

fn validate(block: &QueryBlock) -> PlannerResult<()> {
    let check = |e: &Expr| -> PlannerResult<()> {
        let mut bad = None;
        e.for_each_column(&mut |c| {
            let ok = block
                .tables
                .get(c.table)
                .is_some_and(|t| c.column < t.column_count);
            if !ok && bad.is_none() {
                bad = Some(c);
            }
        });
        match bad {
            Some(c) => Err(PlannerError::InvalidQuery(format!(
                "column {} of table #{} does not exist",
                c.column, c.table
            ))),
            None => Ok(()),
        }
    };

    if let Some(w) = &block.where_cond {
        check(w)?;
    }
    for nest in &block.nests {
        if let Some(on) = &nest.on_expr {
            check(on)?;
        }
    }
    for sj in &block.semi_joins {
        sj.outer_exprs.iter().try_for_each(check)?;
        sj.inner_exprs.iter().try_for_each(check)?;
        if let Some(w) = &sj.where_cond {
            check(w)?;
        }
    }

    for nest in block.nests.iter().filter(|n| n.kind == NestKind::LeftOuter) {
        if let Some(parent) = nest.parent {
            if nest.tables.first() <= block.nests[parent].tables.first() {
                return Err(PlannerError::InvalidQuery(
                    "nested LEFT JOIN needs an outer table of its parent nest declared before it"
                        .to_string(),
                ));
            }
        }
    }

    let hidden = block.semi_join_inner_tables();
    let mut visible_refs = block
        .where_cond
        .iter()
        .chain(block.nests.iter().filter_map(|n| n.on_expr.as_ref()))
        .fold(TableSet::EMPTY, |acc, e| acc | e.used_tables());
    for item in &block.select_list {
        match item {
            SelectItem::Expr(e) | SelectItem::Min(e) | SelectItem::Max(e) => check(e)?,
            SelectItem::CountStar => {}
        }
        visible_refs |= item.used_tables();
    }
    for c in block
        .group_by
        .iter()
        .chain(block.order_by.iter().map(|o| &o.column))
    {
        check(&Expr::Column(*c))?;
        visible_refs.insert(c.table);
    }
    if let Some(h) = &block.having {
        check(h)?;
        visible_refs |= h.used_tables();
        if block.is_aggregate() {
            return Err(PlannerError::UnsupportedOperation(
                "HAVING together with aggregate select items".to_string(),
            ));
        }
    }
    if visible_refs.intersects(hidden) {
        return Err(PlannerError::InvalidQuery(
            "semi-join inner table referenced outside its subquery".to_string(),
        ));
    }
    if block.is_aggregate() && block.select_list.iter().any(|i| !i.is_aggregate()) {
        return Err(PlannerError::UnsupportedOperation(
            "mixing aggregate and plain select items without GROUP BY".to_string(),
        ));
    }
    Ok(())
}
