//! Key-usage analysis
//!
//! Walks the WHERE clause and every outer-join ON expression looking for
//! `column = expr` predicates that an index lookup can bind, plus
//! comparison predicates the range estimator can use. Equalities inside an
//! OR survive only when every branch carries an equivalent one; a
//! monotonically increasing level tag marks which candidates are still
//! valid while branches are merged.

use std::collections::BTreeMap;

use tracing::debug;

use crate::executor::Datum;
use crate::planner::expr::{BinaryOp, ColumnRef, Expr};
use crate::planner::query::{QueryBlock, SemiJoinNest};
use crate::planner::table_set::{TableId, TableSet};

/// Key part number used by full-text candidates
pub const FT_KEYPART: usize = usize::MAX;

/// Index number used by hash-join candidates; the key part is the column
pub const HASH_INDEX: usize = usize::MAX;

/// How a lookup treats NULL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyOptimize {
    /// Plain equality lookup
    Plain,
    /// `col = val OR col IS NULL`: probe for `val`, then for NULL
    RefOrNull,
}

/// Candidate for binding one key part of one index
#[derive(Debug, Clone, PartialEq)]
pub struct KeyUse {
    pub table: TableId,
    pub index: usize,
    pub keypart: usize,
    pub val: Expr,
    /// Tables `val` reads; they must precede `table`
    pub used_tables: TableSet,
    /// A NULL `val` can never match, so the lookup is skipped
    pub null_rejecting: bool,
    pub optimize: KeyOptimize,
}

impl KeyUse {
    pub fn is_fulltext(&self) -> bool {
        self.keypart == FT_KEYPART
    }

    pub fn is_hash(&self) -> bool {
        self.index == HASH_INDEX
    }
}

/// Comparison usable for range estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SargOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Between,
    InList,
    IsNull,
    IsNotNull,
}

/// `column OP values`, recorded from top-level conjuncts only
#[derive(Debug, Clone, PartialEq)]
pub struct SargableHint {
    pub column: ColumnRef,
    pub op: SargOp,
    pub values: Vec<Expr>,
    pub used_tables: TableSet,
}

/// Sorted key-usage candidates for a query block
#[derive(Debug, Clone, Default)]
pub struct KeyUseSet {
    keyuses: Vec<KeyUse>,
    touched: Vec<u64>,
    sargable: Vec<SargableHint>,
    /// Outer-join inner tables with `notnull_col IS NULL` in WHERE
    pub not_exists_tables: TableSet,
}

impl KeyUseSet {
    /// Every candidate, sorted by (table, index, key part)
    pub fn all(&self) -> &[KeyUse] {
        &self.keyuses
    }

    /// Candidates of one table
    pub fn for_table(&self, table: TableId) -> &[KeyUse] {
        let start = self.keyuses.partition_point(|k| k.table < table);
        let end = self.keyuses.partition_point(|k| k.table <= table);
        &self.keyuses[start..end]
    }

    /// Candidates of one table grouped by index, in index order
    pub fn index_groups(&self, table: TableId) -> Vec<(usize, &[KeyUse])> {
        let mut groups = Vec::new();
        let uses = self.for_table(table);
        let mut start = 0;
        while start < uses.len() {
            let index = uses[start].index;
            let len = uses[start..].iter().take_while(|k| k.index == index).count();
            groups.push((index, &uses[start..start + len]));
            start += len;
        }
        groups
    }

    /// Bitmap of indexes of `table` with at least one candidate
    pub fn touched_indexes(&self, table: TableId) -> u64 {
        self.touched.get(table).copied().unwrap_or(0)
    }

    /// Tables referenced by any candidate of `table`
    pub fn key_dependent(&self, table: TableId) -> TableSet {
        self.for_table(table)
            .iter()
            .fold(TableSet::EMPTY, |acc, k| acc | k.used_tables)
    }

    /// Range hints on columns of `table`
    pub fn sargable_for(&self, table: TableId) -> impl Iterator<Item = &SargableHint> {
        self.sargable.iter().filter(move |h| h.column.table == table)
    }

    pub fn len(&self) -> usize {
        self.keyuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyuses.is_empty()
    }
}

/// Candidate before it is expanded over the indexes of its table
#[derive(Debug, Clone)]
struct KeyField {
    column: ColumnRef,
    val: Expr,
    level: u32,
    null_rejecting: bool,
    optimize: KeyOptimize,
    fulltext: bool,
}

impl KeyField {
    /// Created from `column IS NULL`
    fn is_null_probe(&self) -> bool {
        !self.fulltext && matches!(self.val, Expr::Literal(Datum::Null))
    }
}

/// Builds a [`KeyUseSet`] from a query block
pub struct KeyUseAnalyzer<'a> {
    query: &'a QueryBlock,
    fields: Vec<KeyField>,
    and_level: u32,
    sargable: Vec<SargableHint>,
    not_exists: TableSet,
}

impl<'a> KeyUseAnalyzer<'a> {
    pub fn new(query: &'a QueryBlock) -> Self {
        Self {
            query,
            fields: Vec::new(),
            and_level: 0,
            sargable: Vec::new(),
            not_exists: TableSet::EMPTY,
        }
    }

    /// Analyze the WHERE clause (with pulled-up semi-join conditions) and
    /// every outer-join ON expression
    pub fn analyze(mut self) -> KeyUseSet {
        let query = self.query;
        let where_parts: Vec<Expr> = query.conjuncts().into_iter().map(|c| c.expr).collect();
        self.add_scope(&where_parts, query.all_tables(), true);

        for nest in &query.nests {
            if let Some(on) = &nest.on_expr {
                let parts = on.clone().into_conjuncts();
                self.add_scope(&parts, nest.tables, false);
            }
        }

        let keyuses = self.expand();
        let mut touched = vec![0u64; query.table_count()];
        for k in &keyuses {
            if k.index < 64 {
                touched[k.table] |= 1 << k.index;
            }
        }
        debug!(
            candidates = keyuses.len(),
            sargable = self.sargable.len(),
            "key usage analyzed"
        );
        KeyUseSet {
            keyuses,
            touched,
            sargable: self.sargable,
            not_exists_tables: self.not_exists,
        }
    }

    /// One conjunction whose candidates may bind tables in `usable`
    fn add_scope(&mut self, conjuncts: &[Expr], usable: TableSet, is_where: bool) {
        let start = self.fields.len();
        self.and_level += 1;
        for c in conjuncts {
            self.add_predicate(c, usable);
            self.add_sargable(c, usable);
            if is_where {
                self.check_not_exists(c);
            }
        }
        self.add_equality_closure(conjuncts, usable);
        let level = self.and_level;
        for f in &mut self.fields[start..] {
            f.level = level;
        }
    }

    fn add_predicate(&mut self, expr: &Expr, usable: TableSet) {
        match expr {
            Expr::BinaryOp {
                op: BinaryOp::And, ..
            } => {
                let start = self.fields.len();
                for part in expr.clone().into_conjuncts() {
                    self.add_predicate(&part, usable);
                }
                let level = self.and_level;
                for f in &mut self.fields[start..] {
                    f.level = level;
                }
            }
            Expr::BinaryOp {
                op: BinaryOp::Or, ..
            } => self.add_or(&expr.disjuncts(), usable),
            _ => self.add_leaf(expr, usable),
        }
    }

    fn add_or(&mut self, disjuncts: &[&Expr], usable: TableSet) {
        let org = self.fields.len();
        self.and_level += 1;
        self.add_predicate(disjuncts[0], usable);
        for d in &disjuncts[1..] {
            let new_start = self.fields.len();
            self.and_level += 1;
            self.add_predicate(d, usable);
            self.and_level += 1;
            self.merge(org, new_start, self.and_level);
        }
    }

    /// Keep only old candidates with an equivalent new one, tagging the
    /// survivors with `level`
    fn merge(&mut self, start: usize, new_start: usize, level: u32) {
        let new_fields = self.fields.split_off(new_start);
        for old in &mut self.fields[start..] {
            for new in &new_fields {
                if old.column != new.column || old.fulltext != new.fulltext {
                    continue;
                }
                if old.val == new.val {
                    old.level = level;
                    old.null_rejecting &= new.null_rejecting;
                    old.optimize = old.optimize.max(new.optimize);
                    break;
                }
                if old.is_null_probe() != new.is_null_probe() {
                    if old.is_null_probe() {
                        old.val = new.val.clone();
                    }
                    old.optimize = KeyOptimize::RefOrNull;
                    old.null_rejecting = false;
                    old.level = level;
                    break;
                }
            }
        }
        let mut i = start;
        while i < self.fields.len() {
            if self.fields[i].level == level {
                i += 1;
            } else {
                self.fields.remove(i);
            }
        }
    }

    fn add_leaf(&mut self, expr: &Expr, usable: TableSet) {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOp::Eq,
                right,
            } => {
                if let Some(col) = left.as_column() {
                    self.add_field(col, right, true, usable);
                }
                if let Some(col) = right.as_column() {
                    self.add_field(col, left, true, usable);
                }
            }
            Expr::IsNull {
                expr,
                negated: false,
            } => {
                if let Some(col) = expr.as_column() {
                    if self.query.table(col.table).nullable[col.column] {
                        self.add_field(col, &Expr::null(), false, usable);
                    }
                }
            }
            Expr::Match { columns, query } => self.add_fulltext(columns, query, usable),
            _ => {}
        }
    }

    fn add_field(&mut self, column: ColumnRef, val: &Expr, null_rejecting: bool, usable: TableSet) {
        if !usable.contains(column.table) || !self.val_usable(column, val) {
            return;
        }
        let table = self.query.table(column.table);
        let in_index = table.keys.iter().any(|k| !k.fulltext && k.part_of(column.column).is_some());
        // Unindexed columns still feed hash joins
        if !in_index && val.used_tables().is_empty() {
            return;
        }
        self.fields.push(KeyField {
            column,
            val: val.clone(),
            level: self.and_level,
            null_rejecting,
            optimize: KeyOptimize::Plain,
            fulltext: false,
        });
    }

    /// `val` must not read the key's own table, and may read a semi-join
    /// inner table from outside that nest only through an IN column
    fn val_usable(&self, column: ColumnRef, val: &Expr) -> bool {
        let used = val.used_tables();
        if used.contains(column.table) {
            return false;
        }
        let key_nest = self.query.table(column.table).semi_join;
        for t in used.iter() {
            if let Some(sj) = self.query.table(t).semi_join {
                if key_nest != Some(sj) && !is_in_column(&self.query.semi_joins[sj], val) {
                    return false;
                }
            }
        }
        true
    }

    fn add_fulltext(&mut self, columns: &[ColumnRef], query: &str, usable: TableSet) {
        let Some(first) = columns.first() else {
            return;
        };
        if !usable.contains(first.table) || columns.iter().any(|c| c.table != first.table) {
            return;
        }
        let has_index = self.query.table(first.table).keys.iter().any(|k| {
            k.fulltext && columns.iter().all(|c| k.part_of(c.column).is_some())
        });
        if has_index {
            self.fields.push(KeyField {
                column: *first,
                val: Expr::Match {
                    columns: columns.to_vec(),
                    query: query.to_string(),
                },
                level: self.and_level,
                null_rejecting: false,
                optimize: KeyOptimize::Plain,
                fulltext: true,
            });
        }
    }

    /// Candidates implied by chains of column equalities:
    /// `a = b AND b = c` also binds `a` from `c`, `a = b AND b = 5` binds `a` to 5
    fn add_equality_closure(&mut self, conjuncts: &[Expr], usable: TableSet) {
        let mut classes: Vec<(Vec<ColumnRef>, Option<Expr>)> = Vec::new();
        let find = |classes: &Vec<(Vec<ColumnRef>, Option<Expr>)>, c: ColumnRef| {
            classes.iter().position(|(cols, _)| cols.contains(&c))
        };
        for c in conjuncts {
            let Expr::BinaryOp {
                left,
                op: BinaryOp::Eq,
                right,
            } = c
            else {
                continue;
            };
            match (left.as_column(), right.as_column()) {
                (Some(a), Some(b)) => match (find(&classes, a), find(&classes, b)) {
                    (Some(i), Some(j)) if i != j => {
                        let (cols, constant) = classes.remove(i.max(j));
                        let keep = i.min(j);
                        classes[keep].0.extend(cols);
                        if classes[keep].1.is_none() {
                            classes[keep].1 = constant;
                        }
                    }
                    (Some(_), Some(_)) => {}
                    (Some(i), None) => classes[i].0.push(b),
                    (None, Some(j)) => classes[j].0.push(a),
                    (None, None) => classes.push((vec![a, b], None)),
                },
                (Some(a), None) | (None, Some(a)) => {
                    let other = if left.as_column().is_some() { right } else { left };
                    if let Expr::Literal(d) = other.as_ref() {
                        if d.is_null() {
                            continue;
                        }
                        match find(&classes, a) {
                            Some(i) => {
                                if classes[i].1.is_none() {
                                    classes[i].1 = Some(Expr::Literal(d.clone()));
                                }
                            }
                            None => classes.push((vec![a], Some(Expr::Literal(d.clone())))),
                        }
                    }
                }
                (None, None) => {}
            }
        }

        for (cols, constant) in classes {
            for &m in &cols {
                for &o in &cols {
                    if m != o && m.table != o.table {
                        self.add_field(m, &Expr::Column(o), true, usable);
                    }
                }
                if let Some(c) = &constant {
                    self.add_field(m, c, true, usable);
                }
            }
        }
    }

    fn add_sargable(&mut self, expr: &Expr, usable: TableSet) {
        let hint = match expr {
            Expr::BinaryOp { left, op, right } if *op == BinaryOp::Eq || op.is_range() => {
                let sarg = |op: BinaryOp| match op {
                    BinaryOp::Eq => SargOp::Eq,
                    BinaryOp::Lt => SargOp::Lt,
                    BinaryOp::LtEq => SargOp::LtEq,
                    BinaryOp::Gt => SargOp::Gt,
                    _ => SargOp::GtEq,
                };
                match (left.as_column(), right.as_column()) {
                    (Some(col), _) if !right.used_tables().contains(col.table) => {
                        Some((col, sarg(*op), vec![(**right).clone()]))
                    }
                    (_, Some(col)) if !left.used_tables().contains(col.table) => {
                        Some((col, sarg(op.flipped()), vec![(**left).clone()]))
                    }
                    _ => None,
                }
            }
            Expr::Between {
                expr,
                low,
                high,
                negated: false,
            } => expr
                .as_column()
                .map(|col| (col, SargOp::Between, vec![(**low).clone(), (**high).clone()])),
            Expr::InList {
                expr,
                list,
                negated: false,
            } => expr.as_column().map(|col| (col, SargOp::InList, list.clone())),
            Expr::IsNull { expr, negated } => expr.as_column().map(|col| {
                let op = if *negated { SargOp::IsNotNull } else { SargOp::IsNull };
                (col, op, Vec::new())
            }),
            _ => None,
        };
        if let Some((column, op, values)) = hint {
            let used_tables = values.iter().fold(TableSet::EMPTY, |acc, v| acc | v.used_tables());
            if usable.contains(column.table) && !used_tables.contains(column.table) {
                self.sargable.push(SargableHint {
                    column,
                    op,
                    values,
                    used_tables,
                });
            }
        }
    }

    /// `inner.col IS NULL` on a NOT NULL column can only hold for the
    /// NULL-complemented row
    fn check_not_exists(&mut self, expr: &Expr) {
        if let Expr::IsNull {
            expr,
            negated: false,
        } = expr
        {
            if let Some(col) = expr.as_column() {
                let table = self.query.table(col.table);
                if !table.nullable[col.column] && self.query.outer_join_nest(col.table).is_some() {
                    self.not_exists.insert(col.table);
                }
            }
        }
    }

    /// Expand surviving fields over the indexes of their tables, sort, and
    /// drop candidates whose index has no usable leading key part
    fn expand(&self) -> Vec<KeyUse> {
        let mut out = Vec::new();
        for f in &self.fields {
            let table = self.query.table(f.column.table);
            let used_tables = f.val.used_tables();
            if f.fulltext {
                let Expr::Match { columns, .. } = &f.val else {
                    continue;
                };
                if let Some(index) = table.keys.iter().position(|k| {
                    k.fulltext && columns.iter().all(|c| k.part_of(c.column).is_some())
                }) {
                    out.push(KeyUse {
                        table: table.id,
                        index,
                        keypart: FT_KEYPART,
                        val: f.val.clone(),
                        used_tables: TableSet::EMPTY,
                        null_rejecting: false,
                        optimize: KeyOptimize::Plain,
                    });
                }
                continue;
            }
            for (index, key) in table.keys.iter().enumerate() {
                if key.fulltext {
                    continue;
                }
                if let Some(keypart) = key.part_of(f.column.column) {
                    out.push(KeyUse {
                        table: table.id,
                        index,
                        keypart,
                        val: f.val.clone(),
                        used_tables,
                        null_rejecting: f.null_rejecting,
                        optimize: f.optimize,
                    });
                }
            }
            if !used_tables.is_empty() && f.optimize == KeyOptimize::Plain && !f.is_null_probe() {
                out.push(KeyUse {
                    table: table.id,
                    index: HASH_INDEX,
                    keypart: f.column.column,
                    val: f.val.clone(),
                    used_tables,
                    null_rejecting: true,
                    optimize: KeyOptimize::Plain,
                });
            }
        }

        out.sort_by(|a, b| {
            (a.table, a.index, a.keypart, a.used_tables.bits(), a.optimize)
                .cmp(&(b.table, b.index, b.keypart, b.used_tables.bits(), b.optimize))
        });
        out.dedup_by(|b, a| {
            a.table == b.table && a.index == b.index && a.keypart == b.keypart && a.val == b.val
        });

        let mut kept: Vec<KeyUse> = Vec::with_capacity(out.len());
        // (table, index) -> highest contiguous key part, constant seen for it
        let mut prefix: BTreeMap<(TableId, usize), (usize, bool)> = BTreeMap::new();
        for k in out {
            if k.is_fulltext() || k.is_hash() {
                kept.push(k);
                continue;
            }
            let is_constant = k.used_tables.is_empty() && k.optimize == KeyOptimize::Plain;
            match prefix.get_mut(&(k.table, k.index)) {
                None => {
                    if k.keypart != 0 {
                        continue;
                    }
                    prefix.insert((k.table, k.index), (0, is_constant));
                }
                Some((last, found_constant)) => {
                    if k.keypart > *last + 1 || (k.keypart == *last && *found_constant) {
                        continue;
                    }
                    if k.keypart > *last {
                        *last = k.keypart;
                        *found_constant = is_constant;
                    } else {
                        *found_constant |= is_constant;
                    }
                }
            }
            kept.push(k);
        }
        kept
    }
}

/// `val` is a bare column listed among the nest's IN expressions
fn is_in_column(sj: &SemiJoinNest, val: &Expr) -> bool {
    val.as_column().is_some() && sj.inner_exprs.iter().any(|e| e == val)
}
