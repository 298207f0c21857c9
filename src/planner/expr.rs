//! Predicate and value expressions over the tables of one query block
//!
//! Columns are addressed by (table, column position), so expressions are
//! already resolved when they reach the optimizer. The only construct that
//! exists purely for join execution is [`Expr::Guarded`]: a predicate that
//! passes through as TRUE until the outer-join bracket owning its guard
//! flag arms it.

use std::fmt;

use crate::executor::Datum;
use crate::planner::table_set::{TableId, TableSet};

/// Reference to a column of a query table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: TableId,
    pub column: usize,
}

impl ColumnRef {
    pub fn new(table: TableId, column: usize) -> Self {
        Self { table, column }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // String
    Like,
}

impl BinaryOp {
    /// Check if this is a comparison operator
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    /// Check if this operator bounds an index range
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }

    /// Operator with its operands swapped: `a < b` is `b > a`
    pub fn flipped(&self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => *other,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Which per-bracket flag arms a guarded predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    /// Armed once the bracket has produced a match for the current outer row
    Found,
    /// Armed for real rows, disarmed while a NULL-complemented row is tried
    NotNullComplemented,
}

/// Trigger attached to an outer-join bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    pub bracket: usize,
    pub kind: GuardKind,
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Datum),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    /// Full-text match of `query` against the columns of one table
    Match {
        columns: Vec<ColumnRef>,
        query: String,
    },
    /// Predicate evaluated only while `guard` is armed, TRUE otherwise
    Guarded {
        guard: Guard,
        expr: Box<Expr>,
    },
}

impl Expr {
    pub fn col(table: TableId, column: usize) -> Expr {
        Expr::Column(ColumnRef::new(table, column))
    }

    pub fn lit(value: impl Into<Datum>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn null() -> Expr {
        Expr::Literal(Datum::Null)
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::Eq, right)
    }

    pub fn ne(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::NotEq, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::Lt, right)
    }

    pub fn le(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::LtEq, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::Gt, right)
    }

    pub fn ge(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::GtEq, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::And, right)
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOp::Or, right)
    }

    pub fn not(expr: Expr) -> Expr {
        Expr::UnaryOp {
            op: UnaryOp::Not,
            expr: Box::new(expr),
        }
    }

    pub fn is_null(expr: Expr) -> Expr {
        Expr::IsNull {
            expr: Box::new(expr),
            negated: false,
        }
    }

    pub fn is_not_null(expr: Expr) -> Expr {
        Expr::IsNull {
            expr: Box::new(expr),
            negated: true,
        }
    }

    pub fn between(expr: Expr, low: Expr, high: Expr) -> Expr {
        Expr::Between {
            expr: Box::new(expr),
            low: Box::new(low),
            high: Box::new(high),
            negated: false,
        }
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(expr),
            list,
            negated: false,
        }
    }

    pub fn matches(columns: Vec<ColumnRef>, query: impl Into<String>) -> Expr {
        Expr::Match {
            columns,
            query: query.into(),
        }
    }

    pub fn guarded(guard: Guard, expr: Expr) -> Expr {
        Expr::Guarded {
            guard,
            expr: Box::new(expr),
        }
    }

    /// The referenced column, if this expression is a bare column
    pub fn as_column(&self) -> Option<ColumnRef> {
        match self {
            Expr::Column(c) => Some(*c),
            _ => None,
        }
    }

    /// Literal TRUE
    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal(Datum::Bool(true)))
    }

    /// Literal FALSE or NULL, which can never satisfy a predicate
    pub fn is_false_literal(&self) -> bool {
        matches!(self, Expr::Literal(Datum::Bool(false)) | Expr::Literal(Datum::Null))
    }

    /// Visit every column reference
    pub fn for_each_column(&self, f: &mut impl FnMut(ColumnRef)) {
        match self {
            Expr::Column(c) => f(*c),
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.for_each_column(f);
                right.for_each_column(f);
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } | Expr::Guarded { expr, .. } => {
                expr.for_each_column(f)
            }
            Expr::InList { expr, list, .. } => {
                expr.for_each_column(f);
                list.iter().for_each(|e| e.for_each_column(f));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.for_each_column(f);
                low.for_each_column(f);
                high.for_each_column(f);
            }
            Expr::Match { columns, .. } => columns.iter().copied().for_each(f),
        }
    }

    /// Tables whose columns this expression reads
    pub fn used_tables(&self) -> TableSet {
        let mut set = TableSet::EMPTY;
        self.for_each_column(&mut |c| set.insert(c.table));
        set
    }

    /// Split a conjunction into its top-level conjuncts
    pub fn into_conjuncts(self) -> Vec<Expr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts(self, out: &mut Vec<Expr>) {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => {
                left.collect_conjuncts(out);
                right.collect_conjuncts(out);
            }
            e if e.is_true_literal() => {}
            e => out.push(e),
        }
    }

    /// AND the given predicates together; `None` for an empty list
    pub fn conjoin(parts: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        parts.into_iter().reduce(Expr::and)
    }

    /// Top-level disjuncts of an OR tree
    pub fn disjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOp::Or,
                right,
            } => {
                let mut out = left.disjuncts();
                out.extend(right.disjuncts());
                out
            }
            e => vec![e],
        }
    }

    /// Whether the value is NULL whenever every column of `tables` is NULL
    fn propagates_null(&self, tables: TableSet) -> bool {
        match self {
            Expr::Column(c) => tables.contains(c.table),
            Expr::Literal(d) => d.is_null(),
            Expr::BinaryOp { left, op, right } if !matches!(op, BinaryOp::And | BinaryOp::Or) => {
                left.propagates_null(tables) || right.propagates_null(tables)
            }
            Expr::UnaryOp {
                op: UnaryOp::Neg,
                expr,
            } => expr.propagates_null(tables),
            _ => false,
        }
    }

    /// Whether this predicate can never be TRUE once every column of
    /// `tables` is NULL, i.e. it filters out NULL-complemented rows
    pub fn rejects_nulls_of(&self, tables: TableSet) -> bool {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => left.rejects_nulls_of(tables) || right.rejects_nulls_of(tables),
            Expr::BinaryOp {
                left,
                op: BinaryOp::Or,
                right,
            } => left.rejects_nulls_of(tables) && right.rejects_nulls_of(tables),
            Expr::BinaryOp { .. } => self.propagates_null(tables),
            Expr::UnaryOp {
                op: UnaryOp::Not,
                expr,
            } => match expr.as_ref() {
                Expr::BinaryOp { op, .. } if op.is_comparison() || *op == BinaryOp::Like => {
                    expr.propagates_null(tables)
                }
                _ => false,
            },
            Expr::IsNull {
                expr,
                negated: true,
            } => expr.propagates_null(tables),
            Expr::InList {
                expr,
                negated: false,
                ..
            }
            | Expr::Between {
                expr,
                negated: false,
                ..
            } => expr.propagates_null(tables),
            Expr::Match { columns, .. } => columns.iter().any(|c| tables.contains(c.table)),
            _ => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "t{}.c{}", c.table, c.column),
            Expr::Literal(Datum::Null) => write!(f, "NULL"),
            Expr::Literal(Datum::String(s)) => write!(f, "'{}'", s),
            Expr::Literal(Datum::Bool(b)) => write!(f, "{}", b),
            Expr::Literal(Datum::Int(i)) | Expr::Literal(Datum::Timestamp(i)) => write!(f, "{}", i),
            Expr::Literal(Datum::Float(v)) => write!(f, "{}", v),
            Expr::BinaryOp { left, op, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::UnaryOp { op: UnaryOp::Not, expr } => write!(f, "NOT {}", expr),
            Expr::UnaryOp { op: UnaryOp::Neg, expr } => write!(f, "-{}", expr),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::Match { columns, query } => {
                write!(f, "MATCH(")?;
                for (i, c) in columns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "t{}.c{}", c.table, c.column)?;
                }
                write!(f, ") AGAINST ('{}')", query)
            }
            Expr::Guarded { guard, expr } => {
                let kind = match guard.kind {
                    GuardKind::Found => "found",
                    GuardKind::NotNullComplemented => "not_null_compl",
                };
                write!(f, "trigcond({}#{}, {})", kind, guard.bracket, expr)
            }
        }
    }
}
