//! Expression evaluation
//!
//! Evaluates an [`Expr`] against the current rows of the join's table
//! slots. Guarded predicates consult the source for the state of their
//! trigger flag and pass through as TRUE while it is disarmed.

use crate::planner::expr::{BinaryOp, ColumnRef, Expr, Guard, UnaryOp};

use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};

/// Supplies column values and guard state to the evaluator
pub trait RowSource {
    /// Current value of a column
    fn column(&self, col: ColumnRef) -> ExecutorResult<Datum>;

    /// Whether the predicate behind `guard` is currently evaluated
    fn guard_armed(&self, _guard: Guard) -> bool {
        true
    }
}

/// Source with no tables, for constant expressions
pub struct NoRows;

impl RowSource for NoRows {
    fn column(&self, col: ColumnRef) -> ExecutorResult<Datum> {
        Err(ExecutorError::TableNotFound(col.table))
    }
}

/// Evaluate a predicate: only TRUE passes, FALSE and NULL reject
pub fn eval_predicate(expr: &Expr, src: &dyn RowSource) -> ExecutorResult<bool> {
    Ok(matches!(eval(expr, src)?.as_bool(), Some(true)))
}

/// Evaluate an expression
pub fn eval(expr: &Expr, src: &dyn RowSource) -> ExecutorResult<Datum> {
    match expr {
        Expr::Column(col) => src.column(*col),

        Expr::Literal(d) => Ok(d.clone()),

        Expr::BinaryOp { left, op, right } => match op {
            // Short-circuit without hiding NULL
            BinaryOp::And => {
                let l = eval(left, src)?;
                if l.as_bool() == Some(false) {
                    return Ok(Datum::Bool(false));
                }
                eval_and(&l, &eval(right, src)?)
            }
            BinaryOp::Or => {
                let l = eval(left, src)?;
                if l.as_bool() == Some(true) {
                    return Ok(Datum::Bool(true));
                }
                eval_or(&l, &eval(right, src)?)
            }
            _ => {
                let lval = eval(left, src)?;
                let rval = eval(right, src)?;
                eval_binary_op(*op, &lval, &rval)
            }
        },

        Expr::UnaryOp { op, expr } => {
            let val = eval(expr, src)?;
            eval_unary_op(*op, &val)
        }

        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, src)?.is_null();
            Ok(Datum::Bool(is_null != *negated))
        }

        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let val = eval(expr, src)?;
            if val.is_null() {
                return Ok(Datum::Null);
            }
            let mut saw_null = false;
            for item in list {
                let item_val = eval(item, src)?;
                if item_val.is_null() {
                    saw_null = true;
                } else if val == item_val {
                    return Ok(Datum::Bool(!*negated));
                }
            }
            if saw_null {
                Ok(Datum::Null)
            } else {
                Ok(Datum::Bool(*negated))
            }
        }

        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let val = eval(expr, src)?;
            let low_val = eval(low, src)?;
            let high_val = eval(high, src)?;
            if val.is_null() || low_val.is_null() || high_val.is_null() {
                return Ok(Datum::Null);
            }
            let in_range = val >= low_val && val <= high_val;
            Ok(Datum::Bool(in_range != *negated))
        }

        Expr::Match { columns, query } => {
            for col in columns {
                if src.column(*col)?.contains_words(query) {
                    return Ok(Datum::Bool(true));
                }
            }
            Ok(Datum::Bool(false))
        }

        Expr::Guarded { guard, expr } => {
            if src.guard_armed(*guard) {
                eval(expr, src)
            } else {
                Ok(Datum::Bool(true))
            }
        }
    }
}

/// Evaluate a binary operation other than AND/OR
fn eval_binary_op(op: BinaryOp, left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    if left.is_null() || right.is_null() {
        return Ok(Datum::Null);
    }

    match op {
        BinaryOp::Add => arith(op, left, right, i64::checked_add, |a, b| a + b),
        BinaryOp::Sub => arith(op, left, right, i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => arith(op, left, right, i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => {
            if right.as_float() == Some(0.0) {
                return Err(ExecutorError::InvalidOperation(
                    "division by zero".to_string(),
                ));
            }
            arith(op, left, right, i64::checked_div, |a, b| a / b)
        }
        BinaryOp::Mod => match (left, right) {
            (_, Datum::Int(0)) => Err(ExecutorError::InvalidOperation(
                "modulo by zero".to_string(),
            )),
            (Datum::Int(a), Datum::Int(b)) => Ok(Datum::Int(a.wrapping_rem(*b))),
            _ => Err(ExecutorError::InvalidOperation(format!(
                "cannot compute modulo of {:?} and {:?}",
                left, right
            ))),
        },

        BinaryOp::Eq => Ok(Datum::Bool(left == right)),
        BinaryOp::NotEq => Ok(Datum::Bool(left != right)),
        BinaryOp::Lt => Ok(Datum::Bool(left < right)),
        BinaryOp::LtEq => Ok(Datum::Bool(left <= right)),
        BinaryOp::Gt => Ok(Datum::Bool(left > right)),
        BinaryOp::GtEq => Ok(Datum::Bool(left >= right)),

        BinaryOp::And => eval_and(left, right),
        BinaryOp::Or => eval_or(left, right),

        BinaryOp::Like => left
            .like(right)
            .ok_or_else(|| ExecutorError::InvalidOperation("LIKE requires strings".to_string())),
    }
}

fn arith(
    op: BinaryOp,
    left: &Datum,
    right: &Datum,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> ExecutorResult<Datum> {
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => int_op(*a, *b).map(Datum::Int).ok_or_else(|| {
            ExecutorError::InvalidOperation(format!("integer overflow in {:?}", op))
        }),
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => Ok(Datum::Float(float_op(a, b))),
            _ => Err(ExecutorError::InvalidOperation(format!(
                "cannot apply {:?} to {:?} and {:?}",
                op, left, right
            ))),
        },
    }
}

/// SQL AND with three-valued logic
fn eval_and(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left.as_bool(), right.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Ok(Datum::Bool(false)),
        (Some(true), Some(true)) => Ok(Datum::Bool(true)),
        _ => Ok(Datum::Null),
    }
}

/// SQL OR with three-valued logic
fn eval_or(left: &Datum, right: &Datum) -> ExecutorResult<Datum> {
    match (left.as_bool(), right.as_bool()) {
        (Some(true), _) | (_, Some(true)) => Ok(Datum::Bool(true)),
        (Some(false), Some(false)) => Ok(Datum::Bool(false)),
        _ => Ok(Datum::Null),
    }
}

/// Evaluate a unary operation
fn eval_unary_op(op: UnaryOp, val: &Datum) -> ExecutorResult<Datum> {
    match op {
        UnaryOp::Not => val
            .not()
            .ok_or_else(|| ExecutorError::InvalidOperation("NOT requires boolean".to_string())),
        UnaryOp::Neg => val
            .negate()
            .ok_or_else(|| ExecutorError::InvalidOperation("negation requires number".to_string())),
    }
}
