//! Range estimation
//!
//! Turns the sargable hints of one table into index key ranges, using only
//! hints whose bound values are known before the join starts (literals and
//! columns of constant tables). Contradictory hints prove the table empty.

use std::cmp::Ordering;

use crate::catalog::KeyInfo;
use crate::executor::eval::{eval, RowSource};
use crate::executor::Datum;
use crate::planner::cost::{KEY_LOOKUP_COST, ROW_LOOKUP_COST};
use crate::planner::keyuse::{KeyUseSet, SargOp, SargableHint};
use crate::planner::query::QueryTable;
use crate::planner::table_set::TableSet;
use crate::storage::{KeyBound, KeyRange};

/// Fraction of rows assumed to satisfy one open-ended comparison
pub const RANGE_SELECTIVITY: f64 = 1.0 / 3.0;

/// Fraction of rows assumed to satisfy a closed interval
pub const INTERVAL_SELECTIVITY: f64 = 1.0 / 9.0;

/// Ranges are enumerated up to this many point combinations
const MAX_RANGES: usize = 64;

/// Chosen range access for one table
#[derive(Debug, Clone, PartialEq)]
pub struct RangeEstimate {
    pub index: usize,
    pub ranges: Vec<KeyRange>,
    /// Leading key parts bound by equality in every range
    pub eq_parts: usize,
    /// Key parts constrained, including a trailing interval
    pub key_parts: usize,
    pub rows: f64,
    pub cost: f64,
}

/// Range analysis of one table
#[derive(Debug, Clone, Default)]
pub struct RangeAnalysis {
    pub best: Option<RangeEstimate>,
    /// The hints contradict each other: no row can qualify
    pub impossible: bool,
}

/// Values a single column may take
#[derive(Debug, Clone, PartialEq)]
enum ColumnConstraint {
    Points(Vec<Datum>),
    Interval { low: PartBound, high: PartBound },
}

/// Bound on a single key part
#[derive(Debug, Clone, PartialEq)]
enum PartBound {
    Unbounded,
    Included(Datum),
    Excluded(Datum),
}

impl ColumnConstraint {
    fn interval(low: PartBound, high: PartBound) -> Self {
        ColumnConstraint::Interval { low, high }
    }

    /// `None` when no value satisfies the constraint
    fn satisfiable(self) -> Option<ColumnConstraint> {
        match &self {
            ColumnConstraint::Points(p) if p.is_empty() => None,
            ColumnConstraint::Interval { low, high } if interval_empty(low, high) => None,
            _ => Some(self),
        }
    }

    /// Both constraints at once; `None` when nothing satisfies them
    fn intersect(self, other: ColumnConstraint) -> Option<ColumnConstraint> {
        use ColumnConstraint::*;
        let result = match (self, other) {
            (Points(a), Points(b)) => Points(a.into_iter().filter(|v| b.contains(v)).collect()),
            (Points(p), Interval { low, high }) | (Interval { low, high }, Points(p)) => Points(
                p.into_iter()
                    .filter(|v| above(v, &low) && below(v, &high))
                    .collect(),
            ),
            (
                Interval {
                    low: l1,
                    high: h1,
                },
                Interval {
                    low: l2,
                    high: h2,
                },
            ) => {
                let low = tighter(l1, l2, Ordering::Greater);
                let high = tighter(h1, h2, Ordering::Less);
                if interval_empty(&low, &high) {
                    return None;
                }
                Interval { low, high }
            }
        };
        result.satisfiable()
    }
}

fn above(v: &Datum, low: &PartBound) -> bool {
    match low {
        PartBound::Unbounded => true,
        PartBound::Included(b) => v >= b,
        PartBound::Excluded(b) => v > b,
    }
}

fn below(v: &Datum, high: &PartBound) -> bool {
    match high {
        PartBound::Unbounded => true,
        PartBound::Included(b) => v <= b,
        PartBound::Excluded(b) => v < b,
    }
}

/// The more restrictive of two bounds; `wider` is the ordering of the
/// value that restricts more (Greater for lower bounds)
fn tighter(a: PartBound, b: PartBound, wider: Ordering) -> PartBound {
    let value = |x: &PartBound| match x {
        PartBound::Unbounded => None,
        PartBound::Included(v) | PartBound::Excluded(v) => Some(v.clone()),
    };
    match (value(&a), value(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(va), Some(vb)) => match va.cmp(&vb) {
            Ordering::Equal => {
                if matches!(a, PartBound::Excluded(_)) {
                    a
                } else {
                    b
                }
            }
            ord if ord == wider => a,
            _ => b,
        },
    }
}

fn interval_empty(low: &PartBound, high: &PartBound) -> bool {
    let (lv, lx) = match low {
        PartBound::Unbounded => return false,
        PartBound::Included(v) => (v, false),
        PartBound::Excluded(v) => (v, true),
    };
    let (hv, hx) = match high {
        PartBound::Unbounded => return false,
        PartBound::Included(v) => (v, false),
        PartBound::Excluded(v) => (v, true),
    };
    match lv.cmp(hv) {
        Ordering::Greater => true,
        Ordering::Equal => lx || hx,
        Ordering::Less => false,
    }
}

/// Estimates range access for the tables of a query block
pub struct RangeEstimator<'a> {
    keyuses: &'a KeyUseSet,
    /// Tables whose columns are known before the join starts
    const_map: TableSet,
    consts: &'a dyn RowSource,
}

impl<'a> RangeEstimator<'a> {
    pub fn new(keyuses: &'a KeyUseSet, const_map: TableSet, consts: &'a dyn RowSource) -> Self {
        Self {
            keyuses,
            const_map,
            consts,
        }
    }

    /// Best range over the indexes of `table`, or proof that it is empty
    pub fn analyze(&self, table: &QueryTable, total_rows: f64) -> RangeAnalysis {
        let mut constraints: Vec<Option<ColumnConstraint>> = vec![None; table.column_count];
        for hint in self.keyuses.sargable_for(table.id) {
            let Some(c) = self.constraint(hint) else {
                continue;
            };
            let slot = &mut constraints[hint.column.column];
            let merged = match slot.take() {
                Some(existing) => existing.intersect(c),
                None => c.satisfiable(),
            };
            match merged {
                Some(m) => *slot = Some(m),
                None => {
                    return RangeAnalysis {
                        best: None,
                        impossible: true,
                    }
                }
            }
        }

        let mut best: Option<RangeEstimate> = None;
        for (index, key) in table.keys.iter().enumerate() {
            if key.fulltext {
                continue;
            }
            let Some(est) = self.index_range(table, index, key, &constraints, total_rows) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| est.cost < b.cost) {
                best = Some(est);
            }
        }
        RangeAnalysis {
            best,
            impossible: false,
        }
    }

    /// Constraint expressed by a hint whose values are all computable now;
    /// an empty point set stands for a contradiction
    fn constraint(&self, hint: &SargableHint) -> Option<ColumnConstraint> {
        if !hint.used_tables.is_subset_of(self.const_map) {
            return None;
        }
        let mut values = Vec::with_capacity(hint.values.len());
        for v in &hint.values {
            values.push(eval(v, self.consts).ok()?);
        }
        use PartBound::*;
        let first = values.first().cloned().unwrap_or_default();
        // Comparisons with NULL are never true
        let null_bound = values.iter().any(Datum::is_null)
            && !matches!(hint.op, SargOp::InList | SargOp::IsNull | SargOp::IsNotNull);
        if null_bound {
            return Some(ColumnConstraint::Points(Vec::new()));
        }
        Some(match hint.op {
            SargOp::Eq => ColumnConstraint::Points(vec![first]),
            SargOp::InList => {
                let mut points: Vec<Datum> = values.into_iter().filter(|v| !v.is_null()).collect();
                points.sort();
                points.dedup();
                ColumnConstraint::Points(points)
            }
            SargOp::IsNull => ColumnConstraint::Points(vec![Datum::Null]),
            SargOp::IsNotNull => ColumnConstraint::interval(Excluded(Datum::Null), Unbounded),
            SargOp::Lt => ColumnConstraint::interval(Excluded(Datum::Null), Excluded(first)),
            SargOp::LtEq => ColumnConstraint::interval(Excluded(Datum::Null), Included(first)),
            SargOp::Gt => ColumnConstraint::interval(Excluded(first), Unbounded),
            SargOp::GtEq => ColumnConstraint::interval(Included(first), Unbounded),
            SargOp::Between => {
                let high = values.get(1).cloned().unwrap_or_default();
                ColumnConstraint::interval(Included(first), Included(high))
            }
        })
    }

    fn index_range(
        &self,
        table: &QueryTable,
        index: usize,
        key: &KeyInfo,
        constraints: &[Option<ColumnConstraint>],
        total_rows: f64,
    ) -> Option<RangeEstimate> {
        let mut prefixes: Vec<Vec<Datum>> = vec![Vec::new()];
        let mut eq_parts = 0;
        let mut interval = None;
        for &column in &key.parts {
            match constraints.get(column).cloned().flatten() {
                Some(ColumnConstraint::Points(points)) => {
                    if prefixes.len() * points.len() > MAX_RANGES {
                        break;
                    }
                    prefixes = prefixes
                        .iter()
                        .flat_map(|p| {
                            points.iter().map(move |v| {
                                let mut next = p.clone();
                                next.push(v.clone());
                                next
                            })
                        })
                        .collect();
                    eq_parts += 1;
                }
                Some(ColumnConstraint::Interval { low, high }) => {
                    interval = Some((low, high));
                    break;
                }
                None => break,
            }
        }
        if eq_parts == 0 && interval.is_none() {
            return None;
        }

        let ranges: Vec<KeyRange> = prefixes
            .into_iter()
            .map(|prefix| match &interval {
                None => KeyRange::point(prefix),
                Some((low, high)) => KeyRange {
                    low: extend_bound(&prefix, low),
                    high: extend_bound(&prefix, high),
                },
            })
            .filter(|r| !r.is_empty())
            .collect();
        let key_parts = eq_parts + usize::from(interval.is_some());

        let source = &table.source;
        let exact: Option<f64> = ranges
            .iter()
            .map(|r| source.records_in_range(index, r))
            .sum::<Option<f64>>();
        let rows = match exact {
            Some(rows) => rows,
            None => {
                let per_prefix = if eq_parts == 0 {
                    total_rows
                } else {
                    source
                        .rows_per_key(index, eq_parts)
                        .unwrap_or(total_rows * 0.1)
                };
                let selectivity = match &interval {
                    None => 1.0,
                    Some((PartBound::Unbounded, _))
                    | Some((_, PartBound::Unbounded))
                    | Some((PartBound::Excluded(Datum::Null), _)) => RANGE_SELECTIVITY,
                    Some(_) => INTERVAL_SELECTIVITY,
                };
                ranges.len() as f64 * per_prefix * selectivity
            }
        }
        .min(total_rows);

        Some(RangeEstimate {
            index,
            cost: ranges.len() as f64 * KEY_LOOKUP_COST + rows * ROW_LOOKUP_COST,
            ranges,
            eq_parts,
            key_parts,
            rows,
        })
    }
}

fn extend_bound(prefix: &[Datum], bound: &PartBound) -> KeyBound {
    let with = |v: &Datum| {
        let mut values = prefix.to_vec();
        values.push(v.clone());
        values
    };
    match bound {
        PartBound::Unbounded if prefix.is_empty() => KeyBound::Unbounded,
        PartBound::Unbounded => KeyBound::Included(prefix.to_vec()),
        PartBound::Included(v) => KeyBound::Included(with(v)),
        PartBound::Excluded(v) => KeyBound::Excluded(with(v)),
    }
}
