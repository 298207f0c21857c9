//! Physical join plan
//!
//! The materialized form of a chosen join order: one [`JoinNode`] per
//! non-constant table (or per materialized semi-join) in execution order,
//! with the access method, the attached condition and the outer-join and
//! semi-join markers the nested-loop executor needs.
//!
//! Outer-join brackets are index ranges over `nodes`, addressed by the id
//! of the nest they execute.

pub mod planner;

pub use planner::PlanMaterializer;

use std::sync::Arc;

use crate::executor::{Datum, Row};
use crate::planner::expr::{ColumnRef, Expr};
use crate::planner::query::{NestId, OrderItem, QueryBlock, SelectItem};
use crate::planner::stats::ConstRow;
use crate::planner::table_set::{TableId, TableSet};
use crate::storage::KeyRange;

/// Where one key part value comes from at lookup time
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPartSource {
    /// Known before execution
    Const(Datum),
    /// Copied from the current row of an earlier table
    Field(ColumnRef),
    /// Evaluated over earlier tables
    Expr(Expr),
}

/// One bound key part
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPart {
    pub source: KeyPartSource,
    /// A NULL value matches nothing
    pub null_rejecting: bool,
}

/// Lookup key builder for index accesses
#[derive(Debug, Clone, PartialEq)]
pub struct LookupKey {
    pub index: usize,
    pub parts: Vec<KeyPart>,
}

/// How a node reads its table
#[derive(Debug, Clone, PartialEq)]
pub enum AccessMethod {
    /// Constant table; never part of the node list
    ConstLookup,
    /// At most one row per key; repeated keys reuse the last row
    UniqueLookup(LookupKey),
    NonUniqueLookup(LookupKey),
    /// Lookup the key, then the key with `null_part` set to NULL
    RefOrNull { key: LookupKey, null_part: usize },
    FullTextLookup { index: usize, query: String },
    IndexScan { index: usize },
    IndexScanReverse { index: usize },
    RangeScan { index: usize, ranges: Vec<KeyRange> },
    FullScan,
    /// Full scan probed against hashed join-buffer records; pairs are
    /// (expression over buffered tables, column of this table)
    HashProbe { probe: Vec<(Expr, usize)> },
    /// One row per distinct value of the first `prefix` key parts
    LooseIndexScan { index: usize, prefix: usize },
    /// Probe the materialized semi-join by its outer expressions
    MaterializedLookup { nest: usize, key: Vec<Expr> },
    /// Read the materialized semi-join as a table
    MaterializedScan { nest: usize },
}

impl AccessMethod {
    /// Lookup key of index lookups
    pub fn lookup_key(&self) -> Option<&LookupKey> {
        match self {
            AccessMethod::UniqueLookup(key)
            | AccessMethod::NonUniqueLookup(key)
            | AccessMethod::RefOrNull { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessMethod::ConstLookup => "const",
            AccessMethod::UniqueLookup(_) => "eq_ref",
            AccessMethod::NonUniqueLookup(_) => "ref",
            AccessMethod::RefOrNull { .. } => "ref_or_null",
            AccessMethod::FullTextLookup { .. } => "fulltext",
            AccessMethod::IndexScan { .. } => "index",
            AccessMethod::IndexScanReverse { .. } => "index_reverse",
            AccessMethod::RangeScan { .. } => "range",
            AccessMethod::FullScan => "ALL",
            AccessMethod::HashProbe { .. } => "hash_ALL",
            AccessMethod::LooseIndexScan { .. } => "loose_index",
            AccessMethod::MaterializedLookup { .. } => "sjm_lookup",
            AccessMethod::MaterializedScan { .. } => "sjm_scan",
        }
    }
}

/// Join buffer flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Block nested loop: every inner row is matched against every record
    Flat,
    /// Records hashed by their join key, probed by inner rows
    Hashed,
    /// Distinct record keys looked up in key order
    KeyBatched,
}

/// Inner tables of one outer join, executed at `nodes[first..=last]`
#[derive(Debug, Clone, PartialEq)]
pub struct Bracket {
    pub nest: NestId,
    pub first: usize,
    pub last: usize,
    /// Nearest enclosing bracket
    pub parent: Option<NestId>,
    /// ON-expression parts that read only outer tables; when false the
    /// inner tables are not read and the NULL row is produced directly
    pub precondition: Option<Expr>,
}

/// Duplicate weed-out over `nodes[first..=last]`
#[derive(Debug, Clone, PartialEq)]
pub struct WeedoutRange {
    pub nest: usize,
    pub first: usize,
    pub last: usize,
    /// Nodes whose row ids identify a result combination
    pub key_nodes: Vec<usize>,
}

/// Loose-scan duplicate removal driven by the first node of the range
#[derive(Debug, Clone, PartialEq)]
pub struct LooseScanSpec {
    /// Columns of the leading key parts compared between rows
    pub columns: Vec<usize>,
    /// Last node of the semi-join range
    pub last: usize,
}

/// Independently planned semi-join filled into a temporary table
#[derive(Debug, Clone)]
pub struct MaterializedNest {
    pub nest: usize,
    /// Produces one row of IN values per inner combination
    pub plan: Arc<JoinPlan>,
    /// Column receiving each materialized value, when the IN expression is
    /// a bare column
    pub copy_back: Vec<Option<ColumnRef>>,
}

/// One step of the nested loop
#[derive(Debug, Clone)]
pub struct JoinNode {
    /// Table read by this node; first inner table for materialized nodes
    pub table: TableId,
    /// Tables whose values this node provides
    pub tables: TableSet,
    pub access: AccessMethod,
    /// Conjunction of every predicate evaluated here
    pub condition: Option<Expr>,
    /// Bracket opened by this node
    pub bracket: Option<NestId>,
    /// Stop reading once a match is found: WHERE rejects every match
    pub not_exists: bool,
    pub buffer: Option<BufferKind>,
    /// Weed-out tables emptied when this node starts a new scan
    pub weedout_reset: Vec<usize>,
    /// Weed-out tables checked for each match of this node
    pub weedout_check: Vec<usize>,
    /// After a match is fully extended, resume reading at this node
    /// (`None` stops the whole join)
    pub return_after_match: Option<Option<usize>>,
    pub loose_scan: Option<LooseScanSpec>,
    /// Estimated rows per prefix row
    pub estimated_rows: f64,
}

impl JoinNode {
    pub fn new(table: TableId, access: AccessMethod) -> Self {
        Self {
            table,
            tables: TableSet::single(table),
            access,
            condition: None,
            bracket: None,
            not_exists: false,
            buffer: None,
            weedout_reset: Vec::new(),
            weedout_check: Vec::new(),
            return_after_match: None,
            loose_scan: None,
            estimated_rows: 1.0,
        }
    }
}

/// What the terminal node produces
#[derive(Debug, Clone, Default)]
pub struct OutputSpec {
    pub select: Vec<SelectItem>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    /// Rows must be sorted after the join
    pub sort: bool,
    /// Rows are folded into one implicit group
    pub aggregate: bool,
    /// Duplicate rows are dropped: GROUP BY over the selected columns
    pub distinct: bool,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl OutputSpec {
    /// The join itself can count rows for LIMIT
    pub fn limit_at_join(&self) -> bool {
        !self.sort && !self.aggregate && !self.distinct
    }
}

/// Executable nested-loop plan
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub query: Arc<QueryBlock>,
    pub const_tables: Vec<TableId>,
    /// Rows of constant tables, indexed by table id
    pub const_rows: Vec<Option<ConstRow>>,
    pub nodes: Vec<JoinNode>,
    /// Indexed by nest id
    pub brackets: Vec<Option<Bracket>>,
    pub weedouts: Vec<WeedoutRange>,
    pub materialized: Vec<MaterializedNest>,
    pub output: OutputSpec,
    pub buffer_size: usize,
    pub cost: f64,
    pub rows: f64,
}

impl JoinPlan {
    /// Table order: constant tables, then every node's tables, with
    /// materialized semi-joins expanded into their own order
    pub fn table_order(&self) -> Vec<TableId> {
        let mut order = self.const_tables.clone();
        for node in &self.nodes {
            order.extend(self.node_tables(node));
        }
        order
    }

    fn node_tables(&self, node: &JoinNode) -> Vec<TableId> {
        match &node.access {
            AccessMethod::MaterializedLookup { nest, .. } | AccessMethod::MaterializedScan { nest } => self
                .materialized_nest(*nest)
                .map(|m| m.plan.nodes.iter().flat_map(|n| m.plan.node_tables(n)).collect())
                .unwrap_or_default(),
            _ => vec![node.table],
        }
    }

    pub fn materialized_nest(&self, nest: usize) -> Option<&MaterializedNest> {
        self.materialized.iter().find(|m| m.nest == nest)
    }

    pub fn bracket(&self, nest: NestId) -> Option<&Bracket> {
        self.brackets.get(nest).and_then(Option::as_ref)
    }

    /// Row standing for `table` before execution starts
    pub fn const_row(&self, table: TableId) -> Option<Row> {
        match self.const_rows.get(table)? {
            Some(ConstRow::Found { row, .. }) => Some(row.clone()),
            Some(ConstRow::NullRow) => Some(Row::nulls(self.query.table(table).column_count)),
            None => None,
        }
    }
}
