//! Nested-loop join executor
//!
//! Runs a [`JoinPlan`] as an explicit stack of frames, one per node whose
//! scan is in progress, and yields result rows lazily. A node reads its
//! table once per row of the nodes before it, evaluates its attached
//! condition and descends to the next node; the terminal level projects the
//! select list.
//!
//! Control never has to return through every frame in order: a node may
//! lower `return_to` so that every deeper frame finishes and reading resumes
//! at an earlier node. Outer-join brackets use this when a predicate armed
//! by the first match fails at an earlier inner table, and first-match
//! semi-joins use it to skip the remaining inner rows once one match was
//! fully extended.
//!
//! Buffered nodes collect partial rows instead of descending and match
//! them in batches when their buffer fills up or the join runs out of rows.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::executor::context::KillFlag;
use crate::planner::expr::{ColumnRef, Guard, GuardKind};
use crate::planner::physical::{AccessMethod, BufferKind, JoinPlan};
use crate::planner::query::{NestId, SelectItem};
use crate::planner::table_set::TableId;
use crate::storage::{RowCursor, RowId};

use super::access::{build_key, open_scan, prefix_key, scan_request, ScanRequest, VecCursor};
use super::buffer::{BufferedRecord, JoinBuffer};
use super::datum::Datum;
use super::error::{ExecutorError, ExecutorResult};
use super::eval::{eval, eval_predicate, RowSource};
use super::row::Row;
use super::temp_table::{MemoryTempTableProvider, TempTable, TempTableProvider};
use super::Executor;

/// Rows read between cooperative yields
const YIELD_INTERVAL: u64 = 256;

/// Current row of every table plus the guard flags of every bracket
struct JoinState {
    rows: Vec<Option<Row>>,
    found: Vec<bool>,
    not_null_complemented: Vec<bool>,
}

impl RowSource for JoinState {
    fn column(&self, col: ColumnRef) -> ExecutorResult<Datum> {
        match self.rows.get(col.table) {
            Some(Some(row)) => row.get(col.column).cloned(),
            Some(None) => Ok(Datum::Null),
            None => Err(ExecutorError::TableNotFound(col.table)),
        }
    }

    fn guard_armed(&self, guard: Guard) -> bool {
        let flags = match guard.kind {
            GuardKind::Found => &self.found,
            GuardKind::NotNullComplemented => &self.not_null_complemented,
        };
        flags.get(guard.bracket).copied().unwrap_or(true)
    }
}

/// How a finished frame asks its caller to go on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// LIMIT reached; every open scan stops
    Stop,
}

/// Outcome of checking one row at one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Reject,
    /// Stop reading this node; no later row can qualify
    NoMoreRows,
    /// An earlier node takes over (`return_to` was lowered)
    Return,
    /// Extend the row; `saved` is the level to resume at afterwards
    Match { saved: usize },
}

enum LoopPhase {
    Enter,
    Read,
    AfterChild { saved: usize },
    PostLoop { exhausted: bool },
    AfterNull,
}

struct LoopFrame {
    node: usize,
    phase: LoopPhase,
    cursor: Option<Box<dyn RowCursor>>,
    /// Leading key of the current row (loose scan)
    row_key: Option<Vec<Datum>>,
    /// Rows with this leading key are skipped (loose scan)
    skip_key: Option<Vec<Datum>>,
}

impl LoopFrame {
    fn new(node: usize) -> Self {
        Self {
            node,
            phase: LoopPhase::Enter,
            cursor: None,
            row_key: None,
            skip_key: None,
        }
    }
}

enum FlushPhase {
    Start,
    NextInner,
    Try,
    AfterChild { record: usize, saved: usize },
    Complement,
    AfterComplement,
}

/// Rows of the buffered node's table, matched against the records
enum InnerSource {
    Idle,
    Scan(Box<dyn RowCursor>),
    Hashed {
        cursor: Box<dyn RowCursor>,
        columns: Vec<usize>,
        records: BTreeMap<Vec<Datum>, Vec<usize>>,
    },
    /// Records grouped by lookup key, groups in key order
    Batched {
        groups: Vec<Vec<usize>>,
        at: usize,
        cursor: Option<Box<dyn RowCursor>>,
    },
}

struct FlushFrame {
    node: usize,
    records: Vec<BufferedRecord>,
    /// Prefix rows to restore once the flush ends
    saved: BufferedRecord,
    phase: FlushPhase,
    source: InnerSource,
    inner: Option<(RowId, Row)>,
    candidates: Vec<usize>,
    next_candidate: usize,
    complement_at: usize,
}

impl FlushFrame {
    fn new(node: usize, records: Vec<BufferedRecord>, saved: BufferedRecord) -> Self {
        Self {
            node,
            records,
            saved,
            phase: FlushPhase::Start,
            source: InnerSource::Idle,
            inner: None,
            candidates: Vec::new(),
            next_candidate: 0,
            complement_at: 0,
        }
    }
}

enum Frame {
    Loop(LoopFrame),
    Flush(Box<FlushFrame>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ready,
    Running,
    Finished,
}

/// Resume level after a first-match jump to `target`
fn jump_level(target: Option<usize>) -> usize {
    target.map_or(0, |t| t + 1)
}

/// Nested-loop executor for one join plan
pub struct JoinExecutor {
    plan: Arc<JoinPlan>,
    kill: KillFlag,
    temp: Arc<dyn TempTableProvider>,
    examined: Arc<AtomicU64>,
    stage: Stage,
    frames: Vec<Frame>,
    state: JoinState,
    /// Flow reported by the most recently finished frame
    flow: Flow,
    /// Node `k` keeps reading only while `return_to > k`
    return_to: usize,
    node_rowids: Vec<Option<RowId>>,
    /// Bracket whose first match the node still has to record
    first_unmatched: Vec<Option<NestId>>,
    /// The node matched since its loose-scan key last changed
    matched: Vec<bool>,
    unique_cache: Vec<Option<(Vec<Datum>, Option<(RowId, Row)>)>>,
    buffers: Vec<JoinBuffer>,
    /// Tables provided by the nodes before each node
    prefix_tables: Vec<Vec<TableId>>,
    weedout_tables: Vec<Box<dyn TempTable>>,
    /// Filled temporary tables, indexed by semi-join nest
    materialized: Vec<Option<Box<dyn TempTable>>>,
    flush_from: usize,
    skipped: u64,
    sent: u64,
    produced: u64,
}

impl JoinExecutor {
    pub fn new(plan: Arc<JoinPlan>, kill: KillFlag) -> Self {
        let prefix_tables = (0..plan.nodes.len())
            .map(|k| plan.nodes[..k].iter().flat_map(|n| n.tables.iter()).collect())
            .collect();
        let mut exec = Self {
            plan,
            kill,
            temp: Arc::new(MemoryTempTableProvider),
            examined: Arc::new(AtomicU64::new(0)),
            stage: Stage::Ready,
            frames: Vec::new(),
            state: JoinState {
                rows: Vec::new(),
                found: Vec::new(),
                not_null_complemented: Vec::new(),
            },
            flow: Flow::Continue,
            return_to: 0,
            node_rowids: Vec::new(),
            first_unmatched: Vec::new(),
            matched: Vec::new(),
            unique_cache: Vec::new(),
            buffers: Vec::new(),
            prefix_tables,
            weedout_tables: Vec::new(),
            materialized: Vec::new(),
            flush_from: 0,
            skipped: 0,
            sent: 0,
            produced: 0,
        };
        exec.reset();
        exec
    }

    /// Use `provider` for weed-out and materialization tables
    #[must_use]
    pub fn with_temp_tables(mut self, provider: Arc<dyn TempTableProvider>) -> Self {
        self.temp = provider;
        self.reset();
        self
    }

    /// Count rows read into a shared counter
    #[must_use]
    pub fn with_examined_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.examined = counter;
        self
    }

    /// Rows read from storage so far, sub-plans included
    pub fn rows_examined(&self) -> u64 {
        self.examined.load(Ordering::Relaxed)
    }

    fn reset(&mut self) {
        let plan = Arc::clone(&self.plan);
        let n = plan.nodes.len();
        let nests = plan.query.nests.len();
        self.state = JoinState {
            rows: (0..plan.query.table_count()).map(|t| plan.const_row(t)).collect(),
            found: vec![false; nests],
            not_null_complemented: vec![true; nests],
        };
        self.frames.clear();
        self.flow = Flow::Continue;
        self.return_to = 0;
        self.node_rowids = vec![None; n];
        self.first_unmatched = vec![None; n];
        self.matched = vec![false; n];
        self.unique_cache = vec![None; n];
        self.buffers = (0..n).map(|_| JoinBuffer::default()).collect();
        self.weedout_tables = plan.weedouts.iter().map(|_| self.temp.create()).collect();
        self.materialized = (0..plan.query.semi_joins.len()).map(|_| None).collect();
        self.flush_from = 0;
        self.skipped = 0;
        self.sent = 0;
        self.produced = 0;
        self.stage = Stage::Ready;
    }

    /// Start node `k` for the current prefix; the terminal level produces
    /// an output row
    fn descend(&mut self, k: usize) -> ExecutorResult<Option<Row>> {
        let plan = Arc::clone(&self.plan);
        if k == plan.nodes.len() {
            self.flow = Flow::Continue;
            let Some((row, flow)) = self.output_row(&plan)? else {
                return Ok(None);
            };
            self.flow = flow;
            self.produced += 1;
            return Ok(Some(row));
        }
        if plan.nodes[k].buffer.is_some() {
            let record = self.snapshot(k);
            if self.buffers[k].push(record, plan.buffer_size) {
                let records = self.buffers[k].take();
                let saved = self.snapshot(k);
                self.frames
                    .push(Frame::Flush(Box::new(FlushFrame::new(k, records, saved))));
            }
            self.flow = Flow::Continue;
            return Ok(None);
        }
        self.frames.push(Frame::Loop(LoopFrame::new(k)));
        Ok(None)
    }

    fn output_row(&mut self, plan: &JoinPlan) -> ExecutorResult<Option<(Row, Flow)>> {
        let out = &plan.output;
        if let Some(having) = &out.having {
            if !eval_predicate(having, &self.state)? {
                return Ok(None);
            }
        }
        let sort_keys = if out.sort { out.order_by.len() } else { 0 };
        let mut values = Vec::with_capacity(out.select.len() + sort_keys);
        for item in &out.select {
            values.push(match item {
                SelectItem::Expr(e) | SelectItem::Min(e) | SelectItem::Max(e) => eval(e, &self.state)?,
                SelectItem::CountStar => Datum::Null,
            });
        }
        for o in out.order_by.iter().take(sort_keys) {
            values.push(self.state.column(o.column)?);
        }
        let mut flow = Flow::Continue;
        if out.limit_at_join() {
            if self.skipped < out.offset {
                self.skipped += 1;
                return Ok(None);
            }
            self.sent += 1;
            if out.limit.is_some_and(|limit| self.sent >= limit) {
                flow = Flow::Stop;
            }
        }
        Ok(Some((Row::new(values), flow)))
    }

    fn condition_holds(&self, plan: &JoinPlan, node: usize) -> ExecutorResult<bool> {
        match &plan.nodes[node].condition {
            Some(cond) => eval_predicate(cond, &self.state),
            None => Ok(true),
        }
    }

    /// Check the current row of node `k` and record the first match of
    /// every bracket it completes
    fn evaluate(&mut self, plan: &JoinPlan, k: usize) -> ExecutorResult<Verdict> {
        if !self.condition_holds(plan, k)? {
            return Ok(Verdict::Reject);
        }
        let mut found = true;
        while found {
            let Some(b) = self.first_unmatched[k] else {
                break;
            };
            let bracket = plan
                .bracket(b)
                .ok_or_else(|| ExecutorError::Internal(format!("nest {} has no bracket", b)))?;
            // Arms the guarded predicates of every inner node
            self.state.found[b] = true;
            for tab in bracket.first..=k {
                if self.condition_holds(plan, tab)? {
                    continue;
                }
                let not_exists = plan.nodes[k].not_exists || plan.nodes[tab].not_exists;
                if tab == k {
                    found = false;
                    if not_exists {
                        return Ok(Verdict::NoMoreRows);
                    }
                } else {
                    self.return_to = tab + 1;
                    return Ok(if not_exists {
                        Verdict::NoMoreRows
                    } else {
                        Verdict::Return
                    });
                }
            }
            self.first_unmatched[k] = bracket
                .parent
                .filter(|&p| plan.bracket(p).is_some_and(|pb| pb.last == k));
        }
        if !found {
            return Ok(Verdict::Reject);
        }
        self.matched[k] = true;
        let node = &plan.nodes[k];
        if !node.weedout_check.is_empty() {
            if !self.weedout_passes(plan, k)? {
                return Ok(Verdict::Reject);
            }
            return Ok(Verdict::Match {
                saved: self.return_to,
            });
        }
        let saved = match node.return_after_match {
            Some(target) => jump_level(target),
            None => self.return_to,
        };
        Ok(Verdict::Match { saved })
    }

    /// Record the current combination in every weed-out table checked at
    /// node `k`; false when it was already sent
    fn weedout_passes(&mut self, plan: &JoinPlan, k: usize) -> ExecutorResult<bool> {
        for &w in &plan.nodes[k].weedout_check {
            let key = plan.weedouts[w]
                .key_nodes
                .iter()
                .map(|&i| match self.node_rowids[i] {
                    Some(rowid) => Datum::Int(rowid as i64),
                    None => Datum::Null,
                })
                .collect();
            if !self.weedout_tables[w].insert(key, Row::empty())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Produce the NULL-complemented row of bracket `b`; false when an
    /// attached condition rejects it
    fn complement(&mut self, plan: &JoinPlan, b: NestId) -> ExecutorResult<bool> {
        let bracket = plan
            .bracket(b)
            .ok_or_else(|| ExecutorError::Internal(format!("nest {} has no bracket", b)))?;
        let last = bracket.last;
        for tab in bracket.first..=last {
            let node = &plan.nodes[tab];
            if let Some(nb) = node.bracket {
                self.state.found[nb] = true;
                self.state.not_null_complemented[nb] = false;
            }
            for t in node.tables.iter() {
                self.state.rows[t] = Some(Row::nulls(plan.query.table(t).column_count));
            }
            self.node_rowids[tab] = None;
            if !self.condition_holds(plan, tab)? {
                return Ok(false);
            }
        }
        // The complemented row may be the first match of enclosing brackets
        // ending at the same node
        self.first_unmatched[last] = Some(b);
        loop {
            let upper = self.first_unmatched[last]
                .and_then(|u| plan.bracket(u))
                .and_then(|u| u.parent)
                .filter(|&p| plan.bracket(p).is_some_and(|pb| pb.last == last));
            self.first_unmatched[last] = upper;
            let Some(u) = upper else {
                break;
            };
            self.state.found[u] = true;
            let first = plan.bracket(u).map_or(last, |pb| pb.first);
            for tab in first..=last {
                if !self.condition_holds(plan, tab)? {
                    self.return_to = tab + 1;
                    return Ok(false);
                }
            }
        }
        let node = &plan.nodes[last];
        if !node.weedout_check.is_empty() {
            return self.weedout_passes(plan, last);
        }
        if let Some(target) = node.return_after_match {
            self.return_to = self.return_to.min(jump_level(target));
        }
        Ok(true)
    }

    /// Make a fetched row current for node `k`
    fn place_row(&mut self, plan: &JoinPlan, k: usize, rowid: RowId, row: Row) -> ExecutorResult<()> {
        let node = &plan.nodes[k];
        self.node_rowids[k] = Some(rowid);
        match &node.access {
            AccessMethod::MaterializedLookup { nest, .. } | AccessMethod::MaterializedScan { nest } => {
                let m = plan.materialized_nest(*nest).ok_or_else(|| {
                    ExecutorError::Internal(format!("semi-join {} is not materialized", nest))
                })?;
                for t in node.tables.iter() {
                    self.state.rows[t] = Some(Row::nulls(plan.query.table(t).column_count));
                }
                for (value, target) in row.into_values().into_iter().zip(&m.copy_back) {
                    if let Some(col) = target {
                        if let Some(Some(slot)) = self.state.rows.get_mut(col.table) {
                            slot.set(col.column, value)?;
                        }
                    }
                }
            }
            _ => self.state.rows[node.table] = Some(row),
        }
        Ok(())
    }

    fn snapshot(&self, k: usize) -> BufferedRecord {
        let slots = self.prefix_tables[k]
            .iter()
            .map(|&t| (t, self.state.rows[t].clone()))
            .collect();
        BufferedRecord::new(slots, self.node_rowids[..k].to_vec())
    }

    fn restore(&mut self, record: &BufferedRecord) {
        for (t, row) in &record.slots {
            self.state.rows[*t] = row.clone();
        }
        self.node_rowids[..record.rowids.len()].clone_from_slice(&record.rowids);
    }

    /// Fill the temporary table of a materialized semi-join, once
    async fn materialize(&mut self, plan: &JoinPlan, nest: usize) -> ExecutorResult<()> {
        if self.materialized.get(nest).is_some_and(Option::is_some) {
            return Ok(());
        }
        let m = plan
            .materialized_nest(nest)
            .ok_or_else(|| ExecutorError::Internal(format!("semi-join {} is not materialized", nest)))?;
        let mut sub: Box<dyn Executor> = Box::new(
            JoinExecutor::new(Arc::clone(&m.plan), self.kill.clone())
                .with_temp_tables(Arc::clone(&self.temp))
                .with_examined_counter(Arc::clone(&self.examined)),
        );
        let mut table = self.temp.create();
        sub.open().await?;
        while let Some(row) = sub.next().await? {
            table.insert(row.values().to_vec(), row)?;
        }
        sub.close().await?;
        debug!(nest, rows = table.len(), "semi-join materialized");
        if let Some(slot) = self.materialized.get_mut(nest) {
            *slot = Some(table);
        }
        Ok(())
    }

    fn temp_rows(&self, nest: usize) -> ExecutorResult<&dyn TempTable> {
        self.materialized
            .get(nest)
            .and_then(Option::as_deref)
            .ok_or_else(|| ExecutorError::Internal(format!("semi-join {} is not materialized", nest)))
    }

    /// Open the scan of node `k` for the current prefix
    async fn open_node(&mut self, plan: &JoinPlan, k: usize) -> ExecutorResult<Box<dyn RowCursor>> {
        let node = &plan.nodes[k];
        match &node.access {
            AccessMethod::MaterializedLookup { nest, key } => {
                self.materialize(plan, *nest).await?;
                let values = key
                    .iter()
                    .map(|e| eval(e, &self.state))
                    .collect::<ExecutorResult<Vec<_>>>()?;
                let rows = if values.iter().any(Datum::is_null) {
                    Vec::new()
                } else {
                    self.temp_rows(*nest)?
                        .lookup(&values)
                        .map(|(pos, row)| vec![(pos as RowId, row.clone())])
                        .unwrap_or_default()
                };
                Ok(Box::new(VecCursor::new(rows)))
            }
            AccessMethod::MaterializedScan { nest } => {
                self.materialize(plan, *nest).await?;
                let rows = self.temp_rows(*nest)?
                    .rows()
                    .iter()
                    .enumerate()
                    .map(|(pos, row)| (pos as RowId, row.clone()))
                    .collect();
                Ok(Box::new(VecCursor::new(rows)))
            }
            _ => {
                let table = plan.query.table(node.table);
                let request = scan_request(table, &node.access, &self.state)?;
                let unique_key = match (&node.access, &request) {
                    (AccessMethod::UniqueLookup(_), ScanRequest::Lookup { key, .. }) => Some(key.clone()),
                    _ => None,
                };
                let Some(key) = unique_key else {
                    return open_scan(Arc::clone(&table.source), request).await;
                };
                // At most one row per key: repeated keys reuse the last read
                if let Some((cached, row)) = &self.unique_cache[k] {
                    if *cached == key {
                        return Ok(Box::new(VecCursor::new(row.iter().cloned().collect())));
                    }
                }
                let mut cursor = open_scan(Arc::clone(&table.source), request).await?;
                let row = cursor.next().await?;
                self.unique_cache[k] = Some((key, row.clone()));
                Ok(Box::new(VecCursor::new(row.into_iter().collect())))
            }
        }
    }

    async fn step_loop(&mut self, mut frame: LoopFrame) -> ExecutorResult<Option<Row>> {
        let plan = Arc::clone(&self.plan);
        let k = frame.node;
        let node = &plan.nodes[k];
        match frame.phase {
            LoopPhase::Enter => {
                for &w in &node.weedout_reset {
                    self.weedout_tables[w].clear();
                }
                self.return_to = k + 1;
                if let Some(ls) = &node.loose_scan {
                    self.matched[ls.last] = false;
                }
                if let Some(b) = node.bracket {
                    let bracket = plan
                        .bracket(b)
                        .ok_or_else(|| ExecutorError::Internal(format!("nest {} has no bracket", b)))?;
                    self.state.found[b] = false;
                    self.state.not_null_complemented[b] = true;
                    self.first_unmatched[bracket.last] = Some(b);
                    if let Some(pre) = &bracket.precondition {
                        if !eval_predicate(pre, &self.state)? {
                            frame.phase = LoopPhase::PostLoop { exhausted: true };
                            self.frames.push(Frame::Loop(frame));
                            return Ok(None);
                        }
                    }
                }
                frame.cursor = Some(self.open_node(&plan, k).await?);
                frame.phase = LoopPhase::Read;
                self.frames.push(Frame::Loop(frame));
                Ok(None)
            }
            LoopPhase::Read => {
                if self.return_to <= k {
                    frame.phase = LoopPhase::PostLoop { exhausted: false };
                    self.frames.push(Frame::Loop(frame));
                    return Ok(None);
                }
                if self.kill.is_killed() {
                    return Err(ExecutorError::Killed);
                }
                let Some(cursor) = frame.cursor.as_mut() else {
                    return Err(ExecutorError::Internal(format!("node {} read before open", k)));
                };
                let Some((rowid, row)) = cursor.next().await? else {
                    frame.phase = LoopPhase::PostLoop { exhausted: true };
                    self.frames.push(Frame::Loop(frame));
                    return Ok(None);
                };
                let examined = self.examined.fetch_add(1, Ordering::Relaxed) + 1;
                // Periodically hand the worker back to the runtime
                if examined % YIELD_INTERVAL == 0 && tokio::runtime::Handle::try_current().is_ok() {
                    tokio::task::consume_budget().await;
                }
                if let Some(ls) = &node.loose_scan {
                    let key = prefix_key(&row, &ls.columns);
                    if frame.skip_key.as_ref() == Some(&key) {
                        self.frames.push(Frame::Loop(frame));
                        return Ok(None);
                    }
                    if frame.skip_key.take().is_some() {
                        self.matched[ls.last] = false;
                    }
                    frame.row_key = Some(key);
                }
                self.place_row(&plan, k, rowid, row)?;
                match self.evaluate(&plan, k)? {
                    Verdict::Reject | Verdict::Return => {
                        self.frames.push(Frame::Loop(frame));
                        Ok(None)
                    }
                    Verdict::NoMoreRows => {
                        frame.phase = LoopPhase::PostLoop { exhausted: true };
                        self.frames.push(Frame::Loop(frame));
                        Ok(None)
                    }
                    Verdict::Match { saved } => {
                        frame.phase = LoopPhase::AfterChild { saved };
                        self.frames.push(Frame::Loop(frame));
                        self.descend(k + 1)
                    }
                }
            }
            LoopPhase::AfterChild { saved } => {
                if self.flow == Flow::Stop {
                    return Ok(None);
                }
                if saved < self.return_to {
                    self.return_to = saved;
                }
                if self.return_to <= k {
                    frame.phase = LoopPhase::PostLoop { exhausted: false };
                } else {
                    if let Some(ls) = &node.loose_scan {
                        if self.matched[ls.last] {
                            frame.skip_key = frame.row_key.clone();
                        }
                    }
                    frame.phase = LoopPhase::Read;
                }
                self.frames.push(Frame::Loop(frame));
                Ok(None)
            }
            LoopPhase::PostLoop { exhausted } => {
                self.flow = Flow::Continue;
                let Some(b) = node.bracket.filter(|&b| exhausted && !self.state.found[b]) else {
                    return Ok(None);
                };
                if !self.complement(&plan, b)? {
                    return Ok(None);
                }
                let last = plan.bracket(b).map_or(k, |br| br.last);
                frame.phase = LoopPhase::AfterNull;
                self.frames.push(Frame::Loop(frame));
                self.descend(last + 1)
            }
            // The frame ends with the flow of the complemented row
            LoopPhase::AfterNull => Ok(None),
        }
    }

    async fn step_flush(&mut self, mut frame: Box<FlushFrame>) -> ExecutorResult<Option<Row>> {
        let plan = Arc::clone(&self.plan);
        let k = frame.node;
        let node = &plan.nodes[k];
        let table = plan.query.table(node.table);
        match frame.phase {
            FlushPhase::Start => {
                trace!(node = k, records = frame.records.len(), "flushing join buffer");
                if let Some(pre) = node
                    .bracket
                    .and_then(|b| plan.bracket(b))
                    .and_then(|br| br.precondition.as_ref())
                {
                    for i in 0..frame.records.len() {
                        self.restore(&frame.records[i]);
                        frame.records[i].admitted = eval_predicate(pre, &self.state)?;
                    }
                }
                frame.source = match node.buffer.unwrap_or(BufferKind::Flat) {
                    BufferKind::Flat => {
                        let request = scan_request(table, &node.access, &self.state)?;
                        InnerSource::Scan(open_scan(Arc::clone(&table.source), request).await?)
                    }
                    BufferKind::Hashed => {
                        let AccessMethod::HashProbe { probe } = &node.access else {
                            return Err(ExecutorError::Internal(format!(
                                "hashed buffer on {} access",
                                node.access.name()
                            )));
                        };
                        let mut records: BTreeMap<Vec<Datum>, Vec<usize>> = BTreeMap::new();
                        for i in 0..frame.records.len() {
                            if !frame.records[i].is_open() {
                                continue;
                            }
                            self.restore(&frame.records[i]);
                            let key = probe
                                .iter()
                                .map(|(e, _)| eval(e, &self.state))
                                .collect::<ExecutorResult<Vec<_>>>()?;
                            if key.iter().any(Datum::is_null) {
                                continue;
                            }
                            records.entry(key).or_default().push(i);
                        }
                        InnerSource::Hashed {
                            cursor: open_scan(Arc::clone(&table.source), ScanRequest::Full).await?,
                            columns: probe.iter().map(|&(_, c)| c).collect(),
                            records,
                        }
                    }
                    BufferKind::KeyBatched => {
                        let key = node.access.lookup_key().ok_or_else(|| {
                            ExecutorError::Internal(format!(
                                "key-batched buffer on {} access",
                                node.access.name()
                            ))
                        })?;
                        let mut groups: BTreeMap<Vec<Datum>, Vec<usize>> = BTreeMap::new();
                        for i in 0..frame.records.len() {
                            if !frame.records[i].is_open() {
                                continue;
                            }
                            self.restore(&frame.records[i]);
                            if let Some(values) = build_key(key, &self.state)? {
                                groups.entry(values).or_default().push(i);
                            }
                        }
                        InnerSource::Batched {
                            groups: groups.into_values().collect(),
                            at: 0,
                            cursor: None,
                        }
                    }
                };
                frame.phase = FlushPhase::NextInner;
                self.frames.push(Frame::Flush(frame));
                Ok(None)
            }
            FlushPhase::NextInner => {
                if self.kill.is_killed() {
                    return Err(ExecutorError::Killed);
                }
                let fetched = match &mut frame.source {
                    InnerSource::Idle => None,
                    InnerSource::Scan(cursor) => cursor.next().await?.map(|row| (row, None)),
                    InnerSource::Hashed {
                        cursor,
                        columns,
                        records,
                    } => cursor.next().await?.map(|(rowid, row)| {
                        let matching = records
                            .get(&prefix_key(&row, columns))
                            .cloned()
                            .unwrap_or_default();
                        ((rowid, row), Some(matching))
                    }),
                    InnerSource::Batched { groups, at, cursor } => loop {
                        if let Some(c) = cursor.as_mut() {
                            if let Some(row) = c.next().await? {
                                break Some((row, Some(groups[*at].clone())));
                            }
                            *cursor = None;
                            *at += 1;
                        }
                        let Some(&first) = groups.get(*at).and_then(|g| g.first()) else {
                            break None;
                        };
                        self.restore(&frame.records[first]);
                        let request = scan_request(table, &node.access, &self.state)?;
                        *cursor = Some(open_scan(Arc::clone(&table.source), request).await?);
                    },
                };
                match fetched {
                    Some((row, candidates)) => {
                        self.examined.fetch_add(1, Ordering::Relaxed);
                        frame.inner = Some(row);
                        // Flat buffers try every open record
                        frame.candidates = candidates.unwrap_or_else(|| {
                            (0..frame.records.len())
                                .filter(|&i| frame.records[i].is_open())
                                .collect()
                        });
                        frame.next_candidate = 0;
                        frame.phase = FlushPhase::Try;
                    }
                    None => {
                        frame.source = InnerSource::Idle;
                        frame.phase = FlushPhase::Complement;
                    }
                }
                self.frames.push(Frame::Flush(frame));
                Ok(None)
            }
            FlushPhase::Try => {
                let Some((rowid, row)) = frame.inner.clone() else {
                    frame.phase = FlushPhase::NextInner;
                    self.frames.push(Frame::Flush(frame));
                    return Ok(None);
                };
                while frame.next_candidate < frame.candidates.len() {
                    let i = frame.candidates[frame.next_candidate];
                    frame.next_candidate += 1;
                    if !frame.records[i].is_open() {
                        continue;
                    }
                    self.restore(&frame.records[i]);
                    self.place_row(&plan, k, rowid, row.clone())?;
                    self.return_to = k + 1;
                    if let Some(b) = node.bracket {
                        let matched = frame.records[i].matched;
                        self.state.found[b] = matched;
                        self.state.not_null_complemented[b] = true;
                        self.first_unmatched[k] = if matched { None } else { Some(b) };
                    }
                    let verdict = self.evaluate(&plan, k)?;
                    if node.bracket.is_some_and(|b| self.state.found[b]) {
                        frame.records[i].matched = true;
                    }
                    match verdict {
                        Verdict::Reject | Verdict::Return => {}
                        Verdict::NoMoreRows => frame.records[i].done = true,
                        Verdict::Match { saved } => {
                            frame.phase = FlushPhase::AfterChild { record: i, saved };
                            self.frames.push(Frame::Flush(frame));
                            return self.descend(k + 1);
                        }
                    }
                }
                frame.phase = FlushPhase::NextInner;
                self.frames.push(Frame::Flush(frame));
                Ok(None)
            }
            FlushPhase::AfterChild { record, saved } => {
                if self.flow == Flow::Stop {
                    self.end_flush(&frame);
                    return Ok(None);
                }
                if saved < self.return_to {
                    self.return_to = saved;
                }
                if self.return_to <= k {
                    frame.records[record].done = true;
                }
                frame.phase = FlushPhase::Try;
                self.frames.push(Frame::Flush(frame));
                Ok(None)
            }
            FlushPhase::Complement => {
                if let Some(b) = node.bracket {
                    let last = plan.bracket(b).map_or(k, |br| br.last);
                    while frame.complement_at < frame.records.len() {
                        let i = frame.complement_at;
                        frame.complement_at += 1;
                        if frame.records[i].matched {
                            continue;
                        }
                        self.restore(&frame.records[i]);
                        self.return_to = k + 1;
                        if self.complement(&plan, b)? {
                            frame.phase = FlushPhase::AfterComplement;
                            self.frames.push(Frame::Flush(frame));
                            return self.descend(last + 1);
                        }
                    }
                }
                self.end_flush(&frame);
                self.flow = Flow::Continue;
                Ok(None)
            }
            FlushPhase::AfterComplement => {
                if self.flow == Flow::Stop {
                    self.end_flush(&frame);
                    return Ok(None);
                }
                frame.phase = FlushPhase::Complement;
                self.frames.push(Frame::Flush(frame));
                Ok(None)
            }
        }
    }

    /// Put back the prefix the flush interrupted and let its node go on
    fn end_flush(&mut self, frame: &FlushFrame) {
        self.restore(&frame.saved);
        self.return_to = frame.node;
    }

    /// Every frame has finished: flush what is left in the buffers, in
    /// node order, then stop
    fn finish_pass(&mut self) {
        if self.flow != Flow::Stop {
            while self.flush_from < self.buffers.len() {
                let k = self.flush_from;
                if !self.buffers[k].is_empty() {
                    let records = self.buffers[k].take();
                    let saved = self.snapshot(k);
                    self.frames
                        .push(Frame::Flush(Box::new(FlushFrame::new(k, records, saved))));
                    return;
                }
                self.flush_from += 1;
            }
        }
        self.stage = Stage::Finished;
        debug!(
            rows = self.produced,
            examined = self.rows_examined(),
            limit_reached = self.flow == Flow::Stop,
            "join finished"
        );
    }
}

#[async_trait]
impl Executor for JoinExecutor {
    async fn open(&mut self) -> ExecutorResult<()> {
        self.reset();
        debug!(
            nodes = self.plan.nodes.len(),
            buffers = self.plan.nodes.iter().filter(|n| n.buffer.is_some()).count(),
            "join started"
        );
        Ok(())
    }

    async fn next(&mut self) -> ExecutorResult<Option<Row>> {
        loop {
            let row = match self.stage {
                Stage::Finished => return Ok(None),
                Stage::Ready => {
                    let out = &self.plan.output;
                    if out.limit_at_join() && out.limit == Some(0) {
                        self.stage = Stage::Finished;
                        return Ok(None);
                    }
                    self.stage = Stage::Running;
                    self.descend(0)?
                }
                Stage::Running => match self.frames.pop() {
                    Some(Frame::Loop(frame)) => self.step_loop(frame).await?,
                    Some(Frame::Flush(frame)) => self.step_flush(frame).await?,
                    None => {
                        self.finish_pass();
                        None
                    }
                },
            };
            if row.is_some() {
                return Ok(row);
            }
        }
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        self.frames.clear();
        for buffer in &mut self.buffers {
            buffer.take();
        }
        self.materialized.iter_mut().for_each(|m| *m = None);
        self.stage = Stage::Finished;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::planner::expr::Expr;
    use crate::planner::optimizer::{Optimizer, PlanOutcome};
    use crate::planner::query::{QueryBlock, QueryBuilder};
    use crate::planner::test_utils::{generated, int_def, rows, source};

    async fn plan(query: QueryBlock, config: OptimizerConfig) -> Arc<JoinPlan> {
        match Optimizer::new(config)
            .optimize(query, &KillFlag::new())
            .await
            .unwrap()
        {
            PlanOutcome::Execute(plan) => Arc::new(plan),
            other => panic!("expected an executable plan, got {:?}", other),
        }
    }

    async fn run(plan: Arc<JoinPlan>) -> Vec<Vec<Option<i64>>> {
        let mut exec = JoinExecutor::new(plan, KillFlag::new());
        exec.open().await.unwrap();
        let mut out = Vec::new();
        while let Some(row) = exec.next().await.unwrap() {
            out.push(row.values().iter().map(Datum::as_int).collect());
        }
        exec.close().await.unwrap();
        out
    }

    fn cross_query() -> QueryBlock {
        let mut qb = QueryBuilder::new();
        let a = qb
            .table("a", source(int_def("a", &["x"], None), generated(3, 1, |i, _| i as i64)))
            .unwrap();
        let b = qb
            .table("b", source(int_def("b", &["y"], None), generated(2, 1, |i, _| 10 + i as i64)))
            .unwrap();
        qb.select_column(a, 0).select_column(b, 0);
        qb.build().unwrap()
    }

    #[tokio::test]
    async fn test_cross_join_produces_every_pair_once() {
        let mut out = run(plan(cross_query(), OptimizerConfig::default()).await).await;
        out.sort();
        let mut expected = Vec::new();
        for x in 0..3 {
            for y in 10..12 {
                expected.push(vec![Some(x), Some(y)]);
            }
        }
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_left_join_complements_unmatched_rows() {
        let mut qb = QueryBuilder::new();
        let a = qb
            .table("a", source(int_def("a", &["id"], None), rows(&[&[Some(1)], &[Some(2)], &[Some(3)]])))
            .unwrap();
        let b = qb
            .table("b", source(int_def("b", &["a_id"], None), rows(&[&[Some(1)]])))
            .unwrap();
        qb.left_join(&[b], Expr::eq(Expr::col(b, 0), Expr::col(a, 0)))
            .unwrap();
        qb.select_column(a, 0).select_column(b, 0);
        let mut out = run(plan(qb.build().unwrap(), OptimizerConfig::default()).await).await;
        out.sort();
        assert_eq!(
            out,
            vec![vec![Some(1), Some(1)], vec![Some(2), None], vec![Some(3), None]]
        );
    }

    #[tokio::test]
    async fn test_limit_stops_every_scan() {
        let mut query = cross_query();
        query.limit = Some(2);
        let plan = plan(query, OptimizerConfig::default().with_join_cache_level(0)).await;
        let mut exec = JoinExecutor::new(plan, KillFlag::new());
        exec.open().await.unwrap();
        assert!(exec.next().await.unwrap().is_some());
        assert!(exec.next().await.unwrap().is_some());
        assert!(exec.next().await.unwrap().is_none());
        // Two inner rows for the first outer row, plus the outer row itself
        assert_eq!(exec.rows_examined(), 3);
    }

    #[tokio::test]
    async fn test_limit_zero_emits_nothing() {
        let mut query = cross_query();
        query.limit = Some(0);
        let plan = plan(query, OptimizerConfig::default().with_join_cache_level(0)).await;
        let mut exec = JoinExecutor::new(plan, KillFlag::new());
        exec.open().await.unwrap();
        assert!(exec.next().await.unwrap().is_none());
        assert!(exec.next().await.unwrap().is_none());
        assert_eq!(exec.rows_examined(), 0);
    }

    #[tokio::test]
    async fn test_kill_interrupts_join() {
        let plan = plan(cross_query(), OptimizerConfig::default()).await;
        let kill = KillFlag::new();
        let mut exec = JoinExecutor::new(plan, kill.clone());
        exec.open().await.unwrap();
        kill.kill();
        assert!(matches!(exec.next().await, Err(ExecutorError::Killed)));
    }
}
