//! Cost model for join planning
//!
//! Given a partial join order and one more table, picks the cheapest way to
//! read that table: an index lookup bound by earlier tables or constants,
//! a hash probe through a join buffer, a range scan, or a full scan.
//!
//! Costs are in page-read units. Lookups and row fetches cost one unit,
//! evaluating a row costs [`ROW_EVALUATE_COST`].

use crate::config::OptimizerConfig;
use crate::planner::keyuse::{KeyOptimize, KeyUse, KeyUseSet, HASH_INDEX};
use crate::planner::query::QueryBlock;
use crate::planner::search::Position;
use crate::planner::stats::JoinStatistics;
use crate::planner::table_set::{TableId, TableSet};

/// Cost of evaluating the attached condition on one row
pub const ROW_EVALUATE_COST: f64 = 0.2;

/// Cost of one index seek
pub const KEY_LOOKUP_COST: f64 = 1.0;

/// Cost of fetching one row by index
pub const ROW_LOOKUP_COST: f64 = 1.0;

/// Plans within this margin of the best cost are not recorded as better
pub const COST_EPS: f64 = 0.001;

/// Share of rows surviving a hash-join equality with no index statistics
pub const HASH_FANOUT: f64 = 0.1;

/// Share of rows a scan keeps when an unused equality still filters it
pub const SCAN_FILTER_FACTOR: f64 = 0.75;

/// Share of rows matched by a full-text search
pub const FULLTEXT_FANOUT: f64 = 0.1;

/// Share of rows matched by a non-unique lookup without statistics
pub const REF_FANOUT: f64 = 0.1;

/// Floor for per-lookup row estimates
pub const MIN_ROWS: f64 = 1.0;

/// Cost of checking or inserting one row in an in-memory temporary table
pub const TEMPTABLE_ROW_COST: f64 = 0.05;

/// How a table is read at one position of the join order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Constant table, read before the join
    Const,
    /// Unique lookup returning at most one row
    EqRef,
    /// Non-unique lookup
    Ref,
    /// Lookup for a value, then for NULL
    RefOrNull,
    FullText,
    /// Hash probe of buffered rows
    Hash,
    Range,
    Scan,
    /// One row per distinct index prefix
    LooseIndexScan,
}

/// Key bound by a lookup access
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRef {
    /// Index number, or [`HASH_INDEX`] for hash probes
    pub index: usize,
    /// One candidate per bound key part, in key part order
    pub parts: Vec<KeyUse>,
}

/// Chosen access for one table at one position
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPath {
    pub kind: AccessKind,
    pub key: Option<KeyRef>,
    /// Rows produced per row of the preceding prefix
    pub records: f64,
    /// Cost of all reads of this table for the whole prefix
    pub read_cost: f64,
    /// Tables the lookup key reads
    pub depends: TableSet,
    pub use_join_buffer: bool,
    /// Key parts forming the group prefix of a loose index scan
    pub loose_prefix: usize,
}

impl AccessPath {
    /// Access of a constant table
    pub fn constant() -> Self {
        Self {
            kind: AccessKind::Const,
            key: None,
            records: 1.0,
            read_cost: 0.0,
            depends: TableSet::EMPTY,
            use_join_buffer: false,
            loose_prefix: 0,
        }
    }

    /// Read cost plus the cost of evaluating every produced row
    pub fn total_cost(&self, record_count: f64) -> f64 {
        self.read_cost + record_count * self.records * ROW_EVALUATE_COST
    }
}

/// Number of distinct lookups a key depending on `depends` performs: the
/// fan-out of the prefix positions that feed the key
pub fn prev_record_reads(prefix: &[Position], depends: TableSet) -> f64 {
    prefix
        .iter()
        .filter(|p| depends.contains(p.table))
        .fold(1.0, |acc, p| acc * p.access.records.max(MIN_ROWS))
}

/// Join-buffer refills needed to hold `record_count` prefix rows
pub fn buffer_refills(record_count: f64, prefix_width: usize, buffer_size: usize) -> f64 {
    1.0 + (record_count * prefix_width as f64 / buffer_size.max(1) as f64).floor()
}

/// Access-path cost estimator for one query block
pub struct CostModel<'a> {
    query: &'a QueryBlock,
    stats: &'a JoinStatistics,
    keyuses: &'a KeyUseSet,
    config: &'a OptimizerConfig,
}

impl<'a> CostModel<'a> {
    pub fn new(
        query: &'a QueryBlock,
        stats: &'a JoinStatistics,
        keyuses: &'a KeyUseSet,
        config: &'a OptimizerConfig,
    ) -> Self {
        Self {
            query,
            stats,
            keyuses,
            config,
        }
    }

    pub fn query(&self) -> &'a QueryBlock {
        self.query
    }

    pub fn stats(&self) -> &'a JoinStatistics {
        self.stats
    }

    pub fn config(&self) -> &'a OptimizerConfig {
        self.config
    }

    /// Whether `table` may read through a join buffer at a position that
    /// is not the first non-constant one
    pub fn join_buffer_allowed(&self, table: TableId) -> bool {
        let query = self.query;
        let switches = &self.config.switches;
        if !self.config.flat_buffers_allowed() || !query.order_by.is_empty() {
            return false;
        }
        if let Some(nest) = query.outer_join_nest(table) {
            if !switches.outer_join_with_cache
                || query.nests[nest].tables.len() != 1
                || query.nest_chain(table).len() != 1
            {
                return false;
            }
        }
        if query.table(table).semi_join.is_some() && !switches.semijoin_with_cache {
            return false;
        }
        true
    }

    /// Cheapest access to `table` after `prefix`, which produced
    /// `record_count` rows
    pub fn best_access_path(
        &self,
        table: TableId,
        prefix: &[Position],
        record_count: f64,
        allow_buffer: bool,
    ) -> AccessPath {
        let stats = &self.stats.tables[table];
        let qt = self.query.table(table);
        let prefix_tables: TableSet = prefix.iter().map(|p| p.table).collect();
        let available = prefix_tables | self.stats.const_map;

        let mut best: Option<AccessPath> = None;
        let mut best_parts = 0;
        let mut found_constraint = false;

        for (index, uses) in self.keyuses.index_groups(table) {
            if index == HASH_INDEX {
                continue;
            }
            let Some(key) = qt.keys.get(index) else {
                continue;
            };
            if key.fulltext {
                if let Some(k) = uses
                    .iter()
                    .find(|k| k.is_fulltext() && k.used_tables.is_subset_of(available))
                {
                    found_constraint = true;
                    let records = (stats.records * FULLTEXT_FANOUT).max(MIN_ROWS);
                    let path = AccessPath {
                        kind: AccessKind::FullText,
                        key: Some(KeyRef {
                            index,
                            parts: vec![k.clone()],
                        }),
                        records,
                        read_cost: record_count * (KEY_LOOKUP_COST + records * ROW_LOOKUP_COST),
                        depends: k.used_tables,
                        use_join_buffer: false,
                        loose_prefix: 0,
                    };
                    // Full-text access always wins once available
                    if !matches!(&best, Some(b) if b.kind == AccessKind::FullText) {
                        best = Some(path);
                        best_parts = 1;
                    }
                }
                continue;
            }
            if matches!(&best, Some(b) if b.kind == AccessKind::FullText) {
                continue;
            }

            let mut parts: Vec<KeyUse> = Vec::new();
            let mut ref_or_null = false;
            let mut depends = TableSet::EMPTY;
            for part in 0..key.key_parts() {
                let usable = |k: &&KeyUse| k.keypart == part && k.used_tables.is_subset_of(available);
                let plain = uses
                    .iter()
                    .filter(usable)
                    .find(|k| k.optimize == KeyOptimize::Plain);
                let pick = plain.or_else(|| {
                    if ref_or_null {
                        None
                    } else {
                        uses.iter()
                            .filter(usable)
                            .find(|k| k.optimize == KeyOptimize::RefOrNull)
                    }
                });
                let Some(k) = pick else {
                    break;
                };
                ref_or_null |= k.optimize == KeyOptimize::RefOrNull;
                depends |= k.used_tables;
                parts.push(k.clone());
            }
            if parts.is_empty() {
                continue;
            }
            found_constraint = true;
            let prefix_len = parts.len();

            let (kind, records, lookup_cost) =
                if prefix_len == key.key_parts() && key.unique && !ref_or_null {
                    let reads = prev_record_reads(prefix, depends);
                    (AccessKind::EqRef, 1.0, reads * (KEY_LOOKUP_COST + ROW_LOOKUP_COST))
                } else {
                    let mut records = qt
                        .source
                        .rows_per_key(index, prefix_len)
                        .unwrap_or(stats.records * REF_FANOUT);
                    if let Some(range) = &stats.range {
                        if range.index == index
                            && depends.is_subset_of(self.stats.const_map)
                            && range.eq_parts == prefix_len
                            && range.key_parts == prefix_len
                        {
                            records = range.rows;
                        }
                    }
                    if ref_or_null {
                        records *= 2.0;
                    }
                    let records = records.max(MIN_ROWS);
                    let seeks = records
                        .min(stats.worst_seeks)
                        .min(self.config.max_seeks_for_key);
                    let kind = if ref_or_null {
                        AccessKind::RefOrNull
                    } else {
                        AccessKind::Ref
                    };
                    (kind, records, record_count * (KEY_LOOKUP_COST + seeks * ROW_LOOKUP_COST))
                };

            let path = AccessPath {
                kind,
                key: Some(KeyRef { index, parts }),
                records,
                read_cost: lookup_cost,
                depends,
                use_join_buffer: false,
                loose_prefix: 0,
            };
            let better = match &best {
                None => true,
                Some(b) => path.total_cost(record_count) < b.total_cost(record_count),
            };
            if better {
                best = Some(path);
                best_parts = prefix_len;
            }
        }

        let ref_found = best.is_some();
        if best.is_none() && allow_buffer && self.config.hashed_buffers_allowed() {
            best = self.hash_access(table, available, record_count, prefix);
        }

        if matches!(&best, Some(b) if b.kind == AccessKind::FullText) {
            return self.finish(best, table, record_count);
        }

        // A lookup reading fewer rows than the best range and costing no
        // more than it leaves no reason to scan
        if let Some(b) = best.as_ref().filter(|_| ref_found) {
            if b.records < stats.found_records && b.total_cost(record_count) <= stats.read_time {
                return self.finish(best, table, record_count);
            }
            let same_index = stats.range.as_ref().is_some_and(|r| {
                b.key.as_ref().is_some_and(|k| k.index == r.index) && best_parts >= r.key_parts
            });
            if same_index {
                return self.finish(best, table, record_count);
            }
        }

        let mut rnd_records = stats.found_records;
        if found_constraint && rnd_records > 2.0 {
            rnd_records *= SCAN_FILTER_FACTOR;
        }
        let rnd_records = rnd_records.max(MIN_ROWS.min(stats.records));
        let use_range = stats.range.is_some() && stats.found_records < stats.records;
        let (kind, base) = if use_range {
            (AccessKind::Range, stats.read_time)
        } else {
            (AccessKind::Scan, stats.scan_cost)
        };
        let (read_cost, use_join_buffer) = if allow_buffer {
            let refills = buffer_refills(
                record_count,
                self.prefix_width(prefix),
                self.config.buffer_size(),
            );
            (base * refills, true)
        } else {
            (record_count * base, false)
        };
        let scan = AccessPath {
            kind,
            key: None,
            records: rnd_records,
            read_cost,
            depends: TableSet::EMPTY,
            use_join_buffer,
            loose_prefix: 0,
        };
        let better = match &best {
            None => true,
            Some(b) => scan.total_cost(record_count) < b.total_cost(record_count),
        };
        if better {
            best = Some(scan);
        }
        self.finish(best, table, record_count)
    }

    /// Apply the loose-scan alternative and fall back to a full scan
    fn finish(&self, best: Option<AccessPath>, table: TableId, record_count: f64) -> AccessPath {
        let stats = &self.stats.tables[table];
        let mut best = best.unwrap_or_else(|| AccessPath {
            kind: AccessKind::Scan,
            key: None,
            records: stats.found_records,
            read_cost: record_count * stats.scan_cost,
            depends: TableSet::EMPTY,
            use_join_buffer: false,
            loose_prefix: 0,
        });
        if let Some(loose) = self.loose_scan(table, record_count) {
            if loose.total_cost(record_count) < best.total_cost(record_count) {
                best = loose;
            }
        }
        best
    }

    /// Hash probe on equalities with columns of earlier tables
    fn hash_access(
        &self,
        table: TableId,
        available: TableSet,
        record_count: f64,
        prefix: &[Position],
    ) -> Option<AccessPath> {
        let stats = &self.stats.tables[table];
        let parts: Vec<KeyUse> = self
            .keyuses
            .for_table(table)
            .iter()
            .filter(|k| {
                k.is_hash()
                    && k.optimize == KeyOptimize::Plain
                    && k.used_tables.is_subset_of(available)
                    && !k.used_tables.is_subset_of(self.stats.const_map)
            })
            .cloned()
            .collect();
        if parts.is_empty() {
            return None;
        }
        let depends = parts
            .iter()
            .fold(TableSet::EMPTY, |acc, k| acc | k.used_tables);
        let refills = buffer_refills(record_count, self.prefix_width(prefix), self.config.buffer_size());
        let records = (stats.found_records * HASH_FANOUT).max(MIN_ROWS);
        Some(AccessPath {
            kind: AccessKind::Hash,
            key: Some(KeyRef {
                index: HASH_INDEX,
                parts,
            }),
            records,
            read_cost: stats.read_time * refills + stats.found_records * ROW_EVALUATE_COST,
            depends,
            use_join_buffer: true,
            loose_prefix: 0,
        })
    }

    /// Loose index scan for a single-table block whose select list reads
    /// only GROUP BY columns that form an index prefix. Conditions on the
    /// table may read only grouping columns: the scan keeps the first row
    /// of each group, which must qualify exactly when the whole group does.
    fn loose_scan(&self, table: TableId, record_count: f64) -> Option<AccessPath> {
        let query = self.query;
        if !query.selects_only_groups()
            || query.having.is_some()
            || self.stats.free_tables() != TableSet::single(table)
        {
            return None;
        }
        let mut group_cols: Vec<usize> = Vec::new();
        for c in &query.group_by {
            if c.table != table {
                return None;
            }
            if !group_cols.contains(&c.column) {
                group_cols.push(c.column);
            }
        }
        let conditions = query
            .conjuncts()
            .into_iter()
            .map(|c| c.expr)
            .chain(query.nests.iter().filter_map(|n| n.on_expr.clone()));
        for cond in conditions {
            let mut other_column = false;
            cond.for_each_column(&mut |c| {
                other_column |= c.table == table && !group_cols.contains(&c.column);
            });
            if other_column {
                return None;
            }
        }
        let stats = &self.stats.tables[table];
        let qt = query.table(table);
        let (index, _) = qt.keys.iter().enumerate().find(|(_, k)| {
            !k.fulltext
                && k.parts.len() >= group_cols.len()
                && k.parts[..group_cols.len()]
                    .iter()
                    .all(|p| group_cols.contains(p))
        })?;
        let prefix_len = group_cols.len();
        let per_group = qt.source.rows_per_key(index, prefix_len)?;
        let groups = (stats.records / per_group.max(MIN_ROWS)).max(MIN_ROWS);
        Some(AccessPath {
            kind: AccessKind::LooseIndexScan,
            key: Some(KeyRef {
                index,
                parts: Vec::new(),
            }),
            records: groups,
            read_cost: record_count * (stats.scan_cost + groups * KEY_LOOKUP_COST * ROW_EVALUATE_COST),
            depends: TableSet::EMPTY,
            use_join_buffer: false,
            loose_prefix: prefix_len,
        })
    }

    /// Bytes a join buffer stores per prefix row
    pub fn prefix_width(&self, prefix: &[Position]) -> usize {
        prefix
            .iter()
            .filter(|p| !self.stats.const_map.contains(p.table))
            .map(|p| self.query.table(p.table).row_width)
            .sum()
    }
}
