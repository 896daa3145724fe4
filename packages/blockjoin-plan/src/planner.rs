//! Join-order enumeration with per-prefix semi-join strategy state.
//!
//! Every step of the enumeration carries the four strategies' tracking
//! fields forward in a `Position` value. A strategy is picked as soon as
//! the prefix covers everything it needs and it is strictly cheaper
//! than the current candidate, or some duplicate-producing tables are
//! not yet covered by any strategy. After the full order is chosen, a
//! right-to-left pass translates the backward-looking records into
//! forward ranges the executor reads left to right.

use std::collections::HashMap;

use blockjoin_core::storage::Handler;
use blockjoin_core::SemiJoinStrategy;

use crate::bitmap::{TableMap, MAX_TABLES};
use crate::config::{OptimizerSwitch, PlannerConfig};
use crate::cost::CostModel;
use crate::error::PlanError;
use crate::expr::Expr;
use crate::query::{Catalog, NodeId, QueryBlock};

/// Access method chosen for one position.
#[derive(Debug, Clone)]
pub enum PlanAccess {
    Scan,
    /// Index lookup with every key column bound by the prefix
    Ref {
        index_no: usize,
        /// (own column, outer column) per key part
        key_cols: Vec<(usize, (usize, usize))>,
    },
    /// Ordered index scan returning one row per distinct key prefix
    LooseScan {
        index_no: usize,
        parts: usize,
        key_len: usize,
    },
}

/// LooseScan candidate produced by the access-path search.
#[derive(Debug, Clone)]
pub struct LooseScanPos {
    pub read_time: f64,
    pub records_read: f64,
    pub index_no: usize,
    pub parts: usize,
    pub key_len: usize,
}

impl LooseScanPos {
    fn none() -> Self {
        Self {
            read_time: f64::MAX,
            records_read: 0.0,
            index_no: 0,
            parts: 0,
            key_len: 0,
        }
    }
}

/// Per-prefix planner state of one join position.
#[derive(Debug, Clone)]
pub struct Position {
    /// Leaf position of the table in the query block
    pub table: usize,
    pub access: PlanAccess,
    pub records_read: f64,
    pub read_time: f64,
    pub prefix_record_count: f64,
    pub prefix_cost: f64,
    pub sj_strategy: SemiJoinStrategy,
    pub n_sj_tables: usize,
    pub use_join_buffer: bool,

    // FirstMatch tracking
    pub first_firstmatch_table: usize,
    pub first_firstmatch_rtbl: TableMap,
    pub firstmatch_need_tables: TableMap,

    // LooseScan tracking
    pub first_loosescan_table: usize,
    pub loosescan_need_tables: TableMap,
    pub loosescan_pick: Option<LooseScanPos>,

    // Materialization-scan tracking
    pub sjm_scan_need_tables: TableMap,
    pub sjm_scan_last_inner: usize,

    // DuplicateWeedout tracking
    pub dupsweedout_tables: TableMap,
    pub first_dupsweedout_table: usize,
}

impl Position {
    fn new(table: usize, access: PlanAccess, records_read: f64, read_time: f64) -> Self {
        Self {
            table,
            access,
            records_read,
            read_time,
            prefix_record_count: 0.0,
            prefix_cost: 0.0,
            sj_strategy: SemiJoinStrategy::None,
            n_sj_tables: 0,
            use_join_buffer: false,
            first_firstmatch_table: MAX_TABLES,
            first_firstmatch_rtbl: TableMap::EMPTY,
            firstmatch_need_tables: TableMap::EMPTY,
            first_loosescan_table: MAX_TABLES,
            loosescan_need_tables: TableMap::EMPTY,
            loosescan_pick: None,
            sjm_scan_need_tables: TableMap::EMPTY,
            sjm_scan_last_inner: 0,
            dupsweedout_tables: TableMap::EMPTY,
            first_dupsweedout_table: 0,
        }
    }
}

/// Materialization estimates of one semi-join nest.
#[derive(Debug, Clone)]
pub struct SjMatInfo {
    pub tables: usize,
    pub rows: f64,
    pub materialization_cost: f64,
    pub lookup_cost: f64,
    pub scan_cost: f64,
    pub is_used: bool,
    pub is_sj_scan: bool,
}

/// The chosen join order with finalized strategy ranges.
#[derive(Debug)]
pub struct Plan {
    pub positions: Vec<Position>,
    pub cost: f64,
    pub rows: f64,
    pub sjm: HashMap<NodeId, SjMatInfo>,
}

/// Chooses the join order, tracking and costing the four semi-join
/// strategies along every enumerated prefix.
pub fn choose_plan(
    query: &QueryBlock,
    catalog: &Catalog,
    cfg: &PlannerConfig,
    cost: &CostModel,
) -> Result<Plan, PlanError> {
    if query.leaves.is_empty() {
        return Err(PlanError::EmptyFromList);
    }
    // Outer-join inner tables depend on every table their ON clause
    // refers to; the enumeration never schedules them earlier.
    let deps: Vec<TableMap> = (0..query.table_count())
        .map(|pos| {
            let mut node = Some(query.leaves[pos]);
            let mut map = TableMap::EMPTY;
            while let Some(id) = node {
                if query.nodes[id].outer_join {
                    if let Some(on) = &query.nodes[id].on_expr {
                        map |= query.map_of(&on.referenced_table_set());
                    }
                }
                node = query.nodes[id].parent;
            }
            map.without(TableMap::bit(pos))
        })
        .collect();
    let mut planner = Planner {
        query,
        catalog,
        cfg,
        cost,
        n: query.table_count(),
        positions: Vec::new(),
        best: None,
        cur_sj_inner_tables: TableMap::EMPTY,
        cur_dups_producing_tables: TableMap::EMPTY,
        sjm: optimize_semijoin_nests(query, catalog, cost),
        equalities: collect_join_equalities(query),
        deps,
    };
    let all = TableMap::prev_bits(planner.n);
    planner.search(0, all, 1.0, 0.0);
    let (cost_total, mut positions, sjm) =
        planner.best.ok_or(PlanError::NoJoinOrder)?;
    let rows = positions
        .last()
        .map(|p| p.prefix_record_count)
        .unwrap_or(1.0);
    fix_semijoin_strategies_for_picked_join_order(query, &mut positions, &sjm);
    assign_join_buffering(cfg, &mut positions);
    tracing::debug!(
        "chose join order of {} tables, cost {:.2}",
        positions.len(),
        cost_total
    );
    Ok(Plan {
        positions,
        cost: cost_total,
        rows,
        sjm,
    })
}

/// Join equalities usable for ref access: (inner column, outer column)
/// with the tag of injected IN-equalities.
#[derive(Debug, Clone)]
struct JoinEquality {
    /// (catalog, column) of one side
    inner: (usize, usize),
    /// (catalog, column) of the other side
    outer: (usize, usize),
    in_equality_no: Option<usize>,
}

fn collect_join_equalities(query: &QueryBlock) -> Vec<JoinEquality> {
    let mut out = Vec::new();
    let mut sources: Vec<&Expr> = Vec::new();
    if let Some(w) = &query.where_clause {
        sources.push(w);
    }
    for node in &query.nodes {
        if let Some(on) = &node.on_expr {
            sources.push(on);
        }
    }
    for source in sources {
        for item in source.conjuncts() {
            if let Expr::Eq {
                left,
                right,
                in_equality_no,
            } = item
            {
                if let (
                    Expr::Column { table: t1, column: c1 },
                    Expr::Column { table: t2, column: c2 },
                ) = (&**left, &**right)
                {
                    out.push(JoinEquality {
                        inner: (*t2, *c2),
                        outer: (*t1, *c1),
                        in_equality_no: *in_equality_no,
                    });
                    out.push(JoinEquality {
                        inner: (*t1, *c1),
                        outer: (*t2, *c2),
                        in_equality_no: *in_equality_no,
                    });
                }
            }
        }
    }
    out
}

/// Precomputes materialization estimates for every semi-join nest.
fn optimize_semijoin_nests(
    query: &QueryBlock,
    catalog: &Catalog,
    cost: &CostModel,
) -> HashMap<NodeId, SjMatInfo> {
    let mut out = HashMap::new();
    for nest in query.sj_nests() {
        let info = query.nest_sj_info(nest).expect("sj nest has info");
        let mut rows = 1.0;
        let mut mat_cost = 0.0;
        for &cat in &info.inner_tables {
            let table_rows = catalog.row_count(cat).max(1.0);
            mat_cost += rows * table_rows * cost.row_read_cost;
            rows *= table_rows;
        }
        out.insert(
            nest,
            SjMatInfo {
                tables: info.inner_tables.len(),
                rows,
                materialization_cost: mat_cost
                    + rows * cost.heap_temptable_lookup_cost,
                lookup_cost: cost.heap_temptable_lookup_cost,
                scan_cost: rows * cost.row_read_cost,
                is_used: false,
                is_sj_scan: false,
            },
        );
    }
    out
}

struct Planner<'a> {
    query: &'a QueryBlock,
    catalog: &'a Catalog,
    cfg: &'a PlannerConfig,
    cost: &'a CostModel,
    n: usize,
    positions: Vec<Position>,
    best: Option<(f64, Vec<Position>, HashMap<NodeId, SjMatInfo>)>,
    cur_sj_inner_tables: TableMap,
    cur_dups_producing_tables: TableMap,
    sjm: HashMap<NodeId, SjMatInfo>,
    equalities: Vec<JoinEquality>,
    deps: Vec<TableMap>,
}

impl Planner<'_> {
    fn search(
        &mut self,
        idx: usize,
        remaining: TableMap,
        record_count: f64,
        read_time: f64,
    ) {
        if remaining.is_empty() {
            // A valid plan leaves no duplicate-producing table without
            // an assigned strategy.
            if self.cur_dups_producing_tables.is_empty()
                && self
                    .best
                    .as_ref()
                    .map(|(c, _, _)| read_time < *c)
                    .unwrap_or(true)
            {
                self.best =
                    Some((read_time, self.positions.clone(), self.sjm.clone()));
            }
            return;
        }
        let candidates: Vec<usize> = remaining.positions().collect();
        for table in candidates {
            // Dependencies of the table must already be in the prefix.
            if self.deps[table].intersects(remaining) {
                continue;
            }
            let (access, records_read, access_time, loose) =
                self.best_access_path(table, remaining);
            let mut pos = Position::new(table, access, records_read, access_time);
            if loose.read_time != f64::MAX {
                pos.loosescan_pick = Some(loose.clone());
            }
            let mut rc = record_count * records_read;
            let mut rt = read_time + access_time;

            let saved_inner = self.cur_sj_inner_tables;
            let saved_dups = self.cur_dups_producing_tables;
            self.positions.push(pos.clone());
            self.advance_sj_state(
                remaining,
                table,
                idx,
                &mut rc,
                &mut rt,
                &loose,
                &mut pos,
            );
            *self.positions.last_mut().expect("position pushed") = pos;

            self.search(idx + 1, remaining.without(TableMap::bit(table)), rc, rt);

            // Backtracking is free: drop the tail and restore the two
            // join-level masks.
            self.positions.pop();
            self.cur_sj_inner_tables = saved_inner;
            self.cur_dups_producing_tables = saved_dups;
        }
    }

    /// Best access for the table given the prefix: a bound-index ref
    /// when available, else a scan. A LooseScan candidate is produced
    /// separately.
    fn best_access_path(
        &self,
        table: usize,
        remaining: TableMap,
    ) -> (PlanAccess, f64, f64, LooseScanPos) {
        let prefix = TableMap::prev_bits(self.n)
            .without(remaining);
        let cat = self.query.leaf_catalog(table);
        let store = self.catalog.store(cat);
        let store = store.borrow();
        let rows = (store.row_count() as f64).max(1.0);

        let mut best: Option<(PlanAccess, f64, f64)> = None;
        for index_no in 0..store.index_count() {
            let def = store.index_def(index_no);
            let mut key_cols = Vec::new();
            let mut all_bound = true;
            for &col in &def.columns {
                let bound = self.equalities.iter().find(|e| {
                    e.inner == (cat, col)
                        && self
                            .query
                            .leaf_position(e.outer.0)
                            .map(|p| prefix.contains(p))
                            .unwrap_or(false)
                });
                match bound {
                    Some(e) => key_cols.push((col, e.outer)),
                    None => {
                        all_bound = false;
                        break;
                    }
                }
            }
            if !all_bound {
                continue;
            }
            let records = store.rec_per_key(index_no);
            let time = records * self.cost.key_lookup_cost;
            if best.as_ref().map(|(_, _, t)| time < *t).unwrap_or(true) {
                best = Some((
                    PlanAccess::Ref { index_no, key_cols },
                    records,
                    time,
                ));
            }
        }

        let scan_records = {
            // An equality against the prefix filters the scan.
            let filtered = self.equalities.iter().any(|e| {
                e.inner.0 == cat
                    && self
                        .query
                        .leaf_position(e.outer.0)
                        .map(|p| prefix.contains(p))
                        .unwrap_or(false)
            });
            if filtered {
                (rows * self.cost.default_eq_selectivity).max(1.0)
            } else {
                rows
            }
        };
        let scan_time = rows * self.cost.row_read_cost;
        let (access, records_read, access_time) = match best {
            Some((access, records, time)) if time < scan_time => {
                (access, records, time)
            }
            _ => (PlanAccess::Scan, scan_records, scan_time),
        };

        let loose = self.loose_scan_access(table, remaining, &store, rows);
        (access, records_read, access_time, loose)
    }

    /// LooseScan candidate: a key whose leading parts expose the bound
    /// IN-equalities so one representative row per distinct prefix is
    /// enough.
    fn loose_scan_access(
        &self,
        table: usize,
        remaining: TableMap,
        store: &std::cell::Ref<'_, blockjoin_core::storage::MemTable>,
        rows: f64,
    ) -> LooseScanPos {
        if !self
            .cfg
            .optimizer_switch
            .contains(OptimizerSwitch::LOOSESCAN)
        {
            return LooseScanPos::none();
        }
        let nest = match self.query.emb_sj_nest(table) {
            Some(nest) => nest,
            None => return LooseScanPos::none(),
        };
        let info = match self.query.nest_sj_info(nest) {
            Some(info) => info,
            None => return LooseScanPos::none(),
        };
        let prefix = TableMap::prev_bits(self.n).without(remaining);
        let cat = self.query.leaf_catalog(table);

        for index_no in 0..store.index_count() {
            let def = store.index_def(index_no);
            // Bound equalities can be evaluated against the prefix;
            // handled ones are exposed by the leading keyparts.
            let mut bound_sj_equalities = 0u64;
            let mut handled_sj_equalities = 0u64;
            let mut loose_scan_keyparts = 0usize;
            for eq in &self.equalities {
                let no = match eq.in_equality_no {
                    Some(no) => no,
                    None => continue,
                };
                if eq.inner.0 != cat {
                    continue;
                }
                if self
                    .query
                    .leaf_position(eq.outer.0)
                    .map(|p| prefix.contains(p))
                    .unwrap_or(false)
                {
                    bound_sj_equalities |= 1 << no;
                }
                if let Some(part) =
                    def.columns.iter().position(|&c| c == eq.inner.1)
                {
                    handled_sj_equalities |= 1 << no;
                    loose_scan_keyparts = loose_scan_keyparts.max(part + 1);
                }
            }
            let all = if info.sj_in_exprs >= 64 {
                u64::MAX
            } else {
                (1u64 << info.sj_in_exprs) - 1
            };
            if bound_sj_equalities | handled_sj_equalities != all
                || loose_scan_keyparts == 0
            {
                continue;
            }
            // The distinct-prefix scan reads the whole index once.
            let distinct = (rows / store.rec_per_key(index_no)).max(1.0);
            let key = store.index_key(index_no);
            let key_len: usize = key.parts[..loose_scan_keyparts]
                .iter()
                .map(|p| p.store_length())
                .sum();
            return LooseScanPos {
                read_time: rows * self.cost.row_read_cost,
                records_read: distinct,
                index_no,
                parts: loose_scan_keyparts,
                key_len,
            };
        }
        LooseScanPos::none()
    }

    /// Recomputes cost and fanout for the positions in
    /// `[first_tab..=last_tab]` assuming no join buffering across the
    /// range; `first_alt` substitutes the LooseScan candidate for the
    /// first position.
    fn optimize_wo_join_buffering(
        &self,
        first_tab: usize,
        last_tab: usize,
        first_alt: bool,
        record_count: &mut f64,
        read_time: &mut f64,
    ) {
        let (mut rc, mut rt) = if first_tab == 0 {
            (1.0, 0.0)
        } else {
            (
                self.positions[first_tab - 1].prefix_record_count,
                self.positions[first_tab - 1].prefix_cost,
            )
        };
        for i in first_tab..=last_tab {
            let p = &self.positions[i];
            if first_alt && i == first_tab {
                let loose = p.loosescan_pick.as_ref().expect("LooseScan pick");
                rt += loose.read_time;
                rc *= loose.records_read;
            } else {
                rt += p.read_time;
                rc *= p.records_read;
            }
        }
        *record_count = rc;
        *read_time = rt;
    }

    /// The port of the per-step strategy tracking: carries the four
    /// strategies' state forward, detects completed ranges and picks
    /// the cheapest covering strategy.
    #[allow(clippy::too_many_arguments)]
    fn advance_sj_state(
        &mut self,
        remaining_tables: TableMap,
        table: usize,
        idx: usize,
        current_record_count: &mut f64,
        current_read_time: &mut f64,
        loose_scan_pos: &LooseScanPos,
        pos: &mut Position,
    ) {
        let remaining = remaining_tables.without(TableMap::bit(table));
        let emb_sj_nest = self.query.emb_sj_nest(table);

        pos.prefix_cost = *current_read_time;
        pos.prefix_record_count = *current_record_count;
        pos.sj_strategy = SemiJoinStrategy::None;

        // Initialize the state or carry it over from the previous
        // position; a consumed strategy resets its own tracking.
        if idx == 0 {
            pos.first_firstmatch_table = MAX_TABLES;
            pos.first_loosescan_table = MAX_TABLES;
            pos.dupsweedout_tables = TableMap::EMPTY;
            pos.sjm_scan_need_tables = TableMap::EMPTY;
        } else {
            let prev = &self.positions[idx - 1];
            pos.first_firstmatch_table =
                if prev.sj_strategy == SemiJoinStrategy::FirstMatch {
                    MAX_TABLES
                } else {
                    prev.first_firstmatch_table
                };
            pos.first_firstmatch_rtbl = prev.first_firstmatch_rtbl;
            pos.firstmatch_need_tables = prev.firstmatch_need_tables;

            pos.first_loosescan_table =
                if prev.sj_strategy == SemiJoinStrategy::LooseScan {
                    MAX_TABLES
                } else {
                    prev.first_loosescan_table
                };
            pos.loosescan_need_tables = prev.loosescan_need_tables;

            pos.sjm_scan_need_tables =
                if prev.sj_strategy == SemiJoinStrategy::MaterializeScan {
                    TableMap::EMPTY
                } else {
                    prev.sjm_scan_need_tables
                };
            pos.sjm_scan_last_inner = prev.sjm_scan_last_inner;

            pos.dupsweedout_tables = prev.dupsweedout_tables;
            pos.first_dupsweedout_table = prev.first_dupsweedout_table;
        }

        let mut handled_by_fm_or_ls = TableMap::EMPTY;

        // FirstMatch
        if let Some(nest) = emb_sj_nest {
            if self
                .cfg
                .optimizer_switch
                .contains(OptimizerSwitch::FIRSTMATCH)
            {
                let outer_corr_tables =
                    self.query.sj_corr_map(nest) | self.query.sj_depends_map(nest);
                let sj_inner_tables = self.query.sj_inner_map(nest);
                // Start tracking when no duplicate range is open, all
                // correlated outers are in the prefix and all inners
                // are still ahead.
                if self.cur_sj_inner_tables.is_empty()
                    && !remaining.intersects(outer_corr_tables)
                    && (remaining | TableMap::bit(table))
                        .contains_all(sj_inner_tables)
                {
                    pos.first_firstmatch_table = idx;
                    pos.firstmatch_need_tables = sj_inner_tables;
                    pos.first_firstmatch_rtbl = remaining;
                }
                if pos.first_firstmatch_table != MAX_TABLES {
                    if outer_corr_tables.intersects(pos.first_firstmatch_rtbl) {
                        // A correlated outer table showed up inside the
                        // range: FirstMatch cannot be used.
                        pos.first_firstmatch_table = MAX_TABLES;
                    } else {
                        pos.firstmatch_need_tables |= sj_inner_tables;
                    }
                    if pos.first_firstmatch_table != MAX_TABLES
                        && !remaining.intersects(pos.firstmatch_need_tables)
                    {
                        self.optimize_wo_join_buffering(
                            pos.first_firstmatch_table,
                            idx,
                            false,
                            current_record_count,
                            current_read_time,
                        );
                        pos.sj_strategy = SemiJoinStrategy::FirstMatch;
                        handled_by_fm_or_ls = pos.firstmatch_need_tables;
                    }
                }
            }
        }

        // LooseScan
        {
            if pos.first_loosescan_table != MAX_TABLES {
                let first_nest = self
                    .query
                    .emb_sj_nest(self.positions[pos.first_loosescan_table].table);
                let interleaves = first_nest
                    .map(|n| self.query.sj_inner_map(n).intersects(remaining))
                    .unwrap_or(false);
                if interleaves && emb_sj_nest != first_nest {
                    pos.first_loosescan_table = MAX_TABLES;
                }
            }
            if loose_scan_pos.read_time != f64::MAX {
                if let Some(nest) = emb_sj_nest {
                    pos.first_loosescan_table = idx;
                    pos.loosescan_need_tables = self.query.sj_inner_map(nest)
                        | self.query.sj_depends_map(nest)
                        | self.query.sj_corr_map(nest);
                    pos.loosescan_pick = Some(loose_scan_pos.clone());
                }
            }
            if pos.first_loosescan_table != MAX_TABLES
                && !remaining.intersects(pos.loosescan_need_tables)
            {
                let first = pos.first_loosescan_table;
                let nest_inner = self
                    .query
                    .emb_sj_nest(self.positions[first].table)
                    .map(|n| self.query.sj_inner_map(n))
                    .unwrap_or(TableMap::EMPTY);
                self.optimize_wo_join_buffering(
                    first,
                    idx,
                    true,
                    current_record_count,
                    current_read_time,
                );
                pos.sj_strategy = SemiJoinStrategy::LooseScan;
                handled_by_fm_or_ls = nest_inner;
            }
        }

        // Maintain the join-level masks used by the pickers above.
        if let Some(nest) = emb_sj_nest {
            let inner = self.query.sj_inner_map(nest);
            self.cur_sj_inner_tables |= inner;
            self.cur_dups_producing_tables |= inner;
            if !remaining.intersects(inner.without(TableMap::bit(table))) {
                self.cur_sj_inner_tables =
                    self.cur_sj_inner_tables.without(inner);
            }
        }
        self.cur_dups_producing_tables =
            self.cur_dups_producing_tables.without(handled_by_fm_or_ls);

        // Materialization: lookup at the nest's last inner table,
        // scan with deferred finalization.
        if self
            .cfg
            .optimizer_switch
            .contains(OptimizerSwitch::MATERIALIZATION)
        {
            if let Some((nest, sjm_scan)) = self.at_sjmat_pos(table, idx, remaining)
            {
                let mat = self.sjm.get(&nest).cloned();
                if let Some(mat) = mat {
                    if sjm_scan {
                        pos.sjm_scan_need_tables = self.query.sj_inner_map(nest)
                            | self.query.sj_depends_map(nest)
                            | self.query.sj_corr_map(nest);
                        pos.sjm_scan_last_inner = idx;
                    } else {
                        let first_tab = idx + 1 - mat.tables;
                        let (prefix_cost, prefix_rec_count) = if first_tab == 0 {
                            (0.0, 1.0)
                        } else {
                            (
                                self.positions[first_tab - 1].prefix_cost,
                                self.positions[first_tab - 1].prefix_record_count,
                            )
                        };
                        let mat_read_time = prefix_cost
                            + mat.materialization_cost
                            + prefix_rec_count * mat.lookup_cost;
                        if mat_read_time < *current_read_time
                            || !self.cur_dups_producing_tables.is_empty()
                        {
                            pos.sj_strategy = SemiJoinStrategy::Materialize;
                            *current_read_time = mat_read_time;
                            *current_record_count = prefix_rec_count;
                            self.cur_dups_producing_tables = self
                                .cur_dups_producing_tables
                                .without(self.query.sj_inner_map(nest));
                        }
                    }
                }
            }

            // Materialization-scan second phase: the first table past
            // the nest completes the range.
            if !pos.sjm_scan_need_tables.is_empty()
                && !remaining.intersects(pos.sjm_scan_need_tables)
            {
                let last_inner = pos.sjm_scan_last_inner;
                let nest = self
                    .query
                    .emb_sj_nest(self.positions[last_inner].table)
                    .expect("scan range tracks a nest");
                if let Some(mat) = self.sjm.get(&nest).cloned() {
                    let first_tab = last_inner + 1 - mat.tables;
                    let (mut prefix_cost, mut prefix_rec_count) = if first_tab == 0
                    {
                        (0.0, 1.0)
                    } else {
                        (
                            self.positions[first_tab - 1].prefix_cost,
                            self.positions[first_tab - 1].prefix_record_count,
                        )
                    };
                    prefix_cost += mat.materialization_cost
                        + prefix_rec_count * mat.scan_cost;
                    prefix_rec_count *= mat.rows;
                    // Re-run the tail accesses under the new fanout.
                    for i in (last_inner + 1)..=idx {
                        let p = &self.positions[i];
                        prefix_cost += p.read_time;
                        prefix_rec_count *= p.records_read;
                    }
                    if prefix_cost < *current_read_time
                        || !self.cur_dups_producing_tables.is_empty()
                    {
                        pos.sj_strategy = SemiJoinStrategy::MaterializeScan;
                        *current_read_time = prefix_cost;
                        *current_record_count = prefix_rec_count;
                        self.cur_dups_producing_tables = self
                            .cur_dups_producing_tables
                            .without(self.query.sj_inner_map(nest));
                    }
                }
            }
        }

        // DuplicateWeedout: always tracked as the fallback.
        if self
            .cfg
            .optimizer_switch
            .contains(OptimizerSwitch::DUPSWEEDOUT)
        {
            if let Some(nest) = emb_sj_nest {
                if pos.dupsweedout_tables.is_empty() {
                    pos.first_dupsweedout_table = idx;
                }
                pos.dupsweedout_tables |= self.query.sj_inner_map(nest)
                    | self.query.sj_depends_map(nest)
                    | self.query.sj_corr_map(nest);
            }
            if !pos.dupsweedout_tables.is_empty()
                && !remaining.intersects(
                    pos.dupsweedout_tables.without(TableMap::bit(table)),
                )
            {
                let first_tab = pos.first_dupsweedout_table;
                let (mut dups_cost, prefix_rec_count, mut temptable_rec_size) =
                    if first_tab == 0 {
                        (0.0, 1.0, 0usize)
                    } else {
                        (
                            self.positions[first_tab - 1].prefix_cost,
                            self.positions[first_tab - 1].prefix_record_count,
                            8usize,
                        )
                    };
                let mut sj_inner_fanout = 1.0;
                let mut sj_outer_fanout = 1.0;
                let mut dups_removed_fanout = TableMap::EMPTY;
                for j in first_tab..=idx {
                    let p = &self.positions[j];
                    dups_cost += p.read_time;
                    if self.query.emb_sj_nest(p.table).is_some() {
                        sj_inner_fanout *= p.records_read;
                        dups_removed_fanout |= TableMap::bit(p.table);
                    } else {
                        sj_outer_fanout *= p.records_read;
                        temptable_rec_size += 8; // one rowid per outer table
                    }
                }
                let one_lookup_cost = self
                    .cost
                    .temptable_lookup_cost(sj_outer_fanout, temptable_rec_size);
                let write_cost = prefix_rec_count * sj_outer_fanout * one_lookup_cost;
                let full_lookup_cost = prefix_rec_count
                    * sj_outer_fanout
                    * sj_inner_fanout
                    * one_lookup_cost;
                let dups_cost = dups_cost + write_cost + full_lookup_cost;
                // Pick if strictly cheaper, or if no other strategy has
                // covered the still-duplicate-producing tables yet.
                if dups_cost < *current_read_time
                    || !self.cur_dups_producing_tables.is_empty()
                {
                    pos.sj_strategy = SemiJoinStrategy::DupsWeedout;
                    *current_read_time = dups_cost;
                    *current_record_count = prefix_rec_count * sj_outer_fanout;
                    self.cur_dups_producing_tables = self
                        .cur_dups_producing_tables
                        .without(dups_removed_fanout);
                }
            }
        }

        pos.prefix_cost = *current_read_time;
        pos.prefix_record_count = *current_record_count;
    }

    /// Detects that `table` is the last inner of a materializable nest
    /// whose inner tables sit adjacent at the prefix tail. Returns the
    /// nest and whether only the scan variant applies (some correlated
    /// outers are still ahead).
    fn at_sjmat_pos(
        &self,
        table: usize,
        idx: usize,
        remaining: TableMap,
    ) -> Option<(NodeId, bool)> {
        let nest = self.query.emb_sj_nest(table)?;
        // Materialization applies to uncorrelated nests only.
        if !self.query.sj_corr_map(nest).is_empty() {
            return None;
        }
        let inner = self.query.sj_inner_map(nest);
        if remaining.intersects(inner) {
            return None;
        }
        let tables = inner.count();
        if idx + 1 < tables {
            return None;
        }
        // The inner tables must be the last `tables` positions.
        for i in (idx + 1 - tables)..=idx {
            let p = self.positions[i].table;
            if !inner.contains(p) {
                return None;
            }
        }
        let outer_corr =
            self.query.sj_corr_map(nest) | self.query.sj_depends_map(nest);
        let sjm_scan = remaining.intersects(outer_corr.without(inner));
        Some((nest, sjm_scan))
    }
}

/// Translates the backward-looking per-position strategy records of the
/// chosen order into forward ranges the executor reads left to right.
pub fn fix_semijoin_strategies_for_picked_join_order(
    query: &QueryBlock,
    positions: &mut [Position],
    sjm: &HashMap<NodeId, SjMatInfo>,
) {
    let table_count = positions.len();
    let mut handled_tabs = TableMap::EMPTY;
    for tablenr in (0..table_count).rev() {
        let pos = positions[tablenr].clone();
        if handled_tabs.contains(pos.table)
            || pos.sj_strategy == SemiJoinStrategy::None
        {
            continue;
        }
        let first;
        match pos.sj_strategy {
            SemiJoinStrategy::Materialize => {
                let nest = query
                    .emb_sj_nest(pos.table)
                    .expect("materialized table is in a nest");
                let tables = sjm.get(&nest).map(|m| m.tables).unwrap_or(1);
                first = tablenr + 1 - tables;
                positions[first].sj_strategy = SemiJoinStrategy::Materialize;
                positions[first].n_sj_tables = tables;
            }
            SemiJoinStrategy::MaterializeScan => {
                let last_inner = pos.sjm_scan_last_inner;
                let nest = query
                    .emb_sj_nest(positions[last_inner].table)
                    .expect("scan range tracks a nest");
                let tables = sjm.get(&nest).map(|m| m.tables).unwrap_or(1);
                first = last_inner + 1 - tables;
                positions[first].sj_strategy = SemiJoinStrategy::MaterializeScan;
                positions[first].n_sj_tables = tables;
                // The tail past the nest runs without join buffering.
                for p in positions[(last_inner + 1)..=tablenr].iter_mut() {
                    p.use_join_buffer = false;
                }
            }
            SemiJoinStrategy::FirstMatch => {
                first = pos.first_firstmatch_table;
                positions[first].sj_strategy = SemiJoinStrategy::FirstMatch;
                positions[first].n_sj_tables = tablenr - first + 1;
                for p in positions[first..=tablenr].iter_mut() {
                    p.use_join_buffer = false;
                }
            }
            SemiJoinStrategy::LooseScan => {
                first = pos.first_loosescan_table;
                let loose = positions[first]
                    .loosescan_pick
                    .clone()
                    .expect("LooseScan pick recorded");
                positions[first].sj_strategy = SemiJoinStrategy::LooseScan;
                positions[first].access = PlanAccess::LooseScan {
                    index_no: loose.index_no,
                    parts: loose.parts,
                    key_len: loose.key_len,
                };
                positions[first].records_read = loose.records_read;
                positions[first].read_time = loose.read_time;
                let nest_inner = query
                    .emb_sj_nest(positions[first].table)
                    .map(|n| query.sj_inner_map(n))
                    .unwrap_or(TableMap::EMPTY);
                positions[first].n_sj_tables = nest_inner.count();
                for p in positions[first..=tablenr].iter_mut() {
                    p.use_join_buffer = false;
                }
            }
            SemiJoinStrategy::DupsWeedout => {
                first = pos.first_dupsweedout_table;
                positions[first].sj_strategy = SemiJoinStrategy::DupsWeedout;
                positions[first].n_sj_tables = tablenr - first + 1;
            }
            SemiJoinStrategy::None => unreachable!(),
        }
        let n = positions[first].n_sj_tables;
        for (i, p) in positions[first..first + n].iter_mut().enumerate() {
            if i != 0 {
                p.sj_strategy = SemiJoinStrategy::None;
            }
            handled_tabs |= TableMap::bit(p.table);
        }
        if tablenr != first {
            positions[tablenr].sj_strategy = SemiJoinStrategy::None;
        }
    }
}

/// Assigns join buffering to positions where the access method allows
/// it and no strategy range forbids it.
fn assign_join_buffering(cfg: &PlannerConfig, positions: &mut [Position]) {
    if cfg.join_cache_level == 0 {
        return;
    }
    let mut no_buffer_until = 0;
    for i in 0..positions.len() {
        match positions[i].sj_strategy {
            SemiJoinStrategy::FirstMatch | SemiJoinStrategy::LooseScan => {
                no_buffer_until = no_buffer_until.max(i + positions[i].n_sj_tables);
            }
            _ => {}
        }
        if i == 0 || i < no_buffer_until {
            positions[i].use_join_buffer = false;
            continue;
        }
        positions[i].use_join_buffer = match positions[i].access {
            PlanAccess::Scan => true,
            PlanAccess::Ref { .. } => {
                cfg.optimizer_switch.contains(OptimizerSwitch::JOIN_CACHE_BKA)
                    && cfg.join_cache_level >= 5
            }
            PlanAccess::LooseScan { .. } => false,
        };
    }
}
