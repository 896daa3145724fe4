//! Join executor.
//!
//! `Join` owns the table contexts, the chain of join buffers and the
//! per-table settings produced by the planner. Execution is a
//! single-threaded nested loop: tables without a buffer are driven row
//! by row; tables with one are driven by the coordinator, which fills
//! the buffer from the prefix, matches it against the right-hand table
//! and emits null complements for unmatched driving records.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::cache::buffer::{
    read_record_chain, AppendResult, BufferParams, JoinBuffer,
};
use crate::cache::hashed::HashConfig;
use crate::cache::layout::{BufferTable, Layout};
use crate::cache::MatchFlag;
use crate::config::ExecConfig;
use crate::error::JoinError;
use crate::keys::{KeyDef, Rows, RowsMut};
use crate::row::RowImage;
use crate::scan::{DrivingRows, RightScanState, RowAccessAll, ScanCtx, ScanTabInfo};
use crate::schema::TableSchema;
use crate::semijoin::{Materialization, WeedoutTable};
use crate::storage::{Handler, MemTable, WriteOutcome};
use crate::value::Value;

/// Pushdown predicate over the current rows.
pub type CondFn = Rc<dyn Fn(&dyn Rows) -> bool>;

/// Buffered join algorithm of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAlg {
    /// Block nested loops, full scan of the right table
    Bnl,
    /// Block nested loops with an in-buffer hash index
    Bnlh,
    /// Batched key access through the multi-range read interface
    Bka,
    /// Batched key access with hashed (distinct) keys
    Bkah,
}

impl JoinAlg {
    pub fn is_key_access(&self) -> bool {
        matches!(self, JoinAlg::Bka | JoinAlg::Bkah)
    }
}

/// Access method of one table in the join order.
#[derive(Clone)]
pub enum Access {
    /// Sequential scan
    Scan,
    /// Equality lookup on an index, key built from earlier tables
    Ref { index_no: usize, key: Rc<KeyDef> },
    /// Ordered full index scan (LooseScan)
    IndexScan { index_no: usize },
}

/// LooseScan control: length of the distinct key prefix in index-image
/// bytes.
#[derive(Debug, Clone, Copy)]
pub struct LooseScanCtl {
    pub key_len: usize,
}

/// Per-table execution settings.
#[derive(Clone)]
pub struct JoinTab {
    /// Index into the executor's table list
    pub table: usize,
    pub access: Access,
    /// Buffered algorithm; `None` drives the table row by row
    pub join_alg: Option<JoinAlg>,
    /// Hash keys for the hashed algorithms
    pub hash: Option<HashConfig>,
    /// ON-clause conjuncts; suppressed while null-complementing
    pub on_cond: Option<CondFn>,
    /// Remaining pushdown conjuncts, always evaluated
    pub where_cond: Option<CondFn>,
    /// Right-table-only conjuncts applied by the scanners
    pub scan_cond: Option<CondFn>,
    /// Pushed index condition for the key-access algorithms
    pub idx_cond: Option<CondFn>,
    /// Parent join's ON precondition over the driving row, evaluated at
    /// append time when this is a first inner table
    pub on_precond: Option<CondFn>,
    /// Outer join bookkeeping: first/last inner of the innermost nest
    pub first_inner: Option<usize>,
    pub last_inner: Option<usize>,
    /// First inner of the enclosing outer join, for nested nests
    pub first_upper: Option<usize>,
    /// Semi-join range bookkeeping
    pub first_sj_inner: Option<usize>,
    pub last_sj_inner: Option<usize>,
    /// First-match semantics apply to this table's buffered matching
    pub only_first_match: bool,
    /// Jump target of the FirstMatch strategy in unbuffered ranges
    pub do_firstmatch: Option<usize>,
    pub loosescan: Option<LooseScanCtl>,
    /// Last table of the LooseScan range
    pub loosescan_match_tab: Option<usize>,
    /// Weedout table truncated when this table's range is entered
    pub flush_weedout: Option<usize>,
    /// Weedout table checked after this table's condition passes
    pub check_weedout: Option<usize>,
    /// Materialization filled before this table is first read
    pub materialize: Option<usize>,
    /// A downstream weedout consumes this table's rowid, so buffers
    /// that carry its rows must round-trip the rowid too
    pub keep_current_rowid: bool,
}

impl JoinTab {
    pub fn new(table: usize, access: Access) -> Self {
        Self {
            table,
            access,
            join_alg: None,
            hash: None,
            on_cond: None,
            where_cond: None,
            scan_cond: None,
            idx_cond: None,
            on_precond: None,
            first_inner: None,
            last_inner: None,
            first_upper: None,
            first_sj_inner: None,
            last_sj_inner: None,
            only_first_match: false,
            do_firstmatch: None,
            loosescan: None,
            loosescan_match_tab: None,
            flush_weedout: None,
            check_weedout: None,
            materialize: None,
            keep_current_rowid: false,
        }
    }
}

/// Mutable per-table execution state.
#[derive(Debug, Clone, Default)]
pub struct TabState {
    /// A match was found for the current driving row (outer joins)
    pub found: bool,
    /// ON conditions are active; false while null-complementing
    pub not_null_compl: bool,
    /// Set on the inner range while null complements are generated
    pub first_unmatched: Option<usize>,
    /// The current row of this table took part in a completed match
    pub found_match: bool,
    /// Current LooseScan group prefix
    pub ls_key: Option<Vec<u8>>,
}

/// The current-row context of one table.
#[derive(Debug)]
pub struct TableCtx {
    pub schema: Rc<TableSchema>,
    pub row: RowImage,
    pub rowid: u64,
    /// Handler status: the row image holds a valid row
    pub status: bool,
}

impl TableCtx {
    pub fn new(schema: Rc<TableSchema>) -> Self {
        let row = RowImage::new(schema.clone());
        Self {
            schema,
            row,
            rowid: 0,
            status: false,
        }
    }
}

impl Rows for [TableCtx] {
    fn row(&self, table: usize) -> &RowImage {
        &self[table].row
    }

    fn rowid(&self, table: usize) -> u64 {
        self[table].rowid
    }
}

impl RowsMut for [TableCtx] {
    fn row_mut(&mut self, table: usize) -> &mut RowImage {
        &mut self[table].row
    }

    fn set_rowid(&mut self, table: usize, rowid: u64) {
        self[table].rowid = rowid;
    }
}

/// Cooperative cancellation handle.
#[derive(Clone)]
pub struct KillHandle(Rc<Cell<bool>>);

impl KillHandle {
    pub fn kill(&self) {
        self.0.set(true);
    }
}

/// The join executor.
pub struct Join {
    pub cfg: ExecConfig,
    pub tabs: Vec<JoinTab>,
    pub states: Vec<TabState>,
    pub tables: Vec<TableCtx>,
    pub stores: Vec<Rc<RefCell<MemTable>>>,
    pub caches: Vec<JoinBuffer>,
    /// Tab index each cache feeds
    cache_tab: Vec<usize>,
    /// Cache index per tab
    cache_of_tab: Vec<Option<usize>>,
    scan_info: Vec<Option<ScanTabInfo>>,
    scan_state: Vec<RightScanState>,
    pub weedouts: Vec<WeedoutTable>,
    pub materializations: Vec<Materialization>,
    /// Output projection: (table, column) per result column
    pub select: Vec<(usize, usize)>,
    pub out: Vec<Vec<Value>>,
    killed: Rc<Cell<bool>>,
    return_tab: usize,
    prepared: bool,
}

impl Join {
    pub fn new(
        cfg: ExecConfig,
        stores: Vec<Rc<RefCell<MemTable>>>,
        tabs: Vec<JoinTab>,
        select: Vec<(usize, usize)>,
    ) -> Self {
        let tables: Vec<TableCtx> = stores
            .iter()
            .map(|s| TableCtx::new(s.borrow().schema().clone()))
            .collect();
        let states = vec![TabState::default(); tabs.len()];
        let scan_info = vec![None; tabs.len()];
        let scan_state = (0..tabs.len()).map(|_| RightScanState::default()).collect();
        Self {
            cfg,
            tabs,
            states,
            tables,
            stores,
            caches: Vec::new(),
            cache_tab: Vec::new(),
            cache_of_tab: Vec::new(),
            scan_info,
            scan_state,
            weedouts: Vec::new(),
            materializations: Vec::new(),
            select,
            out: Vec::new(),
            killed: Rc::new(Cell::new(false)),
            return_tab: 0,
            prepared: false,
        }
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle(self.killed.clone())
    }

    pub fn take_output(&mut self) -> Vec<Vec<Value>> {
        std::mem::take(&mut self.out)
    }

    fn check_killed(&self) -> Result<(), JoinError> {
        if self.killed.get() {
            return Err(JoinError::Killed);
        }
        Ok(())
    }

    // ---- preparation -----------------------------------------------

    /// Creates the join buffers for the tables configured with a
    /// buffered algorithm and fits them into the space budget. Called
    /// by [`exec`](Self::exec); idempotent.
    pub fn prepare(&mut self) -> Result<(), JoinError> {
        if self.prepared {
            return Ok(());
        }
        self.cache_of_tab = vec![None; self.tabs.len()];

        for i in 0..self.tabs.len() {
            let alg = match self.tabs[i].join_alg {
                Some(alg) => alg,
                None => continue,
            };
            let info = ScanTabInfo {
                alg,
                index_no: match &self.tabs[i].access {
                    Access::Ref { index_no, .. } => *index_no,
                    _ => 0,
                },
                ref_key: match (&self.tabs[i].access, &self.tabs[i].hash) {
                    (Access::Ref { key, .. }, _) => Some(key.clone()),
                    (_, Some(hash)) => Some(hash.build_key.clone()),
                    _ => None,
                },
                idx_cond: self.tabs[i].idx_cond.clone(),
                scan_cond: self.tabs[i].scan_cond.clone(),
                only_first_match: self.tabs[i].only_first_match,
            };

            // Segment: tables from the previous cached tab (inclusive)
            // up to this one.
            let from = self.cache_tab.last().copied().unwrap_or(0);
            let seg_tables: Vec<BufferTable> = (from..i)
                .map(|j| {
                    let t = self.tabs[j].table;
                    BufferTable {
                        table: t,
                        schema: self.tables[t].schema.clone(),
                        store_null_row: self.tabs[j].first_inner.is_some(),
                        store_rowid: self.tabs[j].keep_current_rowid,
                    }
                })
                .collect();
            let with_match_flag = self.tabs[i].first_inner == Some(i)
                || (self.tabs[i].first_sj_inner == Some(i)
                    && self.tabs[i].only_first_match);
            let layout_key = match alg {
                JoinAlg::Bnl => None,
                JoinAlg::Bnlh | JoinAlg::Bkah => self
                    .tabs[i]
                    .hash
                    .as_ref()
                    .map(|h| h.build_key.clone())
                    .or(info.ref_key.clone()),
                JoinAlg::Bka => info.ref_key.clone(),
            };

            let caches = &mut self.caches;
            let layout = Layout::build(
                seg_tables,
                with_match_flag,
                layout_key.as_deref(),
                &mut |table, column| {
                    for (ci, cache) in caches.iter_mut().enumerate().rev() {
                        if let Some(descr) =
                            cache.register_referenced_column(table, column)
                        {
                            return Some(
                                crate::cache::layout::ExternalKeyArg {
                                    cache: ci,
                                    descr,
                                },
                            );
                        }
                    }
                    None
                },
            );

            let t = self.tabs[i].table;
            let store = self.stores[t].clone();
            let aux_first = RightScanState::aux_buffer_incr(&info, &store, 1);
            let prev = if self.caches.is_empty() {
                None
            } else {
                let pi = self.caches.len() - 1;
                Some((pi, self.caches[pi].size_of_rec_ofs))
            };
            let hash_cfg = match alg {
                JoinAlg::Bnlh | JoinAlg::Bkah => {
                    Some(self.tabs[i].hash.clone().ok_or_else(|| {
                        JoinError::Storage(format!(
                            "hashed algorithm on table '{}' without keys",
                            self.tables[t].schema.name
                        ))
                    })?)
                }
                _ => None,
            };
            let buffer = JoinBuffer::new(BufferParams {
                layout,
                feeds_table: self.tables[t].schema.name.clone(),
                prev,
                is_key_access: alg.is_key_access(),
                preferred_size: self.cfg.join_buffer_size,
                size_limit: self.cfg.join_buffer_size_limit,
                aux_first,
                hash: hash_cfg,
            });
            self.cache_of_tab[i] = Some(self.caches.len());
            self.cache_tab.push(i);
            self.caches.push(buffer);
            self.scan_info[i] = Some(info);
        }

        self.fit_buffers_into_budget()?;
        self.prepared = true;
        Ok(())
    }

    /// Sizes every cache at its preferred maximum, shrinking all of them
    /// by a common ratio when the total exceeds the per-query budget.
    fn fit_buffers_into_budget(&mut self) -> Result<(), JoinError> {
        if self.caches.is_empty() {
            return Ok(());
        }
        let budget = self.cfg.join_buffer_space_limit;
        let maxes: Vec<usize> =
            self.caches.iter().map(|c| c.max_buffer_size()).collect();
        let mins: Vec<usize> =
            self.caches.iter().map(|c| c.min_buffer_size()).collect();
        let total: usize = maxes.iter().sum();
        let min_total: usize = mins.iter().sum();
        if min_total > budget {
            return Err(JoinError::SpaceBudgetExceeded {
                requested: min_total,
                budget,
            });
        }
        let sizes: Vec<usize> = if total <= budget {
            maxes
        } else {
            tracing::warn!(
                "join buffers need {} bytes, budget is {}; shrinking",
                total,
                budget
            );
            let scaled: Vec<usize> = maxes
                .iter()
                .zip(&mins)
                .map(|(&mx, &mn)| ((mx as u128 * budget as u128 / total as u128) as usize).max(mn))
                .collect();
            if scaled.iter().sum::<usize>() > budget {
                mins
            } else {
                scaled
            }
        };
        for (cache, size) in self.caches.iter_mut().zip(sizes) {
            cache.allocate(size)?;
        }
        Ok(())
    }

    // ---- execution entry -------------------------------------------

    pub fn exec(&mut self) -> Result<(), JoinError> {
        self.prepare()?;
        self.out.clear();
        self.killed.set(false);
        for state in self.states.iter_mut() {
            *state = TabState {
                not_null_compl: true,
                ..TabState::default()
            };
        }
        for weedout in self.weedouts.iter_mut() {
            weedout.reset();
        }
        // Semi-join temp tables are truncated, not rebuilt, between
        // re-executions.
        for m in self.materializations.iter_mut() {
            m.materialized = false;
        }
        let temp_tables: Vec<usize> =
            self.materializations.iter().map(|m| m.temp_table).collect();
        for t in temp_tables {
            let mut store = self.stores[t].borrow_mut();
            tracing::debug!(
                "truncating temp table '{}' ({} rows)",
                store.schema().name,
                store.row_count()
            );
            store.delete_all_rows();
        }
        for cache in self.caches.iter_mut() {
            cache.reset(true);
        }
        self.return_tab = self.tabs.len();

        if self.tabs.is_empty() {
            self.emit_row()?;
            return Ok(());
        }
        self.sub_select(0, false)?;
        self.sub_select(0, true)?;
        Ok(())
    }

    fn emit_row(&mut self) -> Result<(), JoinError> {
        let row: Vec<Value> = self
            .select
            .iter()
            .map(|&(t, c)| self.tables[t].row.value(c))
            .collect();
        self.out.push(row);
        Ok(())
    }

    // ---- nested-loop driver ----------------------------------------

    fn sub_select(&mut self, i: usize, end_of_records: bool) -> Result<(), JoinError> {
        if i == self.tabs.len() {
            if !end_of_records {
                self.emit_row()?;
            }
            return Ok(());
        }
        match self.cache_of_tab[i] {
            Some(ci) => self.sub_select_cache(i, ci, end_of_records),
            None => self.sub_select_plain(i, end_of_records),
        }
    }

    /// Drives an unbuffered table: reads its rows for the current
    /// driving combination and extends each match downstream.
    fn sub_select_plain(
        &mut self,
        i: usize,
        end_of_records: bool,
    ) -> Result<(), JoinError> {
        if end_of_records {
            return self.sub_select(i + 1, true);
        }
        if let Some(w) = self.tabs[i].flush_weedout {
            self.weedouts[w].reset();
        }
        if let Some(m) = self.tabs[i].materialize {
            self.materialize_fill(m)?;
        }
        self.return_tab = i;
        {
            let st = &mut self.states[i];
            st.found = false;
            st.found_match = false;
            st.ls_key = None;
        }

        let mut have_row = self.read_first(i)?;
        while have_row {
            self.check_killed()?;
            self.evaluate_join_record(i)?;
            if self.return_tab < i {
                return Ok(());
            }
            have_row = self.read_next(i)?;
        }

        // Null complementation for an unbuffered outer-join inner table.
        if self.tabs[i].first_inner == Some(i)
            && self.tabs[i].last_inner == Some(i)
            && !self.states[i].found
        {
            let t = self.tabs[i].table;
            self.tables[t].row.restore_defaults();
            self.tables[t].row.null_row = true;
            self.states[i].not_null_compl = false;
            let result = self.extend_null_complement(i);
            self.states[i].not_null_compl = true;
            self.tables[t].row.null_row = false;
            result?;
        }
        Ok(())
    }

    fn extend_null_complement(&mut self, i: usize) -> Result<(), JoinError> {
        if !self.eval_tab_conds(i) {
            return Ok(());
        }
        if let Some(w) = self.tabs[i].check_weedout {
            if self.weedouts[w].insert_and_check(&self.tables)?
                == WriteOutcome::Duplicate
            {
                return Ok(());
            }
        }
        self.sub_select(i + 1, false)
    }

    /// Processes one fetched row of an unbuffered table.
    fn evaluate_join_record(&mut self, i: usize) -> Result<(), JoinError> {
        if !self.eval_tab_conds(i) {
            return Ok(());
        }

        // LooseScan: one representative row per distinct key prefix.
        if let Some(ctl) = self.tabs[i].loosescan {
            let t = self.tabs[i].table;
            let index_no = match self.tabs[i].access {
                Access::IndexScan { index_no } => index_no,
                _ => 0,
            };
            let mut prefix = {
                let store = self.stores[t].borrow();
                store.index_key(index_no).image_from_row(&self.tables[t].row)
            };
            prefix.truncate(ctl.key_len);
            let match_tab = self.tabs[i].loosescan_match_tab.unwrap_or(i);
            if self.states[i].ls_key.as_deref() == Some(&prefix[..]) {
                if self.states[match_tab].found_match {
                    return Ok(());
                }
            } else {
                self.states[i].ls_key = Some(prefix);
                self.states[match_tab].found_match = false;
            }
        }

        if self.tabs[i].first_inner == Some(i) {
            self.states[i].found = true;
        }

        let mut return_to = None;
        if let Some(w) = self.tabs[i].check_weedout {
            if self.weedouts[w].insert_and_check(&self.tables)?
                == WriteOutcome::Duplicate
            {
                return Ok(());
            }
        } else if let Some(target) = self.tabs[i].do_firstmatch {
            return_to = Some(target);
        }

        self.sub_select(i + 1, false)?;
        self.states[i].found_match = true;
        if let Some(target) = return_to {
            self.return_tab = self.return_tab.min(target);
        }
        Ok(())
    }

    /// Evaluates the table's pushdown conjuncts. The ON part is
    /// suppressed while its nest is generating null complements.
    fn eval_tab_conds(&self, i: usize) -> bool {
        if let Some(on) = &self.tabs[i].on_cond {
            let active = match self.tabs[i].first_inner {
                Some(fi) => self.states[fi].not_null_compl,
                None => true,
            };
            if active && !on(&RowAccessAll(&self.tables)) {
                return false;
            }
        }
        if let Some(cond) = &self.tabs[i].where_cond {
            if !cond(&RowAccessAll(&self.tables)) {
                return false;
            }
        }
        true
    }

    fn read_first(&mut self, i: usize) -> Result<bool, JoinError> {
        let t = self.tabs[i].table;
        let access = self.tabs[i].access.clone();
        let store = self.stores[t].clone();
        let found = match access {
            Access::Scan => {
                let mut store = store.borrow_mut();
                store.rnd_init();
                store.rnd_next(&mut self.tables[t].row)?
            }
            Access::Ref { index_no, key } => {
                let probe = key.probe_image(&RowAccessAll(&self.tables));
                match probe {
                    None => false,
                    Some(image) => store.borrow_mut().index_read(
                        index_no,
                        &image,
                        &mut self.tables[t].row,
                    )?,
                }
            }
            Access::IndexScan { index_no } => store
                .borrow_mut()
                .index_first(index_no, &mut self.tables[t].row)?,
        };
        if found {
            self.tables[t].rowid = store.borrow().position();
            self.tables[t].status = true;
        }
        Ok(found)
    }

    fn read_next(&mut self, i: usize) -> Result<bool, JoinError> {
        let t = self.tabs[i].table;
        let access = self.tabs[i].access.clone();
        let store = self.stores[t].clone();
        let found = match access {
            Access::Scan => store.borrow_mut().rnd_next(&mut self.tables[t].row)?,
            Access::Ref { .. } => {
                store.borrow_mut().index_next_same(&mut self.tables[t].row)?
            }
            Access::IndexScan { .. } => {
                store.borrow_mut().index_next(&mut self.tables[t].row)?
            }
        };
        if found {
            self.tables[t].rowid = store.borrow().position();
            self.tables[t].status = true;
        }
        Ok(found)
    }

    // ---- buffered path ---------------------------------------------

    /// Drives a buffered table: appends the current driving row, and
    /// flushes the buffer through the coordinator when it fills up or at
    /// the end of records.
    fn sub_select_cache(
        &mut self,
        i: usize,
        ci: usize,
        end_of_records: bool,
    ) -> Result<(), JoinError> {
        if end_of_records {
            self.cache_join_records(ci, false)?;
            return self.sub_select(i + 1, true);
        }
        self.check_killed()?;
        let result = self.cache_put_record(i, ci)?;
        if result.written == 0 {
            // The record did not fit: flush and retry.
            self.cache_join_records(ci, false)?;
            let retry = self.cache_put_record(i, ci)?;
            if retry.written == 0 {
                let t = self.tabs[i].table;
                return Err(JoinError::BufferFloorExceeded {
                    table: self.tables[t].schema.name.clone(),
                    required: self.caches[ci].min_buffer_size(),
                    available: self.caches[ci].max_buffer_size(),
                });
            }
            if retry.is_full {
                return self.cache_join_records(ci, false);
            }
            return Ok(());
        }
        if result.is_full {
            return self.cache_join_records(ci, false);
        }
        Ok(())
    }

    /// Appends the current driving-row combination into the cache.
    pub fn cache_put_record(
        &mut self,
        i: usize,
        ci: usize,
    ) -> Result<AppendResult, JoinError> {
        let precond_is_false = match (&self.tabs[i].on_precond, self.states[i].first_unmatched)
        {
            (Some(cond), None) => Some(!cond(&RowAccessAll(&self.tables))),
            _ => None,
        };
        let prev_link = match self.caches[ci].prev {
            Some(prev) => self.caches[prev].get_curr_rec_link(),
            None => 0,
        };
        let t = self.tabs[i].table;
        let info = self.scan_info[i].as_ref().expect("cached tab has scan info");
        let aux = RightScanState::aux_buffer_incr(
            info,
            &self.stores[t],
            self.caches[ci].records() + 1,
        );
        let (tables, caches) = (&self.tables, &mut self.caches);
        Ok(caches[ci].append(
            &RowAccessAll(tables),
            prev_link,
            aux,
            precond_is_false,
        ))
    }

    /// The coordinator for one buffer fill: find matches, cascade into
    /// chained buffers, emit null complements for unmatched records.
    pub fn cache_join_records(
        &mut self,
        ci: usize,
        skip_last: bool,
    ) -> Result<(), JoinError> {
        let result = self.cache_join_records_inner(ci, skip_last);
        // On every exit path, error or not: restore the last record so
        // the driving row survives the flush, then leave the buffer
        // ready for refilling.
        let restored = self.cache_restore_last_record(ci);
        self.caches[ci].reset(true);
        result.and(restored)
    }

    fn cache_join_records_inner(
        &mut self,
        ci: usize,
        skip_last: bool,
    ) -> Result<(), JoinError> {
        let i = self.cache_tab[ci];
        let outer_join_first_inner = self.tabs[i].first_inner == Some(i);

        if self.states[i].first_unmatched.is_none() {
            if outer_join_first_inner {
                self.states[i].not_null_compl = true;
            }
            self.cache_join_matching_records(ci, skip_last)?;
            if outer_join_first_inner {
                if let Some(next_ci) = self.next_cache(ci) {
                    // All matches must exist before null complements of
                    // this buffer can be judged.
                    self.cache_join_records(next_ci, skip_last)?;
                }
                self.states[i].not_null_compl = false;
                let (fi, li) = (i, self.tabs[i].last_inner.unwrap_or(i));
                for j in fi..=li {
                    self.states[j].first_unmatched = Some(fi);
                }
            }
        }
        if self.states[i].first_unmatched.is_some() {
            if self.tabs[i].join_alg.map(|a| a.is_key_access()) == Some(true) {
                self.cache_restore_last_record(ci)?;
            }
            self.caches[ci].reset(false);
            self.cache_join_null_complements(ci, skip_last)?;
        }
        if let Some(next_ci) = self.next_cache(ci) {
            self.cache_join_records(next_ci, skip_last)?;
        }
        if outer_join_first_inner {
            let (fi, li) = (i, self.tabs[i].last_inner.unwrap_or(i));
            for j in fi..=li {
                self.states[j].first_unmatched = None;
            }
        }
        Ok(())
    }

    fn next_cache(&self, ci: usize) -> Option<usize> {
        self.caches.iter().position(|c| c.prev == Some(ci))
    }

    fn cache_restore_last_record(&mut self, ci: usize) -> Result<(), JoinError> {
        if let Some(pos) = self.caches[ci].last_rec_pos() {
            self.read_candidate(ci, pos)?;
        }
        Ok(())
    }

    /// Materializes the buffered record at `fields_pos`, including the
    /// records it references through the buffer chain.
    fn read_candidate(&mut self, ci: usize, fields_pos: usize) -> Result<(), JoinError> {
        let (prevs, rest) = self.caches.split_at_mut(ci);
        let cache = &rest[0];
        cache.read_fields_at(fields_pos, &mut DrivingRows(&mut self.tables))?;
        if let Some(prev) = cache.prev {
            let ref_pos = cache.get_rec_ref(fields_pos);
            read_record_chain(prevs, prev, ref_pos, &mut DrivingRows(&mut self.tables))?;
        }
        Ok(())
    }

    fn cache_match_flag_at(&self, ci: usize, fields_pos: usize) -> MatchFlag {
        self.caches[ci].match_flag_at(&self.caches[..ci], fields_pos)
    }

    /// Finds all matches of the right-hand table against the buffer.
    fn cache_join_matching_records(
        &mut self,
        ci: usize,
        skip_last: bool,
    ) -> Result<(), JoinError> {
        let i = self.cache_tab[ci];
        let t = self.tabs[i].table;
        let only_first_match = self.tabs[i].only_first_match;
        let outer_join_first_inner = self.tabs[i].first_inner == Some(i);

        self.tables[t].row.null_row = false;
        if self.caches[ci].records() == 0 {
            return Ok(());
        }
        if skip_last {
            // Save the in-flight driving row in the buffer so it can be
            // restored after matching.
            let result = self.cache_put_record(i, ci)?;
            if result.written == 0 {
                return Err(JoinError::BufferFloorExceeded {
                    table: self.tables[t].schema.name.clone(),
                    required: self.caches[ci].min_buffer_size(),
                    available: self.caches[ci].max_buffer_size(),
                });
            }
        }

        let info = self.scan_info[i].clone().expect("cached tab has scan info");
        let store = self.stores[t].clone();
        let mut scan = std::mem::take(&mut self.scan_state[i]);
        {
            let mut ctx = ScanCtx {
                store: &store,
                right_table: t,
                tables: &mut self.tables,
                caches: &mut self.caches,
                cache_idx: ci,
                info: &info,
                mrr_buffer_size: self.cfg.mrr_buffer_size,
            };
            scan.open(&mut ctx)?;
        }

        let result = (|| -> Result<(), JoinError> {
            loop {
                let fetched = {
                    let mut ctx = ScanCtx {
                        store: &store,
                        right_table: t,
                        tables: &mut self.tables,
                        caches: &mut self.caches,
                        cache_idx: ci,
                        info: &info,
                        mrr_buffer_size: self.cfg.mrr_buffer_size,
                    };
                    scan.next(&mut ctx)?
                };
                let tag = match fetched {
                    None => return Ok(()),
                    Some(tag) => tag,
                };
                self.check_killed()?;
                self.cache_look_for_matches(
                    ci,
                    tag,
                    skip_last,
                    only_first_match,
                    outer_join_first_inner,
                )?;
            }
        })();

        {
            let mut ctx = ScanCtx {
                store: &store,
                right_table: t,
                tables: &mut self.tables,
                caches: &mut self.caches,
                cache_idx: ci,
                info: &info,
                mrr_buffer_size: self.cfg.mrr_buffer_size,
            };
            scan.close(&mut ctx);
        }
        self.scan_state[i] = scan;
        result
    }

    /// Walks the candidate records of the buffer for the current
    /// right-hand row and generates full extensions for the matches.
    fn cache_look_for_matches(
        &mut self,
        ci: usize,
        tag: Option<usize>,
        skip_last: bool,
        only_first_match: bool,
        outer_join_first_inner: bool,
    ) -> Result<(), JoinError> {
        let i = self.cache_tab[ci];
        let alg = self.tabs[i].join_alg.expect("cached tab has an algorithm");
        let consider_skips = only_first_match || outer_join_first_inner;
        match alg {
            JoinAlg::Bnl => {
                self.caches[ci].reset(false);
                let mut rem =
                    self.caches[ci].records() - usize::from(skip_last);
                while rem > 0 {
                    rem -= 1;
                    self.check_killed()?;
                    if consider_skips {
                        let (prevs, rest) = self.caches.split_at_mut(ci);
                        if rest[0]
                            .skip_if_not_needed_match(prevs, only_first_match)?
                        {
                            continue;
                        }
                    }
                    let fields_pos = {
                        let cache = &mut self.caches[ci];
                        cache.next_read()?.ok_or(
                            JoinError::InvalidRecordOffset {
                                offset: 0,
                                end: 0,
                            },
                        )?
                    };
                    self.read_candidate(ci, fields_pos)?;
                    self.cache_generate_full_extensions(ci, fields_pos)?;
                }
            }
            JoinAlg::Bnlh => {
                let probe = {
                    let hash = self.caches[ci].hash.as_ref().unwrap();
                    hash.probe_key.probe_image(&RowAccessAll(&self.tables))
                };
                let image = match probe {
                    Some(image) => image,
                    None => return Ok(()),
                };
                let chain_ptr = match self.caches[ci].hash_lookup(&image) {
                    Some(ptr) => ptr,
                    None => return Ok(()),
                };
                self.walk_chain(ci, chain_ptr, only_first_match)?;
            }
            JoinAlg::Bka => {
                let fields_pos = tag.expect("BKA rows carry a record tag");
                if only_first_match
                    && self.cache_match_flag_at(ci, fields_pos)
                        == MatchFlag::Found
                {
                    return Ok(());
                }
                self.read_candidate(ci, fields_pos)?;
                self.cache_generate_full_extensions(ci, fields_pos)?;
            }
            JoinAlg::Bkah => {
                let chain_ptr = tag.expect("BKAH rows carry a chain tag");
                self.walk_chain(ci, chain_ptr, only_first_match)?;
            }
        }
        Ok(())
    }

    fn walk_chain(
        &mut self,
        ci: usize,
        chain_ptr: usize,
        only_first_match: bool,
    ) -> Result<(), JoinError> {
        let mut cursor = self.caches[ci].chain_cursor(chain_ptr);
        loop {
            let fields_pos = match self.caches[ci].chain_next(&mut cursor) {
                Some(p) => p,
                None => return Ok(()),
            };
            self.check_killed()?;
            if only_first_match
                && self.cache_match_flag_at(ci, fields_pos) == MatchFlag::Found
            {
                continue;
            }
            self.read_candidate(ci, fields_pos)?;
            self.cache_generate_full_extensions(ci, fields_pos)?;
        }
    }

    /// Extends one matching candidate: evaluates the pushdown
    /// conditions, maintains match flags, applies duplicate weedout and
    /// invokes the downstream join.
    fn cache_generate_full_extensions(
        &mut self,
        ci: usize,
        fields_pos: usize,
    ) -> Result<(), JoinError> {
        let i = self.cache_tab[ci];
        if !self.cache_check_match(ci, fields_pos)? {
            return Ok(());
        }
        if let Some(w) = self.tabs[i].check_weedout {
            if self.weedouts[w].insert_and_check(&self.tables)?
                == WriteOutcome::Duplicate
            {
                return Ok(());
            }
        }
        self.caches[ci].set_curr_rec_link(fields_pos);
        match self.sub_select(i + 1, false) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.caches[ci].reset(true);
                Err(e)
            }
        }
    }

    /// Checks whether the right-hand row matches the candidate and, at
    /// the last inner table of outer or semi joins, maintains the match
    /// flags of every enclosing first inner.
    fn cache_check_match(
        &mut self,
        ci: usize,
        fields_pos: usize,
    ) -> Result<bool, JoinError> {
        let i = self.cache_tab[ci];
        if !self.eval_tab_conds(i) {
            return Ok(false);
        }
        if !self.is_last_inner(i) {
            return Ok(true);
        }
        let mut fi = match self.first_inner_of(i) {
            Some(fi) => fi,
            None => return Ok(true),
        };
        loop {
            self.set_match_flag_if_none(fi, ci, fields_pos);
            if self.tabs[fi].only_first_match && self.tabs[i].first_inner.is_none()
            {
                // Semi-join first match: one extension is enough.
                return Ok(true);
            }
            // The first match flips `found`; re-check the pushdown
            // conditions of the enclosed tables under the new state.
            for j in fi..=i {
                if !self.eval_tab_conds(j) {
                    return Ok(false);
                }
            }
            match self.tabs[fi].first_upper {
                Some(up) if self.tabs[up].last_inner == Some(i) => fi = up,
                _ => break,
            }
        }
        Ok(true)
    }

    fn is_last_inner(&self, i: usize) -> bool {
        if let Some(fi) = self.tabs[i].first_inner {
            if self.tabs[fi].last_inner == Some(i) {
                return true;
            }
        }
        self.tabs[i].last_sj_inner == Some(i)
    }

    fn first_inner_of(&self, i: usize) -> Option<usize> {
        self.tabs[i].first_inner.or(self.tabs[i].first_sj_inner)
    }

    /// Promotes the match flag of the record owning the flag for
    /// `first_inner` from `NotFound` to `Found`. Returns whether this
    /// call made the transition. `Impossible` is terminal.
    pub fn set_match_flag_if_none(
        &mut self,
        first_inner: usize,
        ci: usize,
        fields_pos: usize,
    ) -> bool {
        match self.cache_of_tab[first_inner] {
            None => {
                if self.states[first_inner].found {
                    false
                } else {
                    self.states[first_inner].found = true;
                    true
                }
            }
            Some(target_ci) => {
                let mut c = ci;
                let mut pos = fields_pos;
                while c != target_ci {
                    pos = self.caches[c].get_rec_ref(pos);
                    c = self.caches[c].prev.expect("chain reaches flag owner");
                }
                let flag = self.caches[c]
                    .match_flag_at(&self.caches[..c], pos);
                if flag == MatchFlag::NotFound {
                    self.caches[c].set_match_flag_at(pos, MatchFlag::Found);
                    self.states[first_inner].found = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Emits null-complemented rows for the driving records that found
    /// no match, after all matching extensions were produced.
    fn cache_join_null_complements(
        &mut self,
        ci: usize,
        skip_last: bool,
    ) -> Result<(), JoinError> {
        let i = self.cache_tab[ci];
        let t = self.tabs[i].table;
        let is_first_inner = self.states[i].first_unmatched == Some(i);
        if self.caches[ci].records() == 0 {
            return Ok(());
        }
        let is_key_access =
            self.tabs[i].join_alg.map(|a| a.is_key_access()) == Some(true);
        let mut cnt = self.caches[ci].records()
            - if is_key_access { 0 } else { usize::from(skip_last) };
        while cnt > 0 {
            cnt -= 1;
            self.check_killed()?;
            let skipped = if is_first_inner {
                let (prevs, rest) = self.caches.split_at_mut(ci);
                rest[0].skip_if_matched(prevs)?
            } else {
                false
            };
            if skipped {
                continue;
            }
            let fields_pos = {
                let cache = &mut self.caches[ci];
                cache
                    .next_read()?
                    .ok_or(JoinError::InvalidRecordOffset { offset: 0, end: 0 })?
            };
            self.read_candidate(ci, fields_pos)?;
            self.tables[t].row.restore_defaults();
            self.tables[t].row.null_row = true;
            self.cache_generate_full_extensions(ci, fields_pos)?;
        }
        self.tables[t].row.null_row = false;
        Ok(())
    }

    // ---- semi-join materialization ---------------------------------

    /// Fills a materialization temp table on first access: one pass
    /// over the inner tables, distinct rows only.
    fn materialize_fill(&mut self, m: usize) -> Result<(), JoinError> {
        if self.materializations[m].materialized {
            return Ok(());
        }
        let tables = self.materializations[m].tables.clone();
        let cond = self.materializations[m].cond.clone();
        let select = self.materializations[m].select.clone();
        let temp_table = self.materializations[m].temp_table;
        tracing::debug!(
            "materializing semi-join nest into '{}'",
            self.tables[temp_table].schema.name
        );
        self.materialize_scan_level(&tables, 0, &cond, &select, temp_table)?;
        self.materializations[m].materialized = true;
        Ok(())
    }

    fn materialize_scan_level(
        &mut self,
        tables: &[usize],
        depth: usize,
        cond: &Option<CondFn>,
        select: &[(usize, usize)],
        temp_table: usize,
    ) -> Result<(), JoinError> {
        if depth == tables.len() {
            if let Some(cond) = cond {
                if !cond(&RowAccessAll(&self.tables)) {
                    return Ok(());
                }
            }
            let mut scratch =
                RowImage::new(self.tables[temp_table].schema.clone());
            for (col, &(st, sc)) in select.iter().enumerate() {
                let value = self.tables[st].row.value(sc);
                scratch.set_value(col, &value)?;
            }
            // Duplicates collapse through the unique key.
            self.stores[temp_table].borrow_mut().write_tmp_row(&scratch)?;
            return Ok(());
        }
        let t = tables[depth];
        let store = self.stores[t].clone();
        store.borrow_mut().rnd_init();
        loop {
            self.check_killed()?;
            let found = store.borrow_mut().rnd_next(&mut self.tables[t].row)?;
            if !found {
                break;
            }
            self.tables[t].rowid = store.borrow().position();
            self.materialize_scan_level(tables, depth + 1, cond, select, temp_table)?;
        }
        store.borrow_mut().rnd_end();
        Ok(())
    }
}
