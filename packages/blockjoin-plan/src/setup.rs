//! Plan-to-executor translation.
//!
//! Builds the executor's per-table settings from the chosen join order:
//! access methods and keys, pushdown condition placement, join-buffer
//! algorithms, and the execution structures of the picked semi-join
//! strategies (weedout tables, materialization temp tables, first-match
//! jumps and loose-scan prefixes).

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use blockjoin_core::cache::hashed::HashConfig;
use blockjoin_core::exec::{Access, Join, JoinAlg, JoinTab, LooseScanCtl};
use blockjoin_core::keys::{KeyDef, KeyPart, KeyPartKind};
use blockjoin_core::schema::{Column, ColumnType, TableSchema};
use blockjoin_core::semijoin::{Materialization, WeedoutTable};
use blockjoin_core::storage::{Handler, IndexDef, MemTable};
use blockjoin_core::{ExecConfig, SemiJoinStrategy};

use crate::config::{OptimizerSwitch, PlannerConfig};
use crate::error::PlanError;
use crate::expr::{compile_cond, conjoin, Expr};
use crate::planner::{Plan, PlanAccess};
use crate::query::{Catalog, NodeKind, QueryBlock};

/// Builds a ready-to-run executor from a finalized plan.
pub fn build_join(
    query: &QueryBlock,
    catalog: &Catalog,
    plan: &Plan,
    cfg: &PlannerConfig,
    exec_cfg: ExecConfig,
) -> Result<Join, PlanError> {
    let mut builder = JoinBuilder {
        query,
        catalog,
        cfg,
        stores: catalog.tables.iter().map(|t| t.store.clone()).collect(),
        tabs: Vec::new(),
        tab_of_pos: Vec::new(),
        weedouts: Vec::new(),
        materializations: Vec::new(),
        where_conjuncts: query
            .where_clause
            .clone()
            .map(|w| w.into_conjuncts())
            .unwrap_or_default(),
        col_remap: HashMap::new(),
    };
    builder.build_tabs(plan)?;
    builder.place_strategies(plan)?;
    builder.place_conditions()?;

    let select: Vec<(usize, usize)> = query
        .select
        .iter()
        .map(|e| match e {
            Expr::Column { table, column } => Ok((*table, *column)),
            other => Err(PlanError::Exec(blockjoin_core::JoinError::Storage(
                format!("unsupported select item {:?}", other),
            ))),
        })
        .collect::<Result<_, _>>()?;

    let mut join = Join::new(exec_cfg, builder.stores, builder.tabs, select);
    join.weedouts = builder.weedouts;
    join.materializations = builder.materializations;
    Ok(join)
}

struct JoinBuilder<'a> {
    query: &'a QueryBlock,
    catalog: &'a Catalog,
    cfg: &'a PlannerConfig,
    stores: Vec<Rc<RefCell<MemTable>>>,
    tabs: Vec<JoinTab>,
    /// Executor tab index per plan position; materialized inner
    /// positions map to their temp-table tab
    tab_of_pos: Vec<usize>,
    weedouts: Vec<WeedoutTable>,
    materializations: Vec<Materialization>,
    where_conjuncts: Vec<Expr>,
    /// Materialized inner columns redirected to their temp-table column
    col_remap: HashMap<(usize, usize), (usize, usize)>,
}

impl JoinBuilder<'_> {
    /// Creates the executor tabs in plan order, collapsing materialized
    /// nest ranges into one temp-table tab.
    fn build_tabs(&mut self, plan: &Plan) -> Result<(), PlanError> {
        let mut pos_idx = 0;
        let mut placed: BTreeSet<usize> = BTreeSet::new();
        while pos_idx < plan.positions.len() {
            let pos = &plan.positions[pos_idx];
            if matches!(
                pos.sj_strategy,
                SemiJoinStrategy::Materialize | SemiJoinStrategy::MaterializeScan
            ) {
                let n = pos.n_sj_tables;
                let is_scan =
                    pos.sj_strategy == SemiJoinStrategy::MaterializeScan;
                let tab_idx =
                    self.build_materialization(plan, pos_idx, n, is_scan)?;
                for k in 0..n {
                    placed.insert(
                        self.query.leaf_catalog(plan.positions[pos_idx + k].table),
                    );
                    self.tab_of_pos.push(tab_idx);
                }
                pos_idx += n;
                continue;
            }
            let cat = self.query.leaf_catalog(pos.table);
            let access = self.exec_access(&pos.access, cat)?;
            let mut tab = JoinTab::new(cat, access);
            if let PlanAccess::LooseScan { key_len, .. } = pos.access {
                tab.loosescan = Some(LooseScanCtl { key_len });
            }
            if pos.use_join_buffer {
                self.assign_buffering(&mut tab, pos, cat, &placed);
            }
            placed.insert(cat);
            self.tab_of_pos.push(self.tabs.len());
            self.tabs.push(tab);
            pos_idx += 1;
        }
        Ok(())
    }

    /// Redirects a column of a materialized inner table to its
    /// temp-table column.
    fn remap(&self, col: (usize, usize)) -> (usize, usize) {
        self.col_remap.get(&col).copied().unwrap_or(col)
    }

    fn exec_access(
        &self,
        access: &PlanAccess,
        cat: usize,
    ) -> Result<Access, PlanError> {
        Ok(match access {
            PlanAccess::Scan => Access::Scan,
            PlanAccess::Ref { index_no, key_cols } => {
                let inner_schema = self.catalog.schema(cat);
                let key = ref_key_for_index(
                    &inner_schema,
                    &key_cols.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
                    &key_cols
                        .iter()
                        .map(|(_, o)| self.remap(*o))
                        .collect::<Vec<_>>(),
                );
                Access::Ref {
                    index_no: *index_no,
                    key: Rc::new(key),
                }
            }
            PlanAccess::LooseScan { index_no, .. } => Access::IndexScan {
                index_no: *index_no,
            },
        })
    }

    /// Picks the buffered algorithm for a position, honoring the cache
    /// level and the optimizer switches.
    fn assign_buffering(
        &self,
        tab: &mut JoinTab,
        pos: &crate::planner::Position,
        cat: usize,
        placed: &BTreeSet<usize>,
    ) {
        let level = self.cfg.join_cache_level;
        match &pos.access {
            PlanAccess::Scan => {
                let hashed = level >= 3
                    && self
                        .cfg
                        .optimizer_switch
                        .contains(OptimizerSwitch::JOIN_CACHE_HASHED);
                if hashed {
                    if let Some(hash) = self.hash_keys_for(cat, placed) {
                        tab.join_alg = Some(JoinAlg::Bnlh);
                        tab.hash = Some(hash);
                        return;
                    }
                }
                tab.join_alg = Some(JoinAlg::Bnl);
            }
            PlanAccess::Ref { .. } => {
                let hashed = level >= 7
                    && self
                        .cfg
                        .optimizer_switch
                        .contains(OptimizerSwitch::JOIN_CACHE_HASHED);
                if hashed {
                    if let Some(hash) = self.hash_keys_for(cat, placed) {
                        tab.join_alg = Some(JoinAlg::Bkah);
                        tab.hash = Some(hash);
                        return;
                    }
                }
                tab.join_alg = Some(JoinAlg::Bka);
            }
            PlanAccess::LooseScan { .. } => {}
        }
    }

    /// Build- and probe-side hash keys from the equalities that join
    /// this table to tables earlier in the order.
    fn hash_keys_for(
        &self,
        cat: usize,
        earlier: &BTreeSet<usize>,
    ) -> Option<HashConfig> {
        let mut build_cols = Vec::new();
        let mut probe_cols = Vec::new();
        let inner_schema = self.catalog.schema(cat);
        if let Some(w) = &self.query.where_clause {
            for item in w.conjuncts() {
                if let Expr::Eq { left, right, .. } = item {
                    let pair = match (&**left, &**right) {
                        (
                            Expr::Column { table: t1, column: c1 },
                            Expr::Column { table: t2, column: c2 },
                        ) => Some(((*t1, *c1), (*t2, *c2))),
                        _ => None,
                    };
                    if let Some((a, b)) = pair {
                        let (outer, inner) = if a.0 == cat && earlier.contains(&b.0)
                        {
                            (b, a)
                        } else if b.0 == cat && earlier.contains(&a.0) {
                            (a, b)
                        } else {
                            continue;
                        };
                        build_cols.push((inner.1, outer));
                        probe_cols.push((inner.1, inner));
                    }
                }
            }
        }
        if build_cols.is_empty() {
            return None;
        }
        let index_cols: Vec<usize> = build_cols.iter().map(|(c, _)| *c).collect();
        let build = ref_key_for_index(
            &inner_schema,
            &index_cols,
            &build_cols.iter().map(|(_, o)| *o).collect::<Vec<_>>(),
        );
        let probe = ref_key_for_index(
            &inner_schema,
            &index_cols,
            &probe_cols.iter().map(|(_, o)| *o).collect::<Vec<_>>(),
        );
        Some(HashConfig {
            build_key: Rc::new(build),
            probe_key: Rc::new(probe),
        })
    }

    /// Creates the temp table, the materialization descriptor and the
    /// temp-table tab of a materialized nest range.
    fn build_materialization(
        &mut self,
        plan: &Plan,
        first_pos: usize,
        n: usize,
        is_scan: bool,
    ) -> Result<usize, PlanError> {
        let nest = self
            .query
            .emb_sj_nest(plan.positions[first_pos].table)
            .expect("materialized range lies in a nest");
        let info = self.query.nest_sj_info(nest).expect("nest has info");

        // The tagged IN-equalities name the outer operands and the
        // inner select list.
        let mut tagged: Vec<(usize, (usize, usize), (usize, usize))> = Vec::new();
        for item in self.where_conjuncts.iter() {
            if let Expr::Eq {
                left,
                right,
                in_equality_no: Some(no),
            } = item
            {
                if let (
                    Expr::Column { table: t1, column: c1 },
                    Expr::Column { table: t2, column: c2 },
                ) = (&**left, &**right)
                {
                    let (outer, inner) = if info.inner_tables.contains(t2) {
                        ((*t1, *c1), (*t2, *c2))
                    } else {
                        ((*t2, *c2), (*t1, *c1))
                    };
                    if info.inner_tables.contains(&inner.0) {
                        tagged.push((*no, outer, inner));
                    }
                }
            }
        }
        tagged.sort_by_key(|(no, _, _)| *no);
        tagged.dedup_by_key(|(no, _, _)| *no);

        // Temp table schema: one column per inner select item.
        let columns: Vec<Column> = tagged
            .iter()
            .enumerate()
            .map(|(i, (_, _, inner))| {
                let src = self.catalog.schema(inner.0);
                let col = &src.columns[inner.1];
                Column {
                    name: format!("c{}", i),
                    ty: col.ty,
                    collation: col.collation,
                    nullable: col.nullable,
                }
            })
            .collect();
        let temp_schema = TableSchema::new("sj-materialize-tmp", columns)?;
        let mut temp = MemTable::new(temp_schema.clone());
        // Unique key over all columns: rows are written distinct.
        temp.add_index(IndexDef {
            columns: (0..tagged.len()).collect(),
            unique: true,
        });
        let temp_exec = self.stores.len();
        self.stores.push(Rc::new(RefCell::new(temp)));

        // Inner tables in plan order, the fill condition is the part of
        // the WHERE that only touches them.
        let inner_order: Vec<usize> = (first_pos..first_pos + n)
            .map(|p| self.query.leaf_catalog(plan.positions[p].table))
            .collect();
        let inner_conds: Vec<Expr> = self
            .where_conjuncts
            .iter()
            .filter(|c| {
                let refs = c.referenced_table_set();
                !refs.is_empty()
                    && refs.iter().all(|t| info.inner_tables.contains(t))
            })
            .cloned()
            .collect();

        // Strip the injected IN-equalities: they no longer apply once
        // the lookup goes against the materialized result.
        let inner_tables = info.inner_tables.clone();
        self.where_conjuncts.retain(|c| {
            let is_sj_eq = matches!(c, Expr::Eq { in_equality_no: Some(_), .. })
                && c.referenced_table_set()
                    .iter()
                    .any(|t| inner_tables.contains(t));
            let inner_only = {
                let refs = c.referenced_table_set();
                !refs.is_empty() && refs.iter().all(|t| inner_tables.contains(t))
            };
            !is_sj_eq && !inner_only
        });

        for (i, (_, _, inner)) in tagged.iter().enumerate() {
            self.col_remap.insert(*inner, (temp_exec, i));
        }

        let m = self.materializations.len();
        self.materializations.push(Materialization {
            tables: inner_order,
            cond: conjoin(inner_conds).map(compile_cond),
            select: tagged.iter().map(|(_, _, inner)| *inner).collect(),
            temp_table: temp_exec,
            is_scan,
            materialized: false,
        });

        let mut tab = if is_scan {
            // Scan variant: equalities against the outer operands are
            // re-attached as ordinary pushdown conditions.
            for (i, (_, outer, _)) in tagged.iter().enumerate() {
                self.where_conjuncts.push(Expr::eq(
                    Expr::col(outer.0, outer.1),
                    Expr::col(temp_exec, i),
                ));
            }
            JoinTab::new(temp_exec, Access::Scan)
        } else {
            // Lookup variant: a unique ref over the temp table built
            // from the IN outer operands.
            let key = ref_key_for_index(
                &temp_schema,
                &(0..tagged.len()).collect::<Vec<_>>(),
                &tagged.iter().map(|(_, outer, _)| *outer).collect::<Vec<_>>(),
            );
            JoinTab::new(
                temp_exec,
                Access::Ref {
                    index_no: 0,
                    key: Rc::new(key),
                },
            )
        };
        tab.materialize = Some(m);
        let tab_idx = self.tabs.len();
        self.tabs.push(tab);
        Ok(tab_idx)
    }

    /// Places the FirstMatch, LooseScan and DuplicateWeedout execution
    /// hooks over the finalized ranges.
    fn place_strategies(&mut self, plan: &Plan) -> Result<(), PlanError> {
        let mut pos_idx = 0;
        while pos_idx < plan.positions.len() {
            let pos = &plan.positions[pos_idx];
            let n = pos.n_sj_tables.max(1);
            match pos.sj_strategy {
                SemiJoinStrategy::FirstMatch => {
                    let first_tab = self.tab_of_pos[pos_idx];
                    let last_tab = self.tab_of_pos[pos_idx + n - 1];
                    let mut jump_to = first_tab.checked_sub(1);
                    for t in first_tab..=last_tab {
                        let cat = self.tabs[t].table;
                        let in_nest = self
                            .query
                            .leaf_position(cat)
                            .and_then(|p| self.query.emb_sj_nest(p))
                            .is_some();
                        if in_nest {
                            self.tabs[t].first_sj_inner = Some(first_tab);
                            self.tabs[t].last_sj_inner = Some(last_tab);
                            self.tabs[t].only_first_match = true;
                        } else {
                            // Interleaved outer table: jump back only
                            // up to here.
                            jump_to = Some(t);
                        }
                    }
                    if let Some(jump) = jump_to {
                        self.tabs[last_tab].do_firstmatch = Some(jump);
                    }
                }
                SemiJoinStrategy::LooseScan => {
                    let first_tab = self.tab_of_pos[pos_idx];
                    let last_tab = self.tab_of_pos[pos_idx + n - 1];
                    self.tabs[first_tab].loosescan_match_tab = Some(last_tab);
                    for t in first_tab..=last_tab {
                        self.tabs[t].first_sj_inner = Some(first_tab);
                        self.tabs[t].last_sj_inner = Some(last_tab);
                    }
                    if last_tab > first_tab {
                        self.tabs[last_tab].do_firstmatch = Some(first_tab);
                    }
                }
                SemiJoinStrategy::DupsWeedout => {
                    let mut first_tab = self.tab_of_pos[pos_idx];
                    let last_tab = self.tab_of_pos[pos_idx + n - 1];
                    // Join buffering inside the range widens it to the
                    // start of the join so rowids cover all prefixes.
                    let buffered = (first_tab..=last_tab)
                        .any(|t| self.tabs[t].join_alg.is_some());
                    if buffered {
                        first_tab = 0;
                    }
                    // Only rowids of tables outside semi-join nests go
                    // into the tuple: inner fanout repeats exactly the
                    // outer rowid combinations.
                    let rowid_tabs: Vec<(usize, bool, usize)> = (first_tab..=last_tab)
                        .filter(|&t| {
                            let cat = self.tabs[t].table;
                            self.query
                                .leaf_position(cat)
                                .and_then(|p| self.query.emb_sj_nest(p))
                                .is_none()
                        })
                        .map(|t| {
                            let cat = self.tabs[t].table;
                            let maybe_null = self.tabs[t].first_inner.is_some();
                            let ref_len = self.stores[cat].borrow().ref_length();
                            (cat, maybe_null, ref_len)
                        })
                        .collect();
                    let w = self.weedouts.len();
                    self.weedouts.push(WeedoutTable::new(&rowid_tabs)?);
                    for &(cat, _, _) in &rowid_tabs {
                        for tab in self.tabs.iter_mut() {
                            if tab.table == cat {
                                tab.keep_current_rowid = true;
                            }
                        }
                    }
                    self.tabs[first_tab].flush_weedout = Some(w);
                    self.tabs[last_tab].check_weedout = Some(w);
                }
                _ => {}
            }
            pos_idx += n;
        }
        Ok(())
    }

    /// Attaches every WHERE conjunct at the first tab where all its
    /// tables are available; ON expressions of outer-joined tables go
    /// to their inner tab with a driving-side precondition split off.
    fn place_conditions(&mut self) -> Result<(), PlanError> {
        // Exec table -> tab index.
        let tab_of_table: Vec<Option<usize>> = {
            let mut v = vec![None; self.stores.len()];
            for (i, tab) in self.tabs.iter().enumerate() {
                v[tab.table] = Some(i);
            }
            v
        };
        let attach_point = |refs: &BTreeSet<usize>| -> usize {
            refs.iter()
                .map(|t| tab_of_table[*t].unwrap_or(0))
                .max()
                .unwrap_or(0)
        };

        let conjuncts = std::mem::take(&mut self.where_conjuncts);
        let mut per_tab_where: Vec<Vec<Expr>> = vec![Vec::new(); self.tabs.len()];
        let mut per_tab_scan: Vec<Vec<Expr>> = vec![Vec::new(); self.tabs.len()];
        for c in conjuncts {
            if matches!(c, Expr::True) {
                continue;
            }
            let refs = c.referenced_table_set();
            let at = attach_point(&refs);
            let own_table = self.tabs[at].table;
            if refs.len() == 1 && refs.contains(&own_table) {
                per_tab_scan[at].push(c.clone());
            }
            per_tab_where[at].push(c);
        }

        // Outer-join ON clauses.
        for (i, tab) in self.tabs.iter_mut().enumerate() {
            let cat = tab.table;
            let leaf = self
                .query
                .leaf_position(cat)
                .map(|p| self.query.leaves[p]);
            if let Some(leaf) = leaf {
                // The ON clause may sit on the leaf or on a wrapper
                // nest above it; multi-inner nests are the buffered
                // coordinator's concern and are not wired here.
                let mut node = Some(leaf);
                while let Some(id) = node {
                    if leaves_below(self.query, id) > 1 {
                        break;
                    }
                    if self.query.nodes[id].outer_join {
                        if let Some(on) = self.query.nodes[id].on_expr.clone() {
                            tab.first_inner = Some(i);
                            tab.last_inner = Some(i);
                            // Conjuncts over driving tables only become
                            // the append-time precondition.
                            let precond: Vec<Expr> = on
                                .conjuncts()
                                .into_iter()
                                .filter(|c| {
                                    !c.referenced_table_set().contains(&cat)
                                })
                                .cloned()
                                .collect();
                            if !precond.is_empty() {
                                tab.on_precond =
                                    conjoin(precond).map(compile_cond);
                            }
                            tab.on_cond = Some(compile_cond(on));
                        }
                        break;
                    }
                    node = self.query.nodes[id].parent;
                }
            }
        }

        for (i, (wh, sc)) in per_tab_where
            .into_iter()
            .zip(per_tab_scan.into_iter())
            .enumerate()
        {
            if let Some(cond) = conjoin(wh) {
                self.tabs[i].where_cond = Some(compile_cond(cond));
            }
            if let Some(cond) = conjoin(sc) {
                self.tabs[i].scan_cond = Some(compile_cond(cond));
            }
        }
        Ok(())
    }
}

/// Number of leaf tables in the subtree rooted at `id`.
fn leaves_below(query: &QueryBlock, id: usize) -> usize {
    match &query.nodes[id].kind {
        NodeKind::Leaf { .. } => 1,
        NodeKind::Nest { children, .. } => {
            children.iter().map(|&c| leaves_below(query, c)).sum()
        }
    }
}

/// Builds an executor key whose parts are laid out like the target
/// index's columns but read their values from other tables' columns.
fn ref_key_for_index(
    indexed_schema: &Rc<TableSchema>,
    index_cols: &[usize],
    source_cols: &[(usize, usize)],
) -> KeyDef {
    let parts = index_cols
        .iter()
        .zip(source_cols)
        .map(|(&icol, &(table, column))| {
            let col = &indexed_schema.columns[icol];
            let kind = match col.ty {
                ColumnType::BigInt | ColumnType::Double => KeyPartKind::Fixed(8),
                ColumnType::Char(n) => KeyPartKind::Fixed(n as usize),
                ColumnType::VarChar(n) => KeyPartKind::Var(n as usize),
                ColumnType::Blob => unreachable!("blob key part"),
            };
            KeyPart {
                table,
                column,
                kind,
                nullable: col.nullable,
                collation: col.collation,
            }
        })
        .collect();
    KeyDef::new(parts)
}
