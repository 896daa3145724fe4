//! Semi-join flattening: rewrites qualifying `IN (subquery)` predicates
//! into semi-join nests inside the outer block's FROM tree.
//!
//! The transformation is permanent: converted subqueries disappear from
//! the expression tree, their tables join the outer block renumbered
//! after the outer tables, and the subquery's WHERE plus one tagged
//! equality per IN operand become the nest's ON expression injected at
//! the insertion point.

use std::collections::BTreeSet;

use crate::bitmap::{TableMap, MAX_TABLES};
use crate::config::{OptimizerSwitch, PlannerConfig};
use crate::error::PlanError;
use crate::expr::Expr;
use crate::query::{Catalog, NodeId, NodeKind, QueryBlock, SjNestInfo};

/// Where a candidate IN predicate lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PredLoc {
    Where,
    NodeOn(NodeId),
}

/// Converts every eligible `IN (subquery)` predicate of the block, most
/// prioritized first, then pulls functionally dependent tables out of
/// the new nests.
pub fn convert_join_subqueries_to_semijoins(
    query: &mut QueryBlock,
    catalog: &Catalog,
    cfg: &PlannerConfig,
) -> Result<(), PlanError> {
    if !cfg.optimizer_switch.contains(OptimizerSwitch::SEMIJOIN) {
        return Ok(());
    }
    loop {
        let candidate = match best_candidate(query, catalog, cfg)? {
            Some(c) => c,
            None => break,
        };
        let (left, child) = extract_subquery(query, candidate);
        if query.table_count() + child.table_count() >= MAX_TABLES {
            return Err(PlanError::TooManyTables {
                needed: query.table_count() + child.table_count(),
                limit: MAX_TABLES,
            });
        }
        convert_subq_to_sj(query, left, *child, candidate)?;
    }
    pull_out_semijoin_tables(query, catalog);
    Ok(())
}

/// Finds the highest-priority eligible candidate. Correlated and wider
/// subqueries convert first.
fn best_candidate(
    query: &mut QueryBlock,
    catalog: &Catalog,
    cfg: &PlannerConfig,
) -> Result<Option<PredLoc>, PlanError> {
    if query.straight_join || query.exec_method_fixed || query.leaves.is_empty() {
        return Ok(None);
    }
    let own: BTreeSet<usize> = (0..query.leaves.len())
        .map(|p| query.leaf_catalog(p))
        .collect();

    let mut best: Option<(usize, PredLoc)> = None;
    let mut locations: Vec<(PredLoc, Option<Expr>)> = Vec::new();
    locations.push((PredLoc::Where, query.where_clause.take()));
    for id in 0..query.nodes.len() {
        locations.push((PredLoc::NodeOn(id), query.nodes[id].on_expr.take()));
    }

    for (loc, expr) in locations.iter_mut() {
        if let Some(expr) = expr.as_mut() {
            for item in top_level_mut(expr) {
                if let Expr::InSubquery { left, subquery } = item {
                    if !subquery_eligible(subquery) {
                        continue;
                    }
                    if left.len() != subquery.select.len() {
                        return Err(PlanError::OperandCountMismatch {
                            left: left.len(),
                            right: subquery.select.len(),
                        });
                    }
                    // Flatten the child's own subqueries bottom-up
                    // before judging it.
                    convert_join_subqueries_to_semijoins(subquery, catalog, cfg)?;
                    let outer: BTreeSet<usize> = subquery
                        .outer_references()
                        .into_iter()
                        .filter(|t| own.contains(t))
                        .collect();
                    let is_correlated = !outer.is_empty();
                    let priority = usize::from(is_correlated) * MAX_TABLES
                        + outer.len();
                    if best.map(|(p, _)| priority > p).unwrap_or(true) {
                        best = Some((priority, *loc));
                    }
                }
            }
        }
    }

    // Put the expressions back.
    for (loc, expr) in locations {
        match loc {
            PredLoc::Where => query.where_clause = expr,
            PredLoc::NodeOn(id) => query.nodes[id].on_expr = expr,
        }
    }
    Ok(best.map(|(_, loc)| loc))
}

fn top_level_mut(expr: &mut Expr) -> Vec<&mut Expr> {
    match expr {
        Expr::And(items) => items.iter_mut().collect(),
        other => vec![other],
    }
}

fn subquery_eligible(subquery: &QueryBlock) -> bool {
    !subquery.leaves.is_empty()
        && !subquery.has_group_by
        && !subquery.has_order_by
        && !subquery.has_having
        && !subquery.has_aggregates
        && !subquery.exec_method_fixed
}

/// Takes the first eligible IN predicate at the location out of the
/// tree, substituting the literal `TRUE`.
fn extract_subquery(
    query: &mut QueryBlock,
    loc: PredLoc,
) -> (Vec<Expr>, Box<QueryBlock>) {
    let holder = match loc {
        PredLoc::Where => &mut query.where_clause,
        PredLoc::NodeOn(id) => &mut query.nodes[id].on_expr,
    };
    let expr = holder.as_mut().expect("candidate location lost");
    for item in top_level_mut(expr) {
        let eligible = match item {
            Expr::InSubquery { subquery, .. } => subquery_eligible(subquery),
            _ => false,
        };
        if eligible {
            let taken = std::mem::replace(item, Expr::True);
            match taken {
                Expr::InSubquery { left, subquery } => return (left, subquery),
                _ => unreachable!(),
            }
        }
    }
    unreachable!("candidate location lost");
}

/// Converts one subquery predicate into a semi-join nest.
fn convert_subq_to_sj(
    query: &mut QueryBlock,
    left: Vec<Expr>,
    child: QueryBlock,
    loc: PredLoc,
) -> Result<(), PlanError> {
    // 1. Choose the insertion point.
    let emb_nest: Option<NodeId> = match loc {
        PredLoc::Where => None,
        PredLoc::NodeOn(id) => {
            let is_nest = matches!(query.nodes[id].kind, NodeKind::Nest { .. });
            let is_outer = query.nodes[id].outer_join;
            match (is_nest, is_outer) {
                // ... JOIN (...) ON (subquery AND ...): insert inside
                // the bracket nest.
                (true, _) => Some(id),
                // Inner join: the nest becomes the table's sibling.
                (false, false) => query.nodes[id].parent,
                // Outer join: wrap the table so the wrapper carries the
                // ON clause and the outer-join flag.
                (false, true) => {
                    let wrap = query.alloc_join_nest("(sj-wrap)");
                    query.nodes[wrap].on_expr = query.nodes[id].on_expr.take();
                    query.nodes[wrap].outer_join = query.nodes[id].outer_join;
                    query.nodes[id].outer_join = false;
                    let parent = query.nodes[id].parent;
                    match parent {
                        None => {
                            let at = query
                                .top_list
                                .iter()
                                .position(|&n| n == id)
                                .expect("node is in its list");
                            query.top_list[at] = wrap;
                        }
                        Some(p) => {
                            if let NodeKind::Nest { children, .. } =
                                &mut query.nodes[p].kind
                            {
                                let at = children
                                    .iter()
                                    .position(|&n| n == id)
                                    .expect("node is in its list");
                                children[at] = wrap;
                            }
                        }
                    }
                    if let NodeKind::Nest { children, .. } =
                        &mut query.nodes[wrap].kind
                    {
                        children.push(id);
                    }
                    Some(wrap)
                }
            }
        }
    };

    // 2. Create the nest and move the child's tables into it.
    let sj_nest = query.alloc_join_nest("(sj-nest)");
    let offset = query.nodes.len();
    let child_tables: Vec<usize> = (0..child.leaves.len())
        .map(|p| child.leaf_catalog(p))
        .collect();
    for node in &child.nodes {
        let mut copy = node.clone();
        copy.parent = None;
        if let NodeKind::Nest { children, .. } = &mut copy.kind {
            for c in children.iter_mut() {
                *c += offset;
            }
        }
        query.nodes.push(copy);
    }
    let moved: Vec<NodeId> = child.top_list.iter().map(|&n| n + offset).collect();
    if let NodeKind::Nest { children, .. } = &mut query.nodes[sj_nest].kind {
        *children = moved;
    }
    match emb_nest {
        None => query.top_list.push(sj_nest),
        Some(nest) => {
            if let NodeKind::Nest { children, .. } = &mut query.nodes[nest].kind {
                children.push(sj_nest);
            }
        }
    }
    // Renumber the bitmaps and rewire both chains.
    query.fix_chains();

    // 3. The semi-join ON expression: the child's WHERE conjoined with
    // one tagged equality per IN operand.
    let mut sj_on = child.where_clause.clone();
    for (i, (outer, inner)) in
        left.iter().zip(child.select.iter()).enumerate()
    {
        sj_on = Some(Expr::and_items(
            sj_on,
            Expr::tagged_eq(outer.clone(), inner.clone(), i),
        ));
    }

    // 4. Record the nest bookkeeping.
    let inner_set: BTreeSet<usize> = child_tables.iter().copied().collect();
    let corr_set: BTreeSet<usize> = child
        .outer_references()
        .into_iter()
        .filter(|t| query.leaf_position(*t).is_some() && !inner_set.contains(t))
        .collect();
    let mut depends_set = corr_set.clone();
    for e in &left {
        for t in e.referenced_table_set() {
            depends_set.insert(t);
        }
    }
    let info = SjNestInfo {
        inner_tables: inner_set,
        corr_tables: corr_set,
        depends_on: depends_set,
        sj_in_exprs: left.len(),
    };
    if let NodeKind::Nest { sj, .. } = &mut query.nodes[sj_nest].kind {
        *sj = Some(info);
    }

    // 5. Inject the semi-join ON expression into the parent's WHERE or
    // the embedding ON.
    if let Some(sj_on) = sj_on {
        match emb_nest {
            None => {
                query.where_clause = Some(Expr::and_items(
                    query.where_clause.take(),
                    sj_on,
                ));
            }
            Some(nest) => {
                let old = query.nodes[nest].on_expr.take();
                query.nodes[nest].on_expr = Some(Expr::and_items(old, sj_on));
            }
        }
    }
    tracing::debug!(
        "flattened IN subquery into semi-join nest of {} tables",
        child_tables.len()
    );
    Ok(())
}

/// Hoists semi-join inner tables whose row is functionally dependent on
/// tables outside the nest, via a unique-index ref with every key part
/// bound outside `sj_inner_tables`.
pub fn pull_out_semijoin_tables(query: &mut QueryBlock, catalog: &Catalog) {
    for nest in query.sj_nests() {
        loop {
            let inner = query.sj_inner_map(nest);
            let mut pulled_one = None;
            for pos in inner.positions() {
                if find_eq_ref_candidate(query, catalog, pos, inner) {
                    pulled_one = Some(pos);
                    break;
                }
            }
            let pos = match pulled_one {
                Some(p) => p,
                None => break,
            };
            let leaf = query.leaves[pos];
            let cat = query.leaf_catalog(pos);
            tracing::debug!(
                "pulling table '{}' out of its semi-join nest",
                query.nodes[leaf].alias
            );
            // Move the leaf up next to the nest; pulling a table out of
            // an uncorrelated subquery makes it correlated.
            detach_from_parent(query, leaf);
            match query.nodes[nest].parent {
                None => query.top_list.push(leaf),
                Some(p) => {
                    if let NodeKind::Nest { children, .. } =
                        &mut query.nodes[p].kind
                    {
                        children.push(leaf);
                    }
                }
            }
            query.fix_chains();
            if let Some(info) = query.nest_sj_info_mut(nest) {
                info.inner_tables.remove(&cat);
                info.corr_tables.insert(cat);
                info.depends_on.insert(cat);
            }
        }
        // Drop the nest entirely once nothing is left inside.
        if query
            .nest_sj_info(nest)
            .map(|i| i.inner_tables.is_empty())
            .unwrap_or(false)
        {
            detach_from_parent(query, nest);
            query.fix_chains();
        }
    }
}

fn detach_from_parent(query: &mut QueryBlock, id: NodeId) {
    match query.nodes[id].parent {
        None => query.top_list.retain(|&n| n != id),
        Some(p) => {
            if let NodeKind::Nest { children, .. } = &mut query.nodes[p].kind {
                children.retain(|&n| n != id);
            }
        }
    }
}

/// A table is functionally dependent when some unique index has every
/// key column equated, at the AND top level, to an expression whose
/// tables all lie outside the remaining semi-join inners.
fn find_eq_ref_candidate(
    query: &QueryBlock,
    catalog: &Catalog,
    leaf_pos: usize,
    sj_inner: TableMap,
) -> bool {
    let cat = query.leaf_catalog(leaf_pos);
    let store = catalog.store(cat);
    let store = store.borrow();
    let equalities = collect_equalities(query);
    for index_no in 0..store.index_count() {
        let def = store.index_def(index_no);
        if !def.unique {
            continue;
        }
        let all_bound = def.columns.iter().all(|&col| {
            equalities.iter().any(|(c, other)| {
                *c == (cat, col) && {
                    let map = query.map_of(other);
                    !map.intersects(sj_inner)
                }
            })
        });
        if all_bound {
            return true;
        }
    }
    false
}

/// Top-level equalities of the WHERE clause as
/// (column, tables-of-the-other-side) pairs.
fn collect_equalities(query: &QueryBlock) -> Vec<((usize, usize), BTreeSet<usize>)> {
    let mut out = Vec::new();
    if let Some(w) = &query.where_clause {
        for item in w.conjuncts() {
            if let Expr::Eq { left, right, .. } = item {
                if let Expr::Column { table, column } = **left {
                    out.push(((table, column), right.referenced_table_set()));
                }
                if let Expr::Column { table, column } = **right {
                    out.push(((table, column), left.referenced_table_set()));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockjoin_core::schema::{Column, ColumnType, TableSchema};
    use blockjoin_core::storage::{IndexDef, MemTable};
    use ntest::timeout;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_catalog(n: usize) -> Catalog {
        let mut catalog = Catalog::new();
        for i in 0..n {
            let schema = TableSchema::new(
                &format!("t{}", i + 1),
                vec![
                    Column::new("a", ColumnType::BigInt, false),
                    Column::new("b", ColumnType::BigInt, false),
                ],
            )
            .unwrap();
            catalog.add(Rc::new(RefCell::new(MemTable::new(schema))));
        }
        catalog
    }

    fn in_subquery(outer_col: Expr, inner_catalog: usize) -> Expr {
        let mut child = QueryBlock::new();
        child.add_table(inner_catalog, "inner");
        child.select = vec![Expr::col(inner_catalog, 0)];
        Expr::InSubquery {
            left: vec![outer_col],
            subquery: Box::new(child),
        }
    }

    #[test]
    #[timeout(1000)]
    fn test_where_in_becomes_sj_nest() {
        let catalog = test_catalog(2);
        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        query.select = vec![Expr::col(0, 0)];
        query.where_clause = Some(in_subquery(Expr::col(0, 0), 1));

        convert_join_subqueries_to_semijoins(
            &mut query,
            &catalog,
            &PlannerConfig::default(),
        )
        .unwrap();

        // One nest, two leaves, the IN replaced by TRUE plus the
        // injected tagged equality.
        let nests = query.sj_nests();
        assert_eq!(nests.len(), 1);
        assert_eq!(query.table_count(), 2);
        let info = query.nest_sj_info(nests[0]).unwrap();
        assert_eq!(info.sj_in_exprs, 1);
        let inner_pos = query.leaf_position(1).unwrap();
        assert!(query.sj_inner_map(nests[0]).contains(inner_pos));
        let conjuncts: Vec<Expr> = query
            .where_clause
            .as_ref()
            .unwrap()
            .conjuncts()
            .into_iter()
            .cloned()
            .collect();
        assert!(conjuncts.iter().any(|c| matches!(c, Expr::True)));
        assert!(conjuncts.iter().any(|c| matches!(
            c,
            Expr::Eq { in_equality_no: Some(0), .. }
        )));
    }

    #[test]
    #[timeout(1000)]
    fn test_operand_count_mismatch_is_error() {
        let catalog = test_catalog(2);
        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        let mut child = QueryBlock::new();
        child.add_table(1, "t2");
        child.select = vec![Expr::col(1, 0), Expr::col(1, 1)];
        query.where_clause = Some(Expr::InSubquery {
            left: vec![Expr::col(0, 0)],
            subquery: Box::new(child),
        });

        let result = convert_join_subqueries_to_semijoins(
            &mut query,
            &catalog,
            &PlannerConfig::default(),
        );
        assert!(matches!(
            result,
            Err(PlanError::OperandCountMismatch { left: 1, right: 2 })
        ));
    }

    #[test]
    #[timeout(1000)]
    fn test_straight_join_blocks_conversion() {
        let catalog = test_catalog(2);
        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        query.straight_join = true;
        query.where_clause = Some(in_subquery(Expr::col(0, 0), 1));

        convert_join_subqueries_to_semijoins(
            &mut query,
            &catalog,
            &PlannerConfig::default(),
        )
        .unwrap();
        assert!(query.sj_nests().is_empty());
        assert!(matches!(
            query.where_clause,
            Some(Expr::InSubquery { .. })
        ));
    }

    #[test]
    #[timeout(1000)]
    fn test_semijoin_switch_off_blocks_conversion() {
        let catalog = test_catalog(2);
        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        query.where_clause = Some(in_subquery(Expr::col(0, 0), 1));

        let cfg = PlannerConfig {
            optimizer_switch: OptimizerSwitch::all()
                - OptimizerSwitch::SEMIJOIN,
            ..PlannerConfig::default()
        };
        convert_join_subqueries_to_semijoins(&mut query, &catalog, &cfg)
            .unwrap();
        assert!(query.sj_nests().is_empty());
    }

    #[test]
    #[timeout(1000)]
    fn test_outer_join_gets_wrap_nest() {
        let catalog = test_catalog(3);
        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        let on = Expr::and_items(
            Some(Expr::eq(Expr::col(0, 0), Expr::col(1, 0))),
            in_subquery(Expr::col(1, 1), 2),
        );
        let t2 = query.add_left_join(1, "t2", on);

        convert_join_subqueries_to_semijoins(
            &mut query,
            &catalog,
            &PlannerConfig::default(),
        )
        .unwrap();

        // The outer-joined table is wrapped; the wrapper carries the ON
        // clause and the outer-join flag, the table no longer does.
        let wrap = query.nodes[t2].parent.expect("t2 must be wrapped");
        assert!(query.nodes[wrap].outer_join);
        assert!(query.nodes[wrap].on_expr.is_some());
        assert!(!query.nodes[t2].outer_join);
        assert_eq!(query.sj_nests().len(), 1);
        // The sj nest lives inside the wrapper.
        let nest = query.sj_nests()[0];
        assert_eq!(query.nodes[nest].parent, Some(wrap));
    }

    #[test]
    #[timeout(1000)]
    fn test_pull_out_functionally_dependent_table() {
        let mut catalog = test_catalog(2);
        // t3 has a unique index on column a.
        let schema = TableSchema::new(
            "t3",
            vec![
                Column::new("a", ColumnType::BigInt, false),
                Column::new("b", ColumnType::BigInt, false),
            ],
        )
        .unwrap();
        let mut t3 = MemTable::new(schema);
        t3.add_index(IndexDef {
            columns: vec![0],
            unique: true,
        });
        catalog.add(Rc::new(RefCell::new(t3)));

        let mut query = QueryBlock::new();
        query.add_table(0, "t1");
        // Subquery over t2, t3 where t3.a = t1.a: t3 is functionally
        // dependent on the outer table through its unique index.
        let mut child = QueryBlock::new();
        child.add_table(1, "t2");
        child.add_table(2, "t3");
        child.where_clause =
            Some(Expr::eq(Expr::col(2, 0), Expr::col(0, 0)));
        child.select = vec![Expr::col(1, 0)];
        query.where_clause = Some(Expr::InSubquery {
            left: vec![Expr::col(0, 0)],
            subquery: Box::new(child),
        });

        convert_join_subqueries_to_semijoins(
            &mut query,
            &catalog,
            &PlannerConfig::default(),
        )
        .unwrap();

        let nests = query.sj_nests();
        assert_eq!(nests.len(), 1);
        // t3 was pulled out: only t2 remains inner, and the pull marked
        // the nest correlated with t3.
        let t3_pos = query.leaf_position(2).unwrap();
        let t2_pos = query.leaf_position(1).unwrap();
        assert!(!query.sj_inner_map(nests[0]).contains(t3_pos));
        assert!(query.sj_inner_map(nests[0]).contains(t2_pos));
        assert!(query.sj_corr_map(nests[0]).contains(t3_pos));
    }
}
