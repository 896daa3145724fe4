//! End-to-end semi-join strategy tests: flatten, plan, execute.

use blockjoin_core::storage::Handler;
use blockjoin_core::ExecConfig;
use blockjoin_core::SemiJoinStrategy;

use blockjoin_plan::cost::CostModel;
use blockjoin_plan::query::Catalog;
use blockjoin_plan::{optimize, OptimizerSwitch, PlannerConfig};

use super::helpers::*;

fn config_with(switches: OptimizerSwitch) -> PlannerConfig {
    PlannerConfig {
        optimizer_switch: switches,
        ..PlannerConfig::default()
    }
}

fn strategies(plan: &blockjoin_plan::planner::Plan) -> Vec<SemiJoinStrategy> {
    plan.positions
        .iter()
        .map(|p| p.sj_strategy)
        .filter(|s| *s != SemiJoinStrategy::None)
        .collect()
}

#[test]
fn test_semijoin_first_match() {
    // SELECT t1.a FROM t1 WHERE t1.a IN (SELECT t2.b FROM t2):
    // one output row per outer row, inner duplicates do not fan out.
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 1, 2]);
    let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 2, 2]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(OptimizerSwitch::SEMIJOIN | OptimizerSwitch::FIRSTMATCH);
    let (plan, mut join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert_eq!(strategies(&plan), vec![SemiJoinStrategy::FirstMatch]);

    join.exec().unwrap();
    assert_eq!(int_output(join.take_output()), vec![1, 1, 2]);
}

#[test]
fn test_semijoin_dups_weedout() {
    // Same data, DuplicateWeedout forced: the weedout table keys on the
    // single rowid of t1 and ends up with exactly three entries.
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 1, 2]);
    let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 2, 2]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(
        OptimizerSwitch::SEMIJOIN
            | OptimizerSwitch::DUPSWEEDOUT
            | OptimizerSwitch::JOIN_CACHE_HASHED,
    );
    let (plan, mut join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert_eq!(strategies(&plan), vec![SemiJoinStrategy::DupsWeedout]);

    join.exec().unwrap();
    assert_eq!(int_output(join.take_output()), vec![1, 1, 2]);
    assert_eq!(join.weedouts.len(), 1);
    assert_eq!(join.weedouts[0].row_count(), 3);
}

#[test]
fn test_semijoin_materialization_lookup() {
    // t2.b has duplicates; the materialized table is distinct and each
    // outer row probes it with a unique lookup.
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 4]);
    let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 2, 2, 3, 3, 3]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::MATERIALIZATION,
    );
    let (plan, mut join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert!(strategies(&plan)
        .iter()
        .all(|s| matches!(
            s,
            SemiJoinStrategy::Materialize | SemiJoinStrategy::MaterializeScan
        )));

    join.exec().unwrap();
    assert_eq!(int_output(join.take_output()), vec![1]);
    // The temp table holds the distinct inner rows {1, 2, 3}.
    let temp = join.stores.last().unwrap();
    assert_eq!(temp.borrow().row_count(), 3);
}

#[test]
fn test_semijoin_loose_scan() {
    // An index on t2.b exposes the IN-equality through its first
    // keypart: LooseScan reads one representative row per distinct key.
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 1, 2]);
    let t2 = add_indexed_int_table(&mut catalog, "t2", "b", &[1, 2, 2]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(OptimizerSwitch::SEMIJOIN | OptimizerSwitch::LOOSESCAN);
    let (plan, mut join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert_eq!(strategies(&plan), vec![SemiJoinStrategy::LooseScan]);

    join.exec().unwrap();
    assert_eq!(int_output(join.take_output()), vec![1, 1, 2]);
}

#[test]
fn test_strategy_selection_monotonicity() {
    // With every strategy available, FirstMatch covers the nest at the
    // same position as DuplicateWeedout but costs strictly less under
    // the default model, so the planner must pick it.
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 1, 2]);
    let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 2, 2]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(OptimizerSwitch::all());
    let (plan, _join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert_eq!(strategies(&plan), vec![SemiJoinStrategy::FirstMatch]);

    // Removing the cheaper candidate falls back to the fallback
    // strategy rather than producing no coverage.
    let mut catalog2 = Catalog::new();
    let t1b = add_int_table(&mut catalog2, "t1", "a", &[1, 1, 2]);
    let t2b = add_int_table(&mut catalog2, "t2", "b", &[1, 2, 2]);
    let mut query2 = in_subquery_block(t1b, t2b);
    let cfg2 = config_with(
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::DUPSWEEDOUT,
    );
    let (plan2, _join2) = optimize(
        &mut query2,
        &catalog2,
        &cfg2,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    assert_eq!(strategies(&plan2), vec![SemiJoinStrategy::DupsWeedout]);
}

#[test]
fn test_semijoin_output_has_no_inner_fanout() {
    // The projection onto the outer table never contains duplicates
    // attributable to the inner tables, whatever strategy runs.
    let all = [
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::FIRSTMATCH,
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::DUPSWEEDOUT,
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::MATERIALIZATION,
    ];
    for switches in all {
        let mut catalog = Catalog::new();
        let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 2, 3, 5]);
        let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 1, 1, 2, 2, 4]);
        let mut query = in_subquery_block(t1, t2);
        let (_plan, mut join) = optimize(
            &mut query,
            &catalog,
            &config_with(switches),
            &CostModel::default(),
            ExecConfig::default(),
        )
        .unwrap();
        join.exec().unwrap();
        assert_eq!(
            int_output(join.take_output()),
            vec![1, 2],
            "switches {:?}",
            switches
        );
    }
}

#[test]
fn test_prepared_reexecution_truncates_temp_tables() {
    let mut catalog = Catalog::new();
    let t1 = add_int_table(&mut catalog, "t1", "a", &[1, 4]);
    let t2 = add_int_table(&mut catalog, "t2", "b", &[1, 2, 2]);
    let mut query = in_subquery_block(t1, t2);

    let cfg = config_with(
        OptimizerSwitch::SEMIJOIN | OptimizerSwitch::MATERIALIZATION,
    );
    let (_plan, mut join) = optimize(
        &mut query,
        &catalog,
        &cfg,
        &CostModel::default(),
        ExecConfig::default(),
    )
    .unwrap();
    join.exec().unwrap();
    let first = int_output(join.take_output());
    join.exec().unwrap();
    let second = int_output(join.take_output());
    assert_eq!(first, second);
    assert_eq!(first, vec![1]);
    let temp = join.stores.last().unwrap();
    assert_eq!(temp.borrow().row_count(), 2);
}
