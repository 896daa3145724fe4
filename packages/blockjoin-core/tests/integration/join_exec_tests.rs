//! End-to-end tests of the buffered join algorithms.

use std::rc::Rc;

use blockjoin_core::cache::hashed::HashConfig;
use blockjoin_core::exec::{Access, CondFn, Join, JoinAlg, JoinTab};
use blockjoin_core::keys::{KeyDef, Rows};
use blockjoin_core::schema::TableSchema;
use blockjoin_core::storage::Handler;
use blockjoin_core::ExecConfig;
use blockjoin_core::JoinError;

use super::helpers::*;

fn and2(a: CondFn, b: CondFn) -> CondFn {
    Rc::new(move |rows: &dyn Rows| a(rows) && b(rows))
}

fn schemas_of(join: &Join) -> Vec<Rc<TableSchema>> {
    join.stores
        .iter()
        .map(|s| s.borrow().schema().clone())
        .collect()
}

#[test]
fn test_bnl_inner_join() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)], &[Some(3)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(2)], &[Some(3)], &[Some(4)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(rows, vec![vec![Some(2), Some(2)], vec![Some(3), Some(3)]]);
}

#[test]
fn test_bnl_left_join_null_complement() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(2)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.first_inner = Some(1);
    tab1.last_inner = Some(1);
    tab1.on_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(rows, vec![vec![Some(1), None], vec![Some(2), Some(2)]]);
}

#[test]
fn test_bnlh_hash_join() {
    let t1 = int_table(
        "t1",
        &["a"],
        &[&[Some(1)], &[Some(1)], &[Some(2)], &[Some(3)]],
    );
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(3)], &[Some(5)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnlh);
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    let schemas = schemas_of(&join);
    join.tabs[1].hash = Some(HashConfig {
        build_key: Rc::new(KeyDef::for_columns(&schemas, &[(0, 0)])),
        probe_key: Rc::new(KeyDef::for_columns(&schemas, &[(1, 0)])),
    });
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(
        rows,
        vec![
            vec![Some(1), Some(1)],
            vec![Some(1), Some(1)],
            vec![Some(3), Some(3)],
        ]
    );
}

#[test]
fn test_bka_join() {
    let t1 = int_table(
        "t1",
        &["a"],
        &[&[Some(1)], &[Some(2)], &[Some(3)], &[Some(3)]],
    );
    let t2 = int_table("t2", &["b"], &[]);
    let idx = with_index(&t2, &[0], false);
    for b in [2i64, 3, 4] {
        t2.borrow_mut()
            .push_values(&[blockjoin_core::value::Value::Int(b)])
            .unwrap();
    }

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, JoinTab::new(1, Access::Scan)],
        vec![(0, 0), (1, 0)],
    );
    let schemas = schemas_of(&join);
    let ref_key = Rc::new(KeyDef::for_columns(&schemas, &[(0, 0)]));
    join.tabs[1].access = Access::Ref {
        index_no: idx,
        key: ref_key,
    };
    join.tabs[1].join_alg = Some(JoinAlg::Bka);
    join.tabs[1].where_cond = Some(eq_cond(0, 0, 1, 0));

    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(
        rows,
        vec![
            vec![Some(2), Some(2)],
            vec![Some(3), Some(3)],
            vec![Some(3), Some(3)],
        ]
    );
}

#[test]
fn test_bkah_join() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(1)], &[Some(3)]]);
    let t2 = int_table("t2", &["b"], &[]);
    let idx = with_index(&t2, &[0], false);
    for b in [1i64, 2, 3] {
        t2.borrow_mut()
            .push_values(&[blockjoin_core::value::Value::Int(b)])
            .unwrap();
    }

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, JoinTab::new(1, Access::Scan)],
        vec![(0, 0), (1, 0)],
    );
    let schemas = schemas_of(&join);
    let ref_key = Rc::new(KeyDef::for_columns(&schemas, &[(0, 0)]));
    join.tabs[1].access = Access::Ref {
        index_no: idx,
        key: ref_key.clone(),
    };
    join.tabs[1].join_alg = Some(JoinAlg::Bkah);
    join.tabs[1].hash = Some(HashConfig {
        build_key: ref_key,
        probe_key: Rc::new(KeyDef::for_columns(&schemas, &[(1, 0)])),
    });
    join.tabs[1].where_cond = Some(eq_cond(0, 0, 1, 0));

    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(
        rows,
        vec![
            vec![Some(1), Some(1)],
            vec![Some(1), Some(1)],
            vec![Some(3), Some(3)],
        ]
    );
}

#[test]
fn test_chained_buffers() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(2)], &[Some(3)]]);
    let t3 = int_table("t3", &["c"], &[&[Some(2)], &[Some(3)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));
    let mut tab2 = JoinTab::new(2, Access::Scan);
    tab2.join_alg = Some(JoinAlg::Bnl);
    tab2.where_cond = Some(eq_cond(1, 0, 2, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2, t3],
        vec![tab0, tab1, tab2],
        vec![(0, 0), (1, 0), (2, 0)],
    );
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    // Only a=b=c=2 survives both equalities.
    assert_eq!(rows, vec![vec![Some(2), Some(2), Some(2)]]);
}

#[test]
fn test_outer_join_completeness_with_refills() {
    // A buffer floor-sized configuration forces many fills; every
    // driving row must come out exactly once, matched or
    // null-complemented.
    let left: Vec<Vec<Option<i64>>> = (0..40).map(|v| vec![Some(v)]).collect();
    let left_refs: Vec<&[Option<i64>]> =
        left.iter().map(|r| r.as_slice()).collect();
    let right: Vec<Vec<Option<i64>>> =
        (0..40).step_by(2).map(|v| vec![Some(v)]).collect();
    let right_refs: Vec<&[Option<i64>]> =
        right.iter().map(|r| r.as_slice()).collect();
    let t1 = int_table("t1", &["a"], &left_refs);
    let t2 = int_table("t2", &["b"], &right_refs);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.first_inner = Some(1);
    tab1.last_inner = Some(1);
    tab1.on_cond = Some(eq_cond(0, 0, 1, 0));

    let cfg = ExecConfig {
        join_buffer_size: 1, // floor-sized: a couple of records per fill
        ..ExecConfig::default()
    };
    let mut join = Join::new(cfg, vec![t1, t2], vec![tab0, tab1], vec![(0, 0), (1, 0)]);
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(rows.len(), 40);
    for v in 0..40i64 {
        let expected = if v % 2 == 0 {
            vec![Some(v), Some(v)]
        } else {
            vec![Some(v), None]
        };
        assert!(rows.contains(&expected), "missing row for {}", v);
    }
}

#[test]
fn test_impossible_precondition_still_null_complements() {
    // LEFT JOIN ... ON t1.a = t2.b AND t1.a > 1: rows failing the
    // driving-side precondition are flagged impossible at append time,
    // skipped during matching, and still null-complemented.
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)], &[Some(5)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(2)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.first_inner = Some(1);
    tab1.last_inner = Some(1);
    tab1.on_cond = Some(and2(eq_cond(0, 0, 1, 0), gt_const_cond(0, 0, 1)));
    tab1.on_precond = Some(gt_const_cond(0, 0, 1));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(
        rows,
        vec![
            vec![Some(1), None],
            vec![Some(2), Some(2)],
            vec![Some(5), None],
        ]
    );
}

#[test]
fn test_semijoin_first_match_buffered() {
    // t1.a IN (SELECT t2.b ...) with buffered first-match semantics:
    // one output row per driving row, inner duplicates do not fan out.
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(1)], &[Some(2)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(2)], &[Some(2)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.first_sj_inner = Some(1);
    tab1.last_sj_inner = Some(1);
    tab1.only_first_match = true;
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0)],
    );
    join.exec().unwrap();
    let rows = sorted(int_rows(join.take_output()));
    assert_eq!(rows, vec![vec![Some(1)], vec![Some(1)], vec![Some(2)]]);
}

#[test]
fn test_skip_last_excludes_in_flight_record() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)], &[Some(3)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(2)], &[Some(3)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    // Stage two driving rows by hand, keep the third in flight.
    join.prepare().unwrap();
    for a in [1i64, 2] {
        join.tables[0]
            .row
            .set_value(0, &blockjoin_core::value::Value::Int(a))
            .unwrap();
        join.cache_put_record(1, 0).unwrap();
    }
    join.tables[0]
        .row
        .set_value(0, &blockjoin_core::value::Value::Int(3))
        .unwrap();
    join.cache_join_records(0, true).unwrap();
    let rows = sorted(int_rows(join.take_output()));
    // The in-flight record (a=3) is excluded from matching.
    assert_eq!(rows, vec![vec![Some(1), Some(1)], vec![Some(2), Some(2)]]);
    // The driving row survives the flush.
    assert_eq!(
        join.tables[0].row.value(0),
        blockjoin_core::value::Value::Int(3)
    );
}

#[test]
fn test_match_flag_set_once() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.first_sj_inner = Some(1);
    tab1.last_sj_inner = Some(1);
    tab1.only_first_match = true;
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0)],
    );
    join.prepare().unwrap();
    join.tables[0]
        .row
        .set_value(0, &blockjoin_core::value::Value::Int(1))
        .unwrap();
    join.cache_put_record(1, 0).unwrap();
    let fields_pos = join.caches[0].curr_rec_pos();
    assert!(join.set_match_flag_if_none(1, 0, fields_pos));
    assert!(!join.set_match_flag_if_none(1, 0, fields_pos));
    assert!(!join.set_match_flag_if_none(1, 0, fields_pos));
}

#[test]
fn test_kill_aborts_execution() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(1)], &[Some(2)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    // Kill cooperatively from inside a pushdown predicate; the next
    // poll between candidate records must abort the query.
    let handle = join.kill_handle();
    join.tabs[1].where_cond = Some(Rc::new(move |_rows: &dyn Rows| {
        handle.kill();
        true
    }));
    match join.exec() {
        Err(JoinError::Killed) => {}
        other => panic!("expected Killed, got {:?}", other),
    }
}

#[test]
fn test_reexecution_truncates_and_repeats() {
    let t1 = int_table("t1", &["a"], &[&[Some(1)], &[Some(2)]]);
    let t2 = int_table("t2", &["b"], &[&[Some(2)], &[Some(3)]]);

    let tab0 = JoinTab::new(0, Access::Scan);
    let mut tab1 = JoinTab::new(1, Access::Scan);
    tab1.join_alg = Some(JoinAlg::Bnl);
    tab1.where_cond = Some(eq_cond(0, 0, 1, 0));

    let mut join = Join::new(
        ExecConfig::default(),
        vec![t1, t2],
        vec![tab0, tab1],
        vec![(0, 0), (1, 0)],
    );
    join.exec().unwrap();
    let first = sorted(int_rows(join.take_output()));
    join.exec().unwrap();
    let second = sorted(int_rows(join.take_output()));
    assert_eq!(first, second);
    assert_eq!(first, vec![vec![Some(2), Some(2)]]);
}
