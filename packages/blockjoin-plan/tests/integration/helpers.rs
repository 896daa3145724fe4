//! Shared fixtures for the planner tests.

use std::cell::RefCell;
use std::rc::Rc;

use blockjoin_core::schema::{Column, ColumnType, TableSchema};
use blockjoin_core::storage::{IndexDef, MemTable};
use blockjoin_core::value::Value;

use blockjoin_plan::expr::Expr;
use blockjoin_plan::query::{Catalog, QueryBlock};

/// Adds a single-`BigInt`-column table to the catalog.
pub fn add_int_table(
    catalog: &mut Catalog,
    name: &str,
    col: &str,
    values: &[i64],
) -> usize {
    let schema = TableSchema::new(
        name,
        vec![Column::new(col, ColumnType::BigInt, false)],
    )
    .unwrap();
    let mut table = MemTable::new(schema);
    for &v in values {
        table.push_values(&[Value::Int(v)]).unwrap();
    }
    catalog.add(Rc::new(RefCell::new(table)))
}

/// Same, with a (non-unique) index over the column.
pub fn add_indexed_int_table(
    catalog: &mut Catalog,
    name: &str,
    col: &str,
    values: &[i64],
) -> usize {
    let schema = TableSchema::new(
        name,
        vec![Column::new(col, ColumnType::BigInt, false)],
    )
    .unwrap();
    let mut table = MemTable::new(schema);
    table.add_index(IndexDef {
        columns: vec![0],
        unique: false,
    });
    for &v in values {
        table.push_values(&[Value::Int(v)]).unwrap();
    }
    catalog.add(Rc::new(RefCell::new(table)))
}

/// `SELECT t_outer.c FROM t_outer WHERE t_outer.c IN (SELECT t_inner.c
/// FROM t_inner)`.
pub fn in_subquery_block(outer: usize, inner: usize) -> QueryBlock {
    let mut query = QueryBlock::new();
    query.add_table(outer, "outer");
    query.select = vec![Expr::col(outer, 0)];
    let mut child = QueryBlock::new();
    child.add_table(inner, "inner");
    child.select = vec![Expr::col(inner, 0)];
    query.where_clause = Some(Expr::InSubquery {
        left: vec![Expr::col(outer, 0)],
        subquery: Box::new(child),
    });
    query
}

/// Collects output integers of single-column result rows.
pub fn int_output(rows: Vec<Vec<Value>>) -> Vec<i64> {
    let mut out: Vec<i64> = rows
        .into_iter()
        .map(|r| match &r[0] {
            Value::Int(v) => *v,
            other => panic!("unexpected value {:?}", other),
        })
        .collect();
    out.sort();
    out
}
