//! Shared fixtures for the executor tests.

use std::cell::RefCell;
use std::rc::Rc;

use blockjoin_core::exec::CondFn;
use blockjoin_core::keys::Rows;
use blockjoin_core::schema::{Column, ColumnType, TableSchema};
use blockjoin_core::storage::{IndexDef, MemTable};
use blockjoin_core::value::{Collation, Value};

/// Builds an all-`BigInt` table with the given rows. A `None` cell is a
/// NULL (the column becomes nullable).
pub fn int_table(
    name: &str,
    cols: &[&str],
    rows: &[&[Option<i64>]],
) -> Rc<RefCell<MemTable>> {
    let nullable: Vec<bool> = (0..cols.len())
        .map(|c| rows.iter().any(|r| r[c].is_none()))
        .collect();
    let columns = cols
        .iter()
        .zip(&nullable)
        .map(|(&n, &nl)| Column::new(n, ColumnType::BigInt, nl))
        .collect();
    let schema = TableSchema::new(name, columns).unwrap();
    let mut table = MemTable::new(schema);
    for row in rows {
        let values: Vec<Value> = row
            .iter()
            .map(|v| v.map(Value::Int).unwrap_or(Value::Null))
            .collect();
        table.push_values(&values).unwrap();
    }
    Rc::new(RefCell::new(table))
}

/// Adds an index over the given columns; the table must still be empty.
pub fn with_index(
    table: &Rc<RefCell<MemTable>>,
    columns: &[usize],
    unique: bool,
) -> usize {
    table.borrow_mut().add_index(IndexDef {
        columns: columns.to_vec(),
        unique,
    })
}

/// Equality predicate between two columns.
pub fn eq_cond(t1: usize, c1: usize, t2: usize, c2: usize) -> CondFn {
    Rc::new(move |rows: &dyn Rows| {
        let a = rows.row(t1).value(c1);
        let b = rows.row(t2).value(c2);
        a.sql_eq(&b, Collation::Binary)
    })
}

/// Predicate comparing a column against an integer constant.
pub fn gt_const_cond(t: usize, c: usize, limit: i64) -> CondFn {
    Rc::new(move |rows: &dyn Rows| match rows.row(t).value(c) {
        Value::Int(v) => v > limit,
        _ => false,
    })
}

/// Collects output rows as optional integers for easy comparison.
pub fn int_rows(out: Vec<Vec<Value>>) -> Vec<Vec<Option<i64>>> {
    out.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| match v {
                    Value::Int(i) => Some(i),
                    Value::Null => None,
                    other => panic!("unexpected value {:?}", other),
                })
                .collect()
        })
        .collect()
}

/// Sorts rows for order-insensitive comparison.
pub fn sorted(mut rows: Vec<Vec<Option<i64>>>) -> Vec<Vec<Option<i64>>> {
    rows.sort();
    rows
}
