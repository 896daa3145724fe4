//! Scalar expressions over join-table columns.
//!
//! The planner manipulates these structurally: the flattener splits
//! AND lists, injects tagged IN-equalities and substitutes `TRUE` for
//! converted predicates. At setup time expressions compile into the
//! executor's pushdown closures.

use std::collections::BTreeSet;
use std::rc::Rc;

use blockjoin_core::exec::CondFn;
use blockjoin_core::keys::Rows;
use blockjoin_core::value::{Collation, Value};

use crate::query::QueryBlock;

/// A scalar expression. Columns name a catalog table and a column
/// within it; the executor's table list is laid out in catalog order,
/// so the same indices address rows at execution time.
#[derive(Debug, Clone)]
pub enum Expr {
    Column { table: usize, column: usize },
    Literal(Value),
    True,
    Eq {
        left: Box<Expr>,
        right: Box<Expr>,
        /// Operand index of an equality injected by semi-join
        /// flattening; used by LooseScan and the materialization
        /// finalizer
        in_equality_no: Option<usize>,
    },
    Gt(Box<Expr>, Box<Expr>),
    IsNull(Box<Expr>),
    And(Vec<Expr>),
    /// `(left...) IN (SELECT ...)`; removed by flattening
    InSubquery {
        left: Vec<Expr>,
        subquery: Box<QueryBlock>,
    },
}

impl Expr {
    pub fn col(table: usize, column: usize) -> Expr {
        Expr::Column { table, column }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Eq {
            left: Box::new(left),
            right: Box::new(right),
            in_equality_no: None,
        }
    }

    pub fn tagged_eq(left: Expr, right: Expr, no: usize) -> Expr {
        Expr::Eq {
            left: Box::new(left),
            right: Box::new(right),
            in_equality_no: Some(no),
        }
    }

    /// Conjoins two optional conditions, flattening AND lists.
    pub fn and_items(a: Option<Expr>, b: Expr) -> Expr {
        match a {
            None => b,
            Some(Expr::And(mut items)) => {
                items.push(b);
                Expr::And(items)
            }
            Some(other) => Expr::And(vec![other, b]),
        }
    }

    /// The top-level AND conjuncts of this expression.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    pub fn into_conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::And(items) => items,
            other => vec![other],
        }
    }

    /// Catalog tables this expression refers to, not descending into
    /// subqueries (a subquery's own tables are not references of the
    /// enclosing block).
    pub fn referenced_tables(&self, out: &mut BTreeSet<usize>) {
        match self {
            Expr::Column { table, .. } => {
                out.insert(*table);
            }
            Expr::Literal(_) | Expr::True => {}
            Expr::Eq { left, right, .. } => {
                left.referenced_tables(out);
                right.referenced_tables(out);
            }
            Expr::Gt(left, right) => {
                left.referenced_tables(out);
                right.referenced_tables(out);
            }
            Expr::IsNull(inner) => inner.referenced_tables(out),
            Expr::And(items) => {
                for item in items {
                    item.referenced_tables(out);
                }
            }
            Expr::InSubquery { left, subquery } => {
                for item in left {
                    item.referenced_tables(out);
                }
                // Outer references of the child surface as references
                // of this block too.
                for table in subquery.outer_references() {
                    out.insert(table);
                }
            }
        }
    }

    pub fn referenced_table_set(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.referenced_tables(&mut out);
        out
    }

    /// Replaces `old` with `new` at the AND top level. Returns whether
    /// a replacement happened.
    pub fn replace_top_level(&mut self, matches: &dyn Fn(&Expr) -> bool, new: Expr) -> bool {
        if matches(self) {
            *self = new;
            return true;
        }
        if let Expr::And(items) = self {
            for item in items.iter_mut() {
                if matches(item) {
                    *item = new;
                    return true;
                }
            }
        }
        false
    }

    /// Evaluates the expression over the current rows. Comparisons with
    /// NULL yield NULL; `And` treats NULL as false.
    pub fn eval(&self, rows: &dyn Rows) -> Value {
        match self {
            Expr::Column { table, column } => rows.row(*table).value(*column),
            Expr::Literal(v) => v.clone(),
            Expr::True => Value::Int(1),
            Expr::Eq { left, right, .. } => {
                let l = left.eval(rows);
                let r = right.eval(rows);
                if l.is_null() || r.is_null() {
                    Value::Null
                } else {
                    Value::Int(i64::from(l.sql_eq(&r, Collation::Binary)))
                }
            }
            Expr::Gt(left, right) => {
                let l = left.eval(rows);
                let r = right.eval(rows);
                match (l, r) {
                    (Value::Null, _) | (_, Value::Null) => Value::Null,
                    (Value::Int(a), Value::Int(b)) => Value::Int(i64::from(a > b)),
                    (Value::Double(a), Value::Double(b)) => {
                        Value::Int(i64::from(a > b))
                    }
                    (Value::Bytes(a), Value::Bytes(b)) => {
                        Value::Int(i64::from(a > b))
                    }
                    _ => Value::Int(0),
                }
            }
            Expr::IsNull(inner) => {
                Value::Int(i64::from(inner.eval(rows).is_null()))
            }
            Expr::And(items) => {
                for item in items {
                    match item.eval(rows) {
                        Value::Int(v) if v != 0 => continue,
                        _ => return Value::Int(0),
                    }
                }
                Value::Int(1)
            }
            Expr::InSubquery { .. } => {
                unreachable!("IN subqueries are removed by flattening")
            }
        }
    }

    /// `true` iff the expression evaluates to a true value.
    pub fn is_true(&self, rows: &dyn Rows) -> bool {
        matches!(self.eval(rows), Value::Int(v) if v != 0)
    }
}

/// Compiles an expression into an executor pushdown closure.
pub fn compile_cond(expr: Expr) -> CondFn {
    Rc::new(move |rows: &dyn Rows| expr.is_true(rows))
}

/// Conjoins a list of expressions into one condition, if any.
pub fn conjoin(items: Vec<Expr>) -> Option<Expr> {
    let mut result = None;
    for item in items {
        result = Some(Expr::and_items(result, item));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(1000)]
    fn test_and_items_flattens() {
        let a = Expr::and_items(None, Expr::True);
        let b = Expr::and_items(Some(a), Expr::eq(Expr::col(0, 0), Expr::col(1, 0)));
        let c = Expr::and_items(Some(b), Expr::True);
        match &c {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    #[timeout(1000)]
    fn test_referenced_tables() {
        let e = Expr::and_items(
            Some(Expr::eq(Expr::col(0, 0), Expr::col(2, 1))),
            Expr::Gt(Box::new(Expr::col(1, 0)), Box::new(Expr::Literal(Value::Int(5)))),
        );
        let tables = e.referenced_table_set();
        assert_eq!(tables.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    #[timeout(1000)]
    fn test_replace_top_level() {
        let mut e = Expr::And(vec![
            Expr::Gt(Box::new(Expr::col(0, 0)), Box::new(Expr::Literal(Value::Int(0)))),
            Expr::eq(Expr::col(0, 0), Expr::col(1, 0)),
        ]);
        let replaced = e.replace_top_level(
            &|x| matches!(x, Expr::Eq { .. }),
            Expr::True,
        );
        assert!(replaced);
        match &e {
            Expr::And(items) => assert!(matches!(items[1], Expr::True)),
            other => panic!("expected And, got {:?}", other),
        }
    }
}
