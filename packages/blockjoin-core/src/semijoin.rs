//! Semi-join execution structures: the strategy enum persisted in
//! plans, the duplicate-weedout rowid table and the materialization
//! descriptor.

use serde::{Deserialize, Serialize};

use crate::error::JoinError;
use crate::exec::{CondFn, TableCtx};
use crate::row::RowImage;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::storage::{Handler, IndexDef, MemTable, WriteOutcome};
use crate::value::Value;

/// Semi-join duplicate-removal strategy. The discriminants are persisted
/// in plans and must stay stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum SemiJoinStrategy {
    #[default]
    None = 0,
    DupsWeedout = 1,
    Materialize = 2,
    MaterializeScan = 3,
    FirstMatch = 4,
    LooseScan = 5,
}

/// One table whose rowid participates in a weedout tuple.
#[derive(Debug, Clone)]
pub struct WeedoutTab {
    pub table: usize,
    /// Byte offset of the rowid inside the tuple's rowid section
    pub rowid_offset: usize,
    /// The table can produce null-complemented rows
    pub maybe_null: bool,
    pub null_byte: usize,
    pub null_bit: u8,
}

/// Duplicate-weedout temp table: one varbinary tuple of the weeded
/// tables' rowids plus a null-flag section, unique over the whole tuple.
#[derive(Debug)]
pub struct WeedoutTable {
    pub tabs: Vec<WeedoutTab>,
    pub rowid_len: usize,
    pub null_bytes: usize,
    /// Absent for the degenerate zero-length tuple
    tmp: Option<MemTable>,
    scratch: Option<RowImage>,
    is_degenerate: bool,
    have_degenerate_row: bool,
}

impl WeedoutTable {
    /// Builds the weedout table over the given executor tables. Tables
    /// flagged `maybe_null` get a null bit so null-complemented rows
    /// form distinct tuples.
    pub fn new(tables: &[(usize, bool, usize)]) -> Result<Self, JoinError> {
        // (table, maybe_null, ref_length)
        let mut tabs = Vec::new();
        let mut rowid_offset = 0;
        let mut null_bits: u8 = 0;
        for &(table, maybe_null, ref_length) in tables {
            let (null_byte, null_bit) = if maybe_null {
                let bit = null_bits;
                null_bits += 1;
                ((bit / 8) as usize, bit % 8)
            } else {
                (0, 0)
            };
            tabs.push(WeedoutTab {
                table,
                rowid_offset,
                maybe_null,
                null_byte,
                null_bit,
            });
            rowid_offset += ref_length;
        }
        let rowid_len = rowid_offset;
        let null_bytes = (null_bits as usize).div_ceil(8);
        let tuple_len = rowid_len + null_bytes;

        if tuple_len == 0 {
            // WHERE const IN (uncorrelated select): a single flag stands
            // in for the whole table.
            return Ok(Self {
                tabs,
                rowid_len,
                null_bytes,
                tmp: None,
                scratch: None,
                is_degenerate: true,
                have_degenerate_row: false,
            });
        }

        let schema = TableSchema::new(
            "weedout-tmp",
            vec![Column::new(
                "rowids",
                ColumnType::Char(tuple_len as u16),
                false,
            )],
        )?;
        let mut tmp = MemTable::new(schema.clone());
        tmp.add_index(IndexDef {
            columns: vec![0],
            unique: true,
        });
        let scratch = RowImage::new(schema);
        Ok(Self {
            tabs,
            rowid_len,
            null_bytes,
            tmp: Some(tmp),
            scratch: Some(scratch),
            is_degenerate: false,
            have_degenerate_row: false,
        })
    }

    pub fn is_degenerate(&self) -> bool {
        self.is_degenerate
    }

    pub fn row_count(&self) -> usize {
        match &self.tmp {
            Some(tmp) => tmp.row_count(),
            None => usize::from(self.have_degenerate_row),
        }
    }

    /// Truncates the table; called when the executor re-enters the
    /// weedout range and between re-executions of a prepared plan.
    pub fn reset(&mut self) {
        if let Some(tmp) = &mut self.tmp {
            if tmp.row_count() > 0 {
                tracing::debug!(
                    "truncating weedout table ({} rows)",
                    tmp.row_count()
                );
            }
            tmp.delete_all_rows();
        }
        self.have_degenerate_row = false;
    }

    /// Composes the rowid tuple of the current row combination and
    /// tries to insert it.
    pub fn insert_and_check(
        &mut self,
        tables: &[TableCtx],
    ) -> Result<WriteOutcome, JoinError> {
        if self.is_degenerate {
            if self.have_degenerate_row {
                return Ok(WriteOutcome::Duplicate);
            }
            self.have_degenerate_row = true;
            return Ok(WriteOutcome::Inserted);
        }
        let mut tuple = vec![0u8; self.null_bytes + self.rowid_len];
        for tab in &self.tabs {
            let ctx = &tables[tab.table];
            if tab.maybe_null && ctx.row.null_row {
                tuple[tab.null_byte] |= 1 << tab.null_bit;
                // Rowid bytes stay zero for the null-complemented row.
            } else {
                let rowid = ctx.rowid.to_le_bytes();
                let at = self.null_bytes + tab.rowid_offset;
                tuple[at..at + rowid.len()].copy_from_slice(&rowid);
            }
        }
        let scratch = self.scratch.as_mut().expect("non-degenerate weedout");
        scratch.set_value(0, &Value::Bytes(tuple))?;
        let tmp = self.tmp.as_mut().expect("non-degenerate weedout");
        tmp.write_tmp_row(scratch)
    }
}

/// Semi-join materialization of one nest: the distinct inner select
/// result lives in a temp table filled on first access.
pub struct Materialization {
    /// Inner tables of the nest, in materialization scan order
    pub tables: Vec<usize>,
    /// Inner condition evaluated while filling (subquery WHERE)
    pub cond: Option<CondFn>,
    /// Inner select list: (table, column) per temp-table column
    pub select: Vec<(usize, usize)>,
    /// Executor table index of the temp table
    pub temp_table: usize,
    /// Scan variant (`MaterializeScan`) instead of unique lookups
    pub is_scan: bool,
    /// Set once the temp table has been filled for this execution
    pub materialized: bool,
}

impl std::fmt::Debug for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materialization")
            .field("tables", &self.tables)
            .field("select", &self.select)
            .field("temp_table", &self.temp_table)
            .field("is_scan", &self.is_scan)
            .field("materialized", &self.materialized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    fn ctx_with_rowid(rowid: u64) -> TableCtx {
        let schema = TableSchema::new(
            "t",
            vec![Column::new("a", ColumnType::BigInt, false)],
        )
        .unwrap();
        let mut ctx = TableCtx::new(schema);
        ctx.rowid = rowid;
        ctx
    }

    #[test]
    #[timeout(1000)]
    fn test_strategy_discriminants() {
        assert_eq!(SemiJoinStrategy::None as u8, 0);
        assert_eq!(SemiJoinStrategy::DupsWeedout as u8, 1);
        assert_eq!(SemiJoinStrategy::Materialize as u8, 2);
        assert_eq!(SemiJoinStrategy::MaterializeScan as u8, 3);
        assert_eq!(SemiJoinStrategy::FirstMatch as u8, 4);
        assert_eq!(SemiJoinStrategy::LooseScan as u8, 5);
    }

    #[test]
    #[timeout(1000)]
    fn test_weedout_detects_duplicates() {
        let mut weedout = WeedoutTable::new(&[(0, false, 8)]).unwrap();
        let tables = vec![ctx_with_rowid(7)];
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Duplicate
        );
        let other = vec![ctx_with_rowid(8)];
        assert_eq!(
            weedout.insert_and_check(&other).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(weedout.row_count(), 2);
        weedout.reset();
        assert_eq!(weedout.row_count(), 0);
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Inserted
        );
    }

    #[test]
    #[timeout(1000)]
    fn test_degenerate_weedout() {
        let mut weedout = WeedoutTable::new(&[]).unwrap();
        assert!(weedout.is_degenerate());
        let tables: Vec<TableCtx> = Vec::new();
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Duplicate
        );
        weedout.reset();
        assert_eq!(
            weedout.insert_and_check(&tables).unwrap(),
            WriteOutcome::Inserted
        );
    }

    #[test]
    #[timeout(1000)]
    fn test_null_row_tuple_distinct() {
        let mut weedout = WeedoutTable::new(&[(0, true, 8)]).unwrap();
        let mut with_row = ctx_with_rowid(0);
        with_row.row.null_row = false;
        let mut null_row = ctx_with_rowid(0);
        null_row.row.null_row = true;
        // A rowid-0 row and a null-complemented row must not collide.
        assert_eq!(
            weedout
                .insert_and_check(std::slice::from_ref(&with_row))
                .unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            weedout
                .insert_and_check(std::slice::from_ref(&null_row))
                .unwrap(),
            WriteOutcome::Inserted
        );
    }

    #[test]
    #[timeout(1000)]
    fn test_weedout_tuple_layout() {
        let weedout =
            WeedoutTable::new(&[(0, false, 8), (1, true, 8)]).unwrap();
        assert_eq!(weedout.rowid_len, 16);
        assert_eq!(weedout.null_bytes, 1);
        assert_eq!(weedout.tabs[1].rowid_offset, 8);
    }
}
