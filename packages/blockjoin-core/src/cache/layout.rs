//! Record layout of a join buffer.
//!
//! Describes how one record of a set of buffered tables is packed:
//! flag fields first (match flag, per-table null bitmaps and null-row
//! flags), then key-argument fields when the right-hand access is a key
//! lookup, then the remaining data fields. Fields that later buffers
//! reference get a `referenced_field_no` and their offsets are stored in
//! a table at the record tail.

use std::rc::Rc;

use crate::keys::KeyDef;
use crate::schema::{ColumnType, TableSchema};

/// Where a packed field's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// The record's match flag byte; cache state, not table data
    MatchFlag,
    /// A table's null-bit block
    NullBits { table: usize },
    /// A table's null-row flag
    NullRow { table: usize },
    /// A table's current rowid, kept when a downstream duplicate
    /// weedout needs it
    Rowid { table: usize },
    /// A column value
    Column { table: usize, column: usize },
}

/// Packing variant of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Raw bytes of fixed width
    Fixed,
    /// 1-byte length prefix plus value
    VarStr1,
    /// 2-byte length prefix plus value
    VarStr2,
    /// Fixed string stored space-stripped behind a 2-byte length
    StrippedString,
    /// 4-byte length; payload copied or, for the last record, left in
    /// the driving row
    Blob,
}

/// Descriptor of one field copied into and out of the buffer.
#[derive(Debug, Clone)]
pub struct FieldDescr {
    pub source: FieldSource,
    pub kind: FieldKind,
    /// Maximum packed length, excluding dynamic blob payload
    pub length: usize,
    /// 1-based number assigned when a later buffer references this
    /// field; 0 means not referenced
    pub referenced_field_no: usize,
}

/// A key-argument field that lives in an earlier buffer.
#[derive(Debug, Clone, Copy)]
pub struct ExternalKeyArg {
    /// Index of the buffer holding the field
    pub cache: usize,
    /// Descriptor index inside that buffer's layout
    pub descr: usize,
}

/// One table whose rows are packed into the buffer.
#[derive(Debug, Clone)]
pub struct BufferTable {
    pub table: usize,
    pub schema: Rc<TableSchema>,
    /// The table can be null-complemented, so its null-row flag is kept
    pub store_null_row: bool,
    /// A downstream weedout consumes this table's rowid
    pub store_rowid: bool,
}

/// Complete record layout of one join buffer.
#[derive(Debug)]
pub struct Layout {
    pub tables: Vec<BufferTable>,
    pub descrs: Vec<FieldDescr>,
    /// Number of leading flag-field descriptors
    pub flag_fields: usize,
    /// Number of blob fields among the data fields
    pub blobs: usize,
    pub with_match_flag: bool,
    /// Key arguments stored in earlier buffers, in key-part order
    pub externals: Vec<ExternalKeyArg>,
    /// Upper bound of the packed record body (flags + data), excluding
    /// blob payloads and affixes
    pub base_len: usize,
}

/// Classifies a column type into its buffer packing variant and maximum
/// packed length.
pub fn classify(ty: ColumnType) -> (FieldKind, usize) {
    match ty {
        ColumnType::BigInt | ColumnType::Double => (FieldKind::Fixed, 8),
        ColumnType::Char(n) => (FieldKind::StrippedString, 2 + n as usize),
        ColumnType::VarChar(n) => {
            if n < 256 {
                (FieldKind::VarStr1, 1 + n as usize)
            } else {
                (FieldKind::VarStr2, 2 + n as usize)
            }
        }
        ColumnType::Blob => (FieldKind::Blob, 4),
    }
}

impl Layout {
    /// Builds the layout for a buffer over `tables`.
    ///
    /// `key` is the probe key of the right-hand ref access when there is
    /// one; its parts become the leading data fields. Parts stored in
    /// earlier buffers are resolved through `register_external`, which
    /// assigns a fresh `referenced_field_no` in the home buffer and
    /// returns its location.
    pub fn build(
        tables: Vec<BufferTable>,
        with_match_flag: bool,
        key: Option<&KeyDef>,
        register_external: &mut dyn FnMut(usize, usize) -> Option<ExternalKeyArg>,
    ) -> Layout {
        let mut descrs = Vec::new();
        let mut base_len = 0;

        if with_match_flag {
            descrs.push(FieldDescr {
                source: FieldSource::MatchFlag,
                kind: FieldKind::Fixed,
                length: 1,
                referenced_field_no: 0,
            });
            base_len += 1;
        }
        for bt in &tables {
            if bt.schema.null_bytes > 0 {
                descrs.push(FieldDescr {
                    source: FieldSource::NullBits { table: bt.table },
                    kind: FieldKind::Fixed,
                    length: bt.schema.null_bytes,
                    referenced_field_no: 0,
                });
                base_len += bt.schema.null_bytes;
            }
            if bt.store_null_row {
                descrs.push(FieldDescr {
                    source: FieldSource::NullRow { table: bt.table },
                    kind: FieldKind::Fixed,
                    length: 1,
                    referenced_field_no: 0,
                });
                base_len += 1;
            }
            if bt.store_rowid {
                descrs.push(FieldDescr {
                    source: FieldSource::Rowid { table: bt.table },
                    kind: FieldKind::Fixed,
                    length: 8,
                    referenced_field_no: 0,
                });
                base_len += 8;
            }
        }
        let flag_fields = descrs.len();

        // Key-argument fields go first so an embedded key is a
        // contiguous range right after the flag fields.
        let mut externals = Vec::new();
        let mut emitted: Vec<(usize, usize)> = Vec::new();
        if let Some(key) = key {
            for part in &key.parts {
                if let Some(bt) =
                    tables.iter().find(|bt| bt.table == part.table)
                {
                    let (kind, length) =
                        classify(bt.schema.columns[part.column].ty);
                    descrs.push(FieldDescr {
                        source: FieldSource::Column {
                            table: part.table,
                            column: part.column,
                        },
                        kind,
                        length,
                        referenced_field_no: 0,
                    });
                    base_len += length;
                    emitted.push((part.table, part.column));
                } else if let Some(ext) =
                    register_external(part.table, part.column)
                {
                    externals.push(ext);
                }
            }
        }

        for bt in &tables {
            for column in 0..bt.schema.columns.len() {
                if emitted.contains(&(bt.table, column)) {
                    continue;
                }
                let (kind, length) = classify(bt.schema.columns[column].ty);
                descrs.push(FieldDescr {
                    source: FieldSource::Column {
                        table: bt.table,
                        column,
                    },
                    kind,
                    length,
                    referenced_field_no: 0,
                });
                base_len += length;
            }
        }

        let blobs = descrs
            .iter()
            .filter(|d| d.kind == FieldKind::Blob)
            .count();

        Layout {
            tables,
            descrs,
            flag_fields,
            blobs,
            with_match_flag,
            externals,
            base_len,
        }
    }

    /// Number of data fields (all fields after the flag fields).
    pub fn data_fields(&self) -> usize {
        self.descrs.len() - self.flag_fields
    }

    /// Finds the descriptor index of a column field.
    pub fn descr_of_column(&self, table: usize, column: usize) -> Option<usize> {
        self.descrs.iter().position(|d| {
            matches!(d.source, FieldSource::Column { table: t, column: c }
                if t == table && c == column)
        })
    }

    /// Sum of the flag-field lengths; the embedded key starts here.
    pub fn flag_fields_len(&self) -> usize {
        self.descrs[..self.flag_fields].iter().map(|d| d.length).sum()
    }
}
