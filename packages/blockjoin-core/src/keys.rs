//! Packed key images for index lookups and hashed join buffers.
//!
//! A key image is the concatenation of its parts. Each part is an
//! optional null byte (nullable parts only) followed by the value in its
//! raw slot encoding: integers and doubles as 8 little-endian bytes,
//! fixed strings space padded, varstrings as a 2-byte length plus the
//! value zero padded to the maximum. Equal keys of all-binary parts are
//! byte-identical; otherwise equality and hashing are collation aware.

use std::rc::Rc;

use crate::row::RowImage;
use crate::schema::{ColumnType, TableSchema};
use crate::value::Collation;

/// How one key part is encoded inside a key image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPartKind {
    /// Raw fixed-width bytes
    Fixed(usize),
    /// 2-byte length prefix plus zero-padded value bytes
    Var(usize),
}

/// One part of a key.
#[derive(Debug, Clone)]
pub struct KeyPart {
    /// Table the part's value comes from
    pub table: usize,
    /// Column within that table
    pub column: usize,
    pub kind: KeyPartKind,
    pub nullable: bool,
    pub collation: Collation,
}

impl KeyPart {
    /// Total bytes this part occupies in a key image.
    pub fn store_length(&self) -> usize {
        let val = match self.kind {
            KeyPartKind::Fixed(n) => n,
            KeyPartKind::Var(n) => 2 + n,
        };
        usize::from(self.nullable) + val
    }
}

/// An ordered list of key parts with precomputed image length.
#[derive(Debug, Clone)]
pub struct KeyDef {
    pub parts: Vec<KeyPart>,
    pub key_length: usize,
}

impl KeyDef {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        let key_length = parts.iter().map(|p| p.store_length()).sum();
        Self { parts, key_length }
    }

    /// Builds a key definition over columns of the given tables.
    /// `columns` pairs a table index with a column index; the part layout
    /// is derived from the column type.
    pub fn for_columns(
        schemas: &[Rc<TableSchema>],
        columns: &[(usize, usize)],
    ) -> Self {
        let parts = columns
            .iter()
            .map(|&(table, column)| {
                let col = &schemas[table].columns[column];
                let kind = match col.ty {
                    ColumnType::BigInt | ColumnType::Double => {
                        KeyPartKind::Fixed(8)
                    }
                    ColumnType::Char(n) => KeyPartKind::Fixed(n as usize),
                    ColumnType::VarChar(n) => KeyPartKind::Var(n as usize),
                    ColumnType::Blob => {
                        unreachable!("blob columns cannot be key parts")
                    }
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
        Self::new(parts)
    }

    /// All parts compare as raw bytes.
    pub fn all_binary(&self) -> bool {
        self.parts.iter().all(|p| p.collation.binary_comparable())
    }

    /// Builds an image from one table's row; the part's `table` field is
    /// ignored. Null parts get their null byte set and a zeroed value.
    pub fn image_from_row(&self, row: &RowImage) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key_length);
        for part in &self.parts {
            let null = row.is_null(part.column) || row.null_row;
            if part.nullable {
                out.push(u8::from(null));
            }
            self.push_part_value(&mut out, part, if null { None } else { Some(row) });
        }
        out
    }

    /// Builds an image from the current rows of several tables. NULL
    /// parts keep their null byte set; such keys are stored but never
    /// matched by a probe.
    pub fn image_from_rows(&self, rows: &dyn Rows) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key_length);
        for part in &self.parts {
            let row = rows.row(part.table);
            let null = row.null_row || row.is_null(part.column);
            if part.nullable {
                out.push(u8::from(null));
            }
            self.push_part_value(&mut out, part, if null { None } else { Some(row) });
        }
        out
    }

    /// Builds a probe image from the current rows of several tables.
    /// Returns `None` when any part is NULL: an equality lookup can then
    /// never match.
    pub fn probe_image(&self, rows: &dyn Rows) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.key_length);
        for part in &self.parts {
            let row = rows.row(part.table);
            if row.null_row || row.is_null(part.column) {
                return None;
            }
            if part.nullable {
                out.push(0);
            }
            self.push_part_value(&mut out, part, Some(row));
        }
        Some(out)
    }

    fn push_part_value(&self, out: &mut Vec<u8>, part: &KeyPart, row: Option<&RowImage>) {
        match part.kind {
            KeyPartKind::Fixed(n) => match row {
                Some(row) => out.extend_from_slice(&row.slot_bytes(part.column)[..n]),
                None => out.extend(std::iter::repeat(0u8).take(n)),
            },
            KeyPartKind::Var(n) => match row {
                Some(row) => {
                    let slot = row.slot_bytes(part.column);
                    let prefix = slot.len() - n;
                    let len = if prefix == 1 {
                        slot[0] as usize
                    } else {
                        u16::from_le_bytes(slot[..2].try_into().unwrap()) as usize
                    };
                    out.extend_from_slice(&(len as u16).to_le_bytes());
                    out.extend_from_slice(&slot[prefix..prefix + len]);
                    out.extend(std::iter::repeat(0u8).take(n - len));
                }
                None => out.extend(std::iter::repeat(0u8).take(2 + n)),
            },
        }
    }

    /// Normalizes an image so that collation-equal keys become byte
    /// equal. This is the stored form in ordered indexes.
    pub fn normalize_image(&self, image: &[u8]) -> Vec<u8> {
        if self.all_binary() {
            return image.to_vec();
        }
        let mut out = Vec::with_capacity(image.len());
        let mut pos = 0;
        for part in &self.parts {
            if part.nullable {
                out.push(image[pos]);
                pos += 1;
            }
            match part.kind {
                KeyPartKind::Fixed(n) => {
                    let raw = &image[pos..pos + n];
                    if part.collation.binary_comparable() {
                        out.extend_from_slice(raw);
                    } else {
                        let norm = part.collation.normalize(raw);
                        out.extend_from_slice(&norm);
                        out.extend(std::iter::repeat(b' ').take(n - norm.len()));
                    }
                    pos += n;
                }
                KeyPartKind::Var(n) => {
                    let len = u16::from_le_bytes(
                        image[pos..pos + 2].try_into().unwrap(),
                    ) as usize;
                    let raw = &image[pos + 2..pos + 2 + len];
                    if part.collation.binary_comparable() {
                        out.extend_from_slice(&image[pos..pos + 2 + n]);
                    } else {
                        let norm = part.collation.normalize(raw);
                        out.extend_from_slice(&(norm.len() as u16).to_le_bytes());
                        out.extend_from_slice(&norm);
                        out.extend(std::iter::repeat(0u8).take(n - norm.len()));
                    }
                    pos += 2 + n;
                }
            }
        }
        out
    }

    /// Byte-identity key comparison, valid when [`all_binary`](Self::all_binary).
    pub fn equal_simple(key1: &[u8], key2: &[u8]) -> bool {
        key1 == key2
    }

    /// Collation-aware key comparison.
    pub fn equal_complex(&self, key1: &[u8], key2: &[u8]) -> bool {
        self.normalize_image(key1) == self.normalize_image(key2)
    }

    /// Key equality picking the comparison the parts require.
    pub fn keys_equal(&self, key1: &[u8], key2: &[u8]) -> bool {
        if self.all_binary() {
            Self::equal_simple(key1, key2)
        } else {
            self.equal_complex(key1, key2)
        }
    }

    /// Hash of a key image, consistent with [`keys_equal`](Self::keys_equal).
    pub fn hash(&self, image: &[u8]) -> u64 {
        if self.all_binary() {
            hash_bytes(image)
        } else {
            hash_bytes(&self.normalize_image(image))
        }
    }
}

/// Byte-sequence hash used by the in-buffer hash table.
pub fn hash_bytes(key: &[u8]) -> u64 {
    let mut nr: u64 = 1;
    let mut nr2: u64 = 4;
    for &b in key {
        nr ^= ((nr & 63).wrapping_add(nr2).wrapping_mul(b as u64))
            .wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add(3);
    }
    nr
}

/// Read access to the current rows of the joined tables.
///
/// Implemented both by the executor's full table list and by split views
/// used while a scanner borrows the right-hand table separately.
pub trait Rows {
    fn row(&self, table: usize) -> &RowImage;

    /// Rowid of the table's current row, for contexts that track one.
    fn rowid(&self, _table: usize) -> u64 {
        0
    }
}

/// Mutable access to the current rows, used when buffer records are
/// materialized back into the tables.
pub trait RowsMut: Rows {
    fn row_mut(&mut self, table: usize) -> &mut RowImage;

    fn set_rowid(&mut self, _table: usize, _rowid: u64) {}
}

impl Rows for [RowImage] {
    fn row(&self, table: usize) -> &RowImage {
        &self[table]
    }
}

impl RowsMut for [RowImage] {
    fn row_mut(&mut self, table: usize) -> &mut RowImage {
        &mut self[table]
    }
}

/// Sized wrapper around a row-image slice, for use wherever a `&dyn Rows`
/// is needed: trait objects can't be built directly from an unsized
/// slice, even one that implements the trait.
pub struct RowImages<'a>(pub &'a [RowImage]);

impl Rows for RowImages<'_> {
    fn row(&self, table: usize) -> &RowImage {
        &self.0[table]
    }
}

/// Mutable counterpart of [`RowImages`].
pub struct RowImagesMut<'a>(pub &'a mut [RowImage]);

impl Rows for RowImagesMut<'_> {
    fn row(&self, table: usize) -> &RowImage {
        &self.0[table]
    }
}

impl RowsMut for RowImagesMut<'_> {
    fn row_mut(&mut self, table: usize) -> &mut RowImage {
        &mut self.0[table]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, TableSchema};
    use crate::value::Value;
    use ntest::timeout;

    fn schema() -> Rc<TableSchema> {
        TableSchema::new(
            "t",
            vec![
                Column::new("id", ColumnType::BigInt, false),
                Column::new("name", ColumnType::VarChar(8), true)
                    .with_collation(Collation::CaseInsensitive),
            ],
        )
        .unwrap()
    }

    #[test]
    #[timeout(1000)]
    fn test_image_layout() {
        let s = schema();
        let key = KeyDef::for_columns(&[s.clone()], &[(0, 0), (0, 1)]);
        // 8 (int) + 1 (null byte) + 2 + 8 (varstr)
        assert_eq!(key.key_length, 19);

        let mut row = RowImage::new(s);
        row.set_value(0, &Value::Int(5)).unwrap();
        row.set_value(1, &Value::str("ab")).unwrap();
        let image = key.image_from_row(&row);
        assert_eq!(image.len(), 19);
        assert_eq!(&image[..8], &5i64.to_le_bytes());
        assert_eq!(image[8], 0); // not null
        assert_eq!(&image[9..11], &2u16.to_le_bytes());
        assert_eq!(&image[11..13], b"ab");
    }

    #[test]
    #[timeout(1000)]
    fn test_hash_matches_collation_equality() {
        let s = schema();
        let key = KeyDef::for_columns(&[s.clone()], &[(0, 1)]);
        let mut r1 = RowImage::new(s.clone());
        let mut r2 = RowImage::new(s);
        r1.set_value(1, &Value::str("AbC")).unwrap();
        r2.set_value(1, &Value::str("abc")).unwrap();
        let i1 = key.image_from_row(&r1);
        let i2 = key.image_from_row(&r2);
        assert_ne!(i1, i2);
        assert!(key.keys_equal(&i1, &i2));
        assert_eq!(key.hash(&i1), key.hash(&i2));
    }

    #[test]
    #[timeout(1000)]
    fn test_binary_key_byte_identity() {
        let s = TableSchema::new(
            "t",
            vec![Column::new("id", ColumnType::BigInt, false)],
        )
        .unwrap();
        let key = KeyDef::for_columns(&[s.clone()], &[(0, 0)]);
        assert!(key.all_binary());
        let mut r1 = RowImage::new(s.clone());
        let mut r2 = RowImage::new(s);
        r1.set_value(0, &Value::Int(9)).unwrap();
        r2.set_value(0, &Value::Int(9)).unwrap();
        let i1 = key.image_from_row(&r1);
        let i2 = key.image_from_row(&r2);
        assert_eq!(i1, i2);
        assert_eq!(key.hash(&i1), key.hash(&i2));
    }

    #[test]
    #[timeout(1000)]
    fn test_null_part_rejects_probe() {
        struct One(RowImage);
        impl Rows for One {
            fn row(&self, _table: usize) -> &RowImage {
                &self.0
            }
        }
        let s = schema();
        let key = KeyDef::for_columns(&[s.clone()], &[(0, 1)]);
        let mut row = RowImage::new(s);
        row.set_value(1, &Value::Null).unwrap();
        assert!(key.probe_image(&One(row)).is_none());
    }
}
