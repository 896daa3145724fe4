//! Per-table current-row buffer.
//!
//! The storage handler reads rows into a `RowImage` and the join buffers
//! copy column values out of it and back into it. The image uses the
//! packed layout computed by [`TableSchema`](crate::schema::TableSchema).

use std::rc::Rc;

use crate::error::JoinError;
use crate::schema::{ColumnType, TableSchema};
use crate::value::Value;

/// The current-row buffer of one table.
#[derive(Debug, Clone)]
pub struct RowImage {
    schema: Rc<TableSchema>,
    /// Null-bit block, one bit per nullable column
    null_bits: Vec<u8>,
    /// Fixed slot area
    buf: Vec<u8>,
    /// Out-of-line blob payloads, one per blob column
    blobs: Vec<Vec<u8>>,
    /// Set while the row is a null-complemented row of an outer join
    pub null_row: bool,
}

impl RowImage {
    pub fn new(schema: Rc<TableSchema>) -> Self {
        let null_bits = vec![0u8; schema.null_bytes];
        let buf = vec![0u8; schema.row_size];
        let blobs = vec![Vec::new(); schema.blob_count];
        Self {
            schema,
            null_bits,
            buf,
            blobs,
            null_row: false,
        }
    }

    pub fn schema(&self) -> &Rc<TableSchema> {
        &self.schema
    }

    /// Resets the image to column defaults: nullable columns NULL, other
    /// slots zeroed. Used before null complementation.
    pub fn restore_defaults(&mut self) {
        for b in self.null_bits.iter_mut() {
            *b = 0xff;
        }
        for b in self.buf.iter_mut() {
            *b = 0;
        }
        for blob in self.blobs.iter_mut() {
            blob.clear();
        }
        self.null_row = false;
    }

    pub fn is_null(&self, col: usize) -> bool {
        match self.schema.slots[col].null_bit {
            Some(bit) => self.null_bits[bit / 8] & (1 << (bit % 8)) != 0,
            None => false,
        }
    }

    pub fn set_null(&mut self, col: usize, null: bool) {
        if let Some(bit) = self.schema.slots[col].null_bit {
            if null {
                self.null_bits[bit / 8] |= 1 << (bit % 8);
            } else {
                self.null_bits[bit / 8] &= !(1 << (bit % 8));
            }
        }
    }

    /// Writes a value into the column's slot.
    pub fn set_value(&mut self, col: usize, value: &Value) -> Result<(), JoinError> {
        let schema = self.schema.clone();
        let column = &schema.columns[col];
        let slot = self.schema.slots[col].clone();
        if value.is_null() {
            if !column.nullable {
                return Err(JoinError::TypeMismatch {
                    column: column.name.clone(),
                    expected: "non-null value".to_string(),
                });
            }
            self.set_null(col, true);
            self.buf[slot.offset..slot.offset + slot.len].fill(0);
            if let Some(bi) = slot.blob_idx {
                self.blobs[bi].clear();
            }
            return Ok(());
        }
        self.set_null(col, false);
        let dst = &mut self.buf[slot.offset..slot.offset + slot.len];
        match (&column.ty, value) {
            (ColumnType::BigInt, Value::Int(v)) => {
                dst.copy_from_slice(&v.to_le_bytes());
            }
            (ColumnType::Double, Value::Double(v)) => {
                dst.copy_from_slice(&v.to_le_bytes());
            }
            (ColumnType::Char(n), Value::Bytes(bytes)) => {
                let n = *n as usize;
                if bytes.len() > n {
                    return Err(JoinError::TypeMismatch {
                        column: column.name.clone(),
                        expected: format!("string of at most {} bytes", n),
                    });
                }
                dst[..bytes.len()].copy_from_slice(bytes);
                dst[bytes.len()..].fill(b' ');
            }
            (ColumnType::VarChar(n), Value::Bytes(bytes)) => {
                let max = *n as usize;
                if bytes.len() > max {
                    return Err(JoinError::TypeMismatch {
                        column: column.name.clone(),
                        expected: format!("string of at most {} bytes", max),
                    });
                }
                let prefix = ColumnType::varchar_prefix_len(*n);
                if prefix == 1 {
                    dst[0] = bytes.len() as u8;
                } else {
                    dst[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
                }
                dst[prefix..prefix + bytes.len()].copy_from_slice(bytes);
                dst[prefix + bytes.len()..].fill(0);
            }
            (ColumnType::Blob, Value::Bytes(bytes)) => {
                dst.copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                self.blobs[slot.blob_idx.unwrap()] = bytes.clone();
            }
            _ => {
                return Err(JoinError::TypeMismatch {
                    column: column.name.clone(),
                    expected: format!("{:?}", column.ty),
                });
            }
        }
        Ok(())
    }

    /// Reads the column's current value.
    pub fn value(&self, col: usize) -> Value {
        if self.null_row || self.is_null(col) {
            return Value::Null;
        }
        let column = &self.schema.columns[col];
        let slot = &self.schema.slots[col];
        let src = &self.buf[slot.offset..slot.offset + slot.len];
        match column.ty {
            ColumnType::BigInt => {
                Value::Int(i64::from_le_bytes(src[..8].try_into().unwrap()))
            }
            ColumnType::Double => {
                Value::Double(f64::from_le_bytes(src[..8].try_into().unwrap()))
            }
            ColumnType::Char(_) => Value::Bytes(src.to_vec()),
            ColumnType::VarChar(n) => {
                let prefix = ColumnType::varchar_prefix_len(n);
                let len = if prefix == 1 {
                    src[0] as usize
                } else {
                    u16::from_le_bytes(src[..2].try_into().unwrap()) as usize
                };
                Value::Bytes(src[prefix..prefix + len].to_vec())
            }
            ColumnType::Blob => {
                Value::Bytes(self.blobs[slot.blob_idx.unwrap()].clone())
            }
        }
    }

    // Raw accessors used by the join buffer copy paths.

    pub fn null_bits(&self) -> &[u8] {
        &self.null_bits
    }

    pub fn null_bits_mut(&mut self) -> &mut [u8] {
        &mut self.null_bits
    }

    pub fn slot_bytes(&self, col: usize) -> &[u8] {
        let slot = &self.schema.slots[col];
        &self.buf[slot.offset..slot.offset + slot.len]
    }

    pub fn slot_bytes_mut(&mut self, col: usize) -> &mut [u8] {
        let slot = self.schema.slots[col].clone();
        &mut self.buf[slot.offset..slot.offset + slot.len]
    }

    pub fn blob_payload(&self, col: usize) -> &[u8] {
        let bi = self.schema.slots[col].blob_idx.expect("not a blob column");
        &self.blobs[bi]
    }

    pub fn set_blob_payload(&mut self, col: usize, payload: Vec<u8>) {
        let bi = self.schema.slots[col].blob_idx.expect("not a blob column");
        self.blobs[bi] = payload;
    }

    /// Declared blob length read from the inline slot.
    pub fn blob_len(&self, col: usize) -> usize {
        let slot = &self.schema.slots[col];
        u32::from_le_bytes(
            self.buf[slot.offset..slot.offset + 4].try_into().unwrap(),
        ) as usize
    }

    /// Packs the whole row (null bits, slots, blob payloads) into one
    /// byte vector. This is the storage format of the in-memory engine.
    pub fn pack(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.null_bits.len() + self.buf.len());
        out.extend_from_slice(&self.null_bits);
        out.extend_from_slice(&self.buf);
        for (col, slot) in self.schema.slots.iter().enumerate() {
            if slot.blob_idx.is_some() && !self.is_null(col) {
                out.extend_from_slice(self.blob_payload(col));
            }
        }
        out
    }

    /// Restores the row from its packed storage format.
    pub fn unpack(&mut self, packed: &[u8]) {
        let nb = self.null_bits.len();
        self.null_bits.copy_from_slice(&packed[..nb]);
        let rs = self.buf.len();
        self.buf.copy_from_slice(&packed[nb..nb + rs]);
        let mut pos = nb + rs;
        for col in 0..self.schema.columns.len() {
            if let Some(bi) = self.schema.slots[col].blob_idx {
                if self.is_null(col) {
                    self.blobs[bi].clear();
                } else {
                    let len = self.blob_len(col);
                    self.blobs[bi] = packed[pos..pos + len].to_vec();
                    pos += len;
                }
            }
        }
        self.null_row = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use ntest::timeout;

    fn schema() -> Rc<TableSchema> {
        TableSchema::new(
            "t",
            vec![
                Column::new("id", ColumnType::BigInt, false),
                Column::new("tag", ColumnType::Char(6), true),
                Column::new("name", ColumnType::VarChar(10), true),
                Column::new("data", ColumnType::Blob, true),
            ],
        )
        .unwrap()
    }

    #[test]
    #[timeout(1000)]
    fn test_value_round_trip() {
        let mut row = RowImage::new(schema());
        row.set_value(0, &Value::Int(42)).unwrap();
        row.set_value(1, &Value::str("ab")).unwrap();
        row.set_value(2, &Value::str("hello")).unwrap();
        row.set_value(3, &Value::Bytes(vec![1, 2, 3])).unwrap();

        assert_eq!(row.value(0), Value::Int(42));
        assert_eq!(row.value(1), Value::str("ab    ")); // space padded
        assert_eq!(row.value(2), Value::str("hello"));
        assert_eq!(row.value(3), Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    #[timeout(1000)]
    fn test_null_handling() {
        let mut row = RowImage::new(schema());
        row.set_value(2, &Value::Null).unwrap();
        assert!(row.is_null(2));
        assert_eq!(row.value(2), Value::Null);

        // Non-nullable column rejects NULL
        assert!(row.set_value(0, &Value::Null).is_err());
    }

    #[test]
    #[timeout(1000)]
    fn test_pack_unpack() {
        let mut row = RowImage::new(schema());
        row.set_value(0, &Value::Int(7)).unwrap();
        row.set_value(1, &Value::Null).unwrap();
        row.set_value(2, &Value::str("xyz")).unwrap();
        row.set_value(3, &Value::Bytes(vec![9; 100])).unwrap();
        let packed = row.pack();

        let mut restored = RowImage::new(schema());
        restored.unpack(&packed);
        assert_eq!(restored.value(0), Value::Int(7));
        assert_eq!(restored.value(1), Value::Null);
        assert_eq!(restored.value(2), Value::str("xyz"));
        assert_eq!(restored.value(3), Value::Bytes(vec![9; 100]));
    }

    #[test]
    #[timeout(1000)]
    fn test_restore_defaults() {
        let mut row = RowImage::new(schema());
        row.set_value(0, &Value::Int(5)).unwrap();
        row.restore_defaults();
        assert_eq!(row.value(0), Value::Int(0));
        assert!(row.is_null(1));
        assert!(row.is_null(2));
        assert!(row.is_null(3));
    }

    #[test]
    #[timeout(1000)]
    fn test_null_row_reads_null() {
        let mut row = RowImage::new(schema());
        row.set_value(0, &Value::Int(5)).unwrap();
        row.null_row = true;
        assert_eq!(row.value(0), Value::Null);
    }
}
