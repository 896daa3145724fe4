//! Hash index embedded inside a join buffer.
//!
//! The hash table of slot offsets occupies the top end of the arena; key
//! entries grow downward from it, records upward from the bottom. Each
//! key entry holds the key bytes (or a reference to an embedded key
//! range inside a record), a next-key link for its slot chain and the
//! last link of a circular chain of records with this key.

use std::rc::Rc;

use crate::cache::buffer::JoinBuffer;
use crate::cache::layout::{FieldKind, FieldSource};
use crate::cache::{offset_size, read_offset, store_offset, MatchFlag};
use crate::keys::KeyDef;

/// Expected load factor of the hash table.
const HASH_LOAD: f64 = 0.7;

/// Keys of the hashed buffer: one built over the driving rows at append
/// time, one built over the right-hand row at probe time. Both share the
/// same part structure.
#[derive(Debug, Clone)]
pub struct HashConfig {
    pub build_key: Rc<KeyDef>,
    pub probe_key: Rc<KeyDef>,
}

/// The hash section of a join buffer.
#[derive(Debug)]
pub struct HashIndex {
    pub build_key: Rc<KeyDef>,
    pub probe_key: Rc<KeyDef>,
    pub key_length: usize,
    pub size_of_key_ofs: usize,
    pub key_entry_length: usize,
    pub hash_entries: usize,
    /// Offset of the slot array
    pub hash_table_off: usize,
    /// Lower bound of the allocated key entries
    pub last_key_entry: usize,
    pub key_entries: usize,
    pub use_emb_key: bool,
    /// Key-entry iteration cursor used by the multi-range sequence
    pub curr_key_entry: usize,
}

impl HashIndex {
    /// Creates the hash section. The table itself is laid out later by
    /// [`init_table`](Self::init_table) once the arena is allocated.
    pub fn new(cfg: HashConfig, buffer: &JoinBuffer) -> Self {
        let key_length = cfg.build_key.key_length;
        let use_emb_key = Self::check_emb_key_usage(&cfg.build_key, buffer);
        let size_of_key_ofs = 2.max(buffer.size_of_rec_ofs);
        let key_entry_length = buffer.size_of_rec_ofs
            + size_of_key_ofs
            + if use_emb_key {
                buffer.size_of_rec_ofs
            } else {
                key_length
            };
        Self {
            build_key: cfg.build_key,
            probe_key: cfg.probe_key,
            key_length,
            size_of_key_ofs,
            key_entry_length,
            hash_entries: 0,
            hash_table_off: 0,
            last_key_entry: 0,
            key_entries: 0,
            use_emb_key,
            curr_key_entry: 0,
        }
    }

    /// The embedded-key optimization applies when every key part is a
    /// fixed-length, non-nullable field of this buffer and the parts are
    /// exactly the leading data fields in key order, so the key is a
    /// byte range inside the record.
    fn check_emb_key_usage(key: &KeyDef, buffer: &JoinBuffer) -> bool {
        if key.parts.is_empty() || !buffer.layout.externals.is_empty() {
            return false;
        }
        for (i, part) in key.parts.iter().enumerate() {
            let descr = match buffer.layout.descrs.get(buffer.layout.flag_fields + i)
            {
                Some(d) => d,
                None => return false,
            };
            if part.nullable
                || descr.kind != FieldKind::Fixed
                || descr.length != part.store_length()
            {
                return false;
            }
            match descr.source {
                FieldSource::Column { table, column }
                    if table == part.table && column == part.column => {}
                _ => return false,
            }
        }
        true
    }

    /// Maximum key-addon space one record can claim: the key entry plus
    /// two hash-table entries, since entries are sized at N / 0.7.
    pub fn max_key_addon_space_per_record(&self, size_of_rec_ofs: usize) -> usize {
        (if self.use_emb_key {
            size_of_rec_ofs
        } else {
            self.key_length
        }) + size_of_rec_ofs
            + size_of_rec_ofs
            + 2 * size_of_rec_ofs
    }

    /// Sizes and clears the hash table inside the allocated arena. The
    /// slot width starts at two bytes and grows in steps of two until it
    /// can address the worst-case key-entry area.
    pub fn init_table(buffer: &mut JoinBuffer) {
        let mut hash = buffer.hash.take().expect("hash section missing");
        let rec_ofs = buffer.size_of_rec_ofs;
        let max_key_ofs = 2.max(rec_ofs);
        let mut key_ofs = 2;
        loop {
            hash.key_entry_length = rec_ofs
                + key_ofs
                + if hash.use_emb_key { rec_ofs } else { hash.key_length };
            let space_per_rec = buffer.avg_record_length
                + buffer.avg_aux_buffer_incr
                + hash.key_entry_length
                + key_ofs;
            let n = buffer.buff_size / space_per_rec.max(1);
            let per_rec_min = (buffer.pack_length - buffer.layout.base_len)
                + hash.key_entry_length
                + key_ofs;
            let max_n = buffer.buff_size / per_rec_min.max(1);
            hash.hash_entries = ((n as f64 / HASH_LOAD) as usize).max(1);
            if offset_size(max_n * hash.key_entry_length) <= key_ofs
                || key_ofs + 2 > max_key_ofs
            {
                break;
            }
            key_ofs += 2;
        }
        hash.size_of_key_ofs = key_ofs;
        hash.hash_table_off =
            buffer.buff_size - hash.hash_entries * hash.size_of_key_ofs;
        hash.last_key_entry = hash.hash_table_off;
        hash.key_entries = 0;
        hash.curr_key_entry = hash.hash_table_off;
        let off = hash.hash_table_off;
        buffer.buff[off..].fill(0);
        buffer.hash = Some(hash);
    }

    /// Clears the slots and the key-entry area for a new fill.
    pub fn cleanup_table(buffer: &mut JoinBuffer) {
        let mut hash = buffer.hash.take().expect("hash section missing");
        hash.last_key_entry = hash.hash_table_off;
        hash.key_entries = 0;
        hash.curr_key_entry = hash.hash_table_off;
        let off = hash.hash_table_off;
        if off <= buffer.buff.len() {
            buffer.buff[off..].fill(0);
        }
        buffer.hash = Some(hash);
    }
}

/// Cursor over the circular record chain of one key entry. The walk
/// terminates when it returns to the stored last link.
#[derive(Debug, Clone, Copy)]
pub struct ChainCursor {
    last: usize,
    next: Option<usize>,
}

impl JoinBuffer {
    /// Walks the slot list for a key image. Returns the key-entry
    /// offset when found, otherwise the cell where a new entry's
    /// reference belongs.
    fn hash_key_search(&self, key: &[u8]) -> (bool, usize) {
        let hash = self.hash.as_ref().expect("hash section missing");
        let idx = (hash.build_key.hash(key) % hash.hash_entries as u64) as usize;
        let mut cell = hash.hash_table_off + hash.size_of_key_ofs * idx;
        loop {
            let entry = read_offset(&self.buff, cell, hash.size_of_key_ofs);
            if entry == 0 {
                return (false, cell);
            }
            let entry_key = self.key_entry_bytes(entry);
            if hash.build_key.keys_equal(entry_key, key) {
                return (true, entry);
            }
            cell = entry;
        }
    }

    /// Key bytes of the entry at `entry`, resolving embedded keys.
    fn key_entry_bytes(&self, entry: usize) -> &[u8] {
        let hash = self.hash.as_ref().expect("hash section missing");
        if hash.use_emb_key {
            let emb = read_offset(
                &self.buff,
                entry - self.size_of_rec_ofs,
                self.size_of_rec_ofs,
            );
            &self.buff[emb..emb + hash.key_length]
        } else {
            &self.buff[entry - hash.key_length..entry]
        }
    }

    /// Adds the freshly appended record (starting at `rec_start`) to the
    /// hash index under `key`: splices it into an existing key's
    /// circular chain or allocates a new key entry from the top.
    pub(crate) fn hash_put_key(&mut self, key: &[u8], rec_start: usize) {
        let rec_ofs = self.size_of_rec_ofs;
        let (found, cell) = self.hash_key_search(key);
        let key_ofs = self.hash.as_ref().unwrap().size_of_key_ofs;
        if found {
            let entry = cell;
            let last_ref_pos = entry + key_ofs;
            let last_rec = read_offset(&self.buff, last_ref_pos, rec_ofs);
            // new.next = last.next; last.next = new; entry.last = new
            let next_of_last = read_offset(&self.buff, last_rec, rec_ofs);
            store_offset(&mut self.buff, rec_start, rec_ofs, next_of_last);
            store_offset(&mut self.buff, last_rec, rec_ofs, rec_start);
            store_offset(&mut self.buff, last_ref_pos, rec_ofs, rec_start);
            return;
        }
        let emb_ref = if self.hash.as_ref().unwrap().use_emb_key {
            Some(self.curr_rec_pos + self.layout.flag_fields_len())
        } else {
            None
        };
        let key_length = self.hash.as_ref().unwrap().key_length;
        let mut cp = self.hash.as_ref().unwrap().last_key_entry;
        cp -= rec_ofs + key_ofs;
        let entry = cp;
        store_offset(&mut self.buff, cell, key_ofs, entry);
        store_offset(&mut self.buff, entry, key_ofs, 0);
        // Single-record circular chain.
        store_offset(&mut self.buff, rec_start, rec_ofs, rec_start);
        store_offset(&mut self.buff, entry + key_ofs, rec_ofs, rec_start);
        match emb_ref {
            Some(emb) => {
                cp -= rec_ofs;
                store_offset(&mut self.buff, cp, rec_ofs, emb);
            }
            None => {
                cp -= key_length;
                self.buff[cp..cp + key.len()].copy_from_slice(key);
            }
        }
        debug_assert!(cp >= self.curr_rec_pos);
        let hash = self.hash.as_mut().unwrap();
        hash.last_key_entry = cp;
        hash.key_entries += 1;
    }

    /// Looks up the record chain for a probe key image. Returns the
    /// chain pointer (the key entry's last-record link) when the key is
    /// present.
    pub fn hash_lookup(&self, probe_key: &[u8]) -> Option<usize> {
        let hash = self.hash.as_ref()?;
        let (found, cell) = self.hash_key_search(probe_key);
        if found {
            Some(cell + hash.size_of_key_ofs)
        } else {
            None
        }
    }

    /// Opens a cursor over the circular record chain at `chain_ptr`.
    pub fn chain_cursor(&self, chain_ptr: usize) -> ChainCursor {
        let last = read_offset(&self.buff, chain_ptr, self.size_of_rec_ofs);
        ChainCursor { last, next: None }
    }

    /// Advances the chain cursor, returning the next record's
    /// field-region offset.
    pub fn chain_next(&self, cursor: &mut ChainCursor) -> Option<usize> {
        if cursor.next == Some(cursor.last) {
            return None;
        }
        let from = cursor.next.unwrap_or(cursor.last);
        let next = read_offset(&self.buff, from, self.size_of_rec_ofs);
        cursor.next = Some(next);
        Some(next + self.prefix_length())
    }

    /// `true` iff every record in the chain already has its match flag
    /// set to `Found`. Lets the multi-range read suppress whole ranges.
    pub fn check_all_match_flags_for_key(
        &self,
        prevs: &[JoinBuffer],
        chain_ptr: usize,
    ) -> bool {
        let mut cursor = self.chain_cursor(chain_ptr);
        while let Some(fields_pos) = self.chain_next(&mut cursor) {
            if self.match_flag_at(prevs, fields_pos) != MatchFlag::Found {
                return false;
            }
        }
        true
    }

    /// Iterates the distinct keys of the buffer, newest first, yielding
    /// the key bytes and the chain pointer used as the range tag.
    pub fn next_hashed_key(&mut self) -> Option<(Vec<u8>, usize)> {
        let (curr, last, entry_len, use_emb, key_length, key_ofs) = {
            let hash = self.hash.as_ref()?;
            (
                hash.curr_key_entry,
                hash.last_key_entry,
                hash.key_entry_length,
                hash.use_emb_key,
                hash.key_length,
                hash.size_of_key_ofs,
            )
        };
        if curr < last + entry_len {
            return None;
        }
        let block_start = curr - entry_len;
        self.hash.as_mut().unwrap().curr_key_entry = block_start;
        let entry = block_start
            + if use_emb {
                self.size_of_rec_ofs
            } else {
                key_length
            };
        let chain_ptr = entry + key_ofs;
        let key = self.key_entry_bytes(entry).to_vec();
        Some((key, chain_ptr))
    }

    pub fn hashed_key_count(&self) -> usize {
        self.hash.as_ref().map(|h| h.key_entries).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::buffer::{BufferParams, JoinBuffer};
    use crate::cache::layout::{BufferTable, Layout};
    use crate::keys::{KeyDef, RowImages, RowImagesMut};
    use crate::row::RowImage;
    use crate::schema::{Column, ColumnType, TableSchema};
    use crate::value::{Collation, Value};
    use ntest::timeout;
    use std::rc::Rc;

    fn schema(collation: Collation) -> Rc<TableSchema> {
        TableSchema::new(
            "t1",
            vec![
                Column::new("a", ColumnType::BigInt, false),
                Column::new("s", ColumnType::VarChar(12), false)
                    .with_collation(collation),
            ],
        )
        .unwrap()
    }

    fn hashed_buffer(
        collation: Collation,
        key_cols: &[usize],
    ) -> (JoinBuffer, Rc<TableSchema>) {
        let s = schema(collation);
        let key_columns: Vec<(usize, usize)> =
            key_cols.iter().map(|&c| (0usize, c)).collect();
        let key = Rc::new(KeyDef::for_columns(
            std::slice::from_ref(&s),
            &key_columns,
        ));
        let layout = Layout::build(
            vec![BufferTable {
                table: 0,
                schema: s.clone(),
                store_null_row: false,
                store_rowid: false,
            }],
            false,
            Some(&key),
            &mut |_, _| None,
        );
        let mut buffer = JoinBuffer::new(BufferParams {
            layout,
            feeds_table: "t2".to_string(),
            prev: None,
            is_key_access: false,
            preferred_size: 16 * 1024,
            size_limit: 0,
            aux_first: 0,
            hash: Some(HashConfig {
                build_key: key.clone(),
                probe_key: key,
            }),
        });
        buffer.allocate(buffer.max_buffer_size()).unwrap();
        (buffer, s)
    }

    fn append_row(buffer: &mut JoinBuffer, s: &Rc<TableSchema>, a: i64, txt: &str) {
        let mut row = RowImage::new(s.clone());
        row.set_value(0, &Value::Int(a)).unwrap();
        row.set_value(1, &Value::str(txt)).unwrap();
        let rows = vec![row];
        let result = buffer.append(&RowImages(&rows), 0, 0, None);
        assert!(result.written > 0);
    }

    #[test]
    #[timeout(1000)]
    fn test_equal_keys_share_chain() {
        let (mut buffer, s) = hashed_buffer(Collation::Binary, &[0]);
        append_row(&mut buffer, &s, 1, "x");
        append_row(&mut buffer, &s, 1, "y");
        append_row(&mut buffer, &s, 2, "z");
        assert_eq!(buffer.hashed_key_count(), 2);

        let mut probe = RowImage::new(s.clone());
        probe.set_value(0, &Value::Int(1)).unwrap();
        let key = buffer
            .hash
            .as_ref()
            .unwrap()
            .probe_key
            .image_from_row(&probe);
        let chain = buffer.hash_lookup(&key).expect("key must be present");

        let mut cursor = buffer.chain_cursor(chain);
        let mut seen = Vec::new();
        let mut rows = vec![RowImage::new(s.clone())];
        while let Some(fields_pos) = buffer.chain_next(&mut cursor) {
            buffer
                .read_fields_at(
                    fields_pos,
                    &mut RowImagesMut(&mut rows),
                )
                .unwrap();
            seen.push(rows[0].value(1));
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&Value::str("x")));
        assert!(seen.contains(&Value::str("y")));
    }

    #[test]
    #[timeout(1000)]
    fn test_missing_key_lookup() {
        let (mut buffer, s) = hashed_buffer(Collation::Binary, &[0]);
        append_row(&mut buffer, &s, 1, "x");
        let mut probe = RowImage::new(s.clone());
        probe.set_value(0, &Value::Int(42)).unwrap();
        let key = buffer
            .hash
            .as_ref()
            .unwrap()
            .probe_key
            .image_from_row(&probe);
        assert!(buffer.hash_lookup(&key).is_none());
    }

    #[test]
    #[timeout(1000)]
    fn test_collation_aware_grouping() {
        let (mut buffer, s) = hashed_buffer(Collation::CaseInsensitive, &[1]);
        append_row(&mut buffer, &s, 1, "Alpha");
        append_row(&mut buffer, &s, 2, "ALPHA");
        append_row(&mut buffer, &s, 3, "beta");
        // Collation-equal strings hash to one key entry.
        assert_eq!(buffer.hashed_key_count(), 2);

        let mut probe = RowImage::new(s.clone());
        probe.set_value(1, &Value::str("alpha")).unwrap();
        let key = buffer
            .hash
            .as_ref()
            .unwrap()
            .probe_key
            .image_from_row(&probe);
        let chain = buffer.hash_lookup(&key).expect("collation-equal key");
        let mut cursor = buffer.chain_cursor(chain);
        let mut count = 0;
        while buffer.chain_next(&mut cursor).is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    #[timeout(1000)]
    fn test_embedded_key_used_for_fixed_parts() {
        let (buffer, _s) = hashed_buffer(Collation::Binary, &[0]);
        assert!(buffer.hash.as_ref().unwrap().use_emb_key);
        // A varstring part disables the embedded key.
        let (buffer2, _s2) = hashed_buffer(Collation::Binary, &[1]);
        assert!(!buffer2.hash.as_ref().unwrap().use_emb_key);
    }

    #[test]
    #[timeout(1000)]
    fn test_key_iteration_covers_all_keys() {
        let (mut buffer, s) = hashed_buffer(Collation::Binary, &[0]);
        for a in [10i64, 20, 20, 30] {
            append_row(&mut buffer, &s, a, "v");
        }
        buffer.reset(false);
        let mut keys = Vec::new();
        while let Some((key, _tag)) = buffer.next_hashed_key() {
            keys.push(key);
        }
        assert_eq!(keys.len(), 3);
    }

    #[test]
    #[timeout(1000)]
    fn test_impossible_record_gets_no_key() {
        let s = schema(Collation::Binary);
        let key = Rc::new(KeyDef::for_columns(
            std::slice::from_ref(&s),
            &[(0, 0)],
        ));
        let layout = Layout::build(
            vec![BufferTable {
                table: 0,
                schema: s.clone(),
                store_null_row: true,
                store_rowid: false,
            }],
            true,
            Some(&key),
            &mut |_, _| None,
        );
        let mut buffer = JoinBuffer::new(BufferParams {
            layout,
            feeds_table: "t2".to_string(),
            prev: None,
            is_key_access: false,
            preferred_size: 16 * 1024,
            size_limit: 0,
            aux_first: 0,
            hash: Some(HashConfig {
                build_key: key.clone(),
                probe_key: key,
            }),
        });
        buffer.allocate(buffer.max_buffer_size()).unwrap();

        let mut row = RowImage::new(s.clone());
        row.set_value(0, &Value::Int(1)).unwrap();
        row.set_value(1, &Value::str("q")).unwrap();
        let rows = vec![row];
        buffer.append(&RowImages(&rows), 0, 0, Some(true));
        assert_eq!(buffer.records(), 1);
        assert_eq!(buffer.hashed_key_count(), 0);
    }
}
