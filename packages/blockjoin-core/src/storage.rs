//! Storage handler interface and the in-memory engine behind it.
//!
//! The executor consumes tables only through the [`Handler`] trait:
//! sequential scans, index lookups, multi-range reads and temp-table
//! writes. [`MemTable`] implements it over packed row bytes with
//! ordered indexes and per-index cardinality statistics.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::error::JoinError;
use crate::keys::KeyDef;
use crate::row::RowImage;
use crate::schema::TableSchema;
use crate::value::Value;

/// Multi-range read mode.
///
/// Tag-reuse behavior is undefined under no-association, so this engine
/// only implements the associated mode where every returned row carries
/// its range tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrrMode {
    Associated,
    NoAssociation,
}

/// Association tag identifying the buffer record (or key chain) a range
/// was built from.
pub type RangeTag = usize;

/// An equality range produced by a range sequence.
#[derive(Debug, Clone)]
pub struct KeyRange {
    /// Packed key image; start and end of the range coincide
    pub key: Vec<u8>,
    pub tag: RangeTag,
}

/// Outcome of a temp-table row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Duplicate,
}

/// Callback-driven sequence of equality ranges consumed by a
/// multi-range read.
pub trait RangeSequence {
    /// Rewinds the sequence.
    fn init(&mut self);
    /// Produces the next range, or `None` at the end.
    fn next(&mut self) -> Result<Option<KeyRange>, JoinError>;
    /// Returns `true` when the range with this tag no longer needs rows.
    fn skip_record(&mut self, tag: RangeTag) -> bool;
    /// Index-condition pushdown: `true` means the fetched row cannot
    /// match any record associated with the tag.
    fn skip_index_tuple(
        &mut self,
        tag: RangeTag,
        row: &RowImage,
    ) -> Result<bool, JoinError>;
}

/// Storage handler interface consumed by the join executor.
pub trait Handler {
    fn schema(&self) -> &Rc<TableSchema>;
    fn row_count(&self) -> usize;

    fn rnd_init(&mut self);
    /// Reads the next row of a sequential scan; `false` at the end.
    fn rnd_next(&mut self, row: &mut RowImage) -> Result<bool, JoinError>;
    fn rnd_end(&mut self);

    /// Reads the row with the given rowid.
    fn read_row(&mut self, rowid: u64, row: &mut RowImage) -> Result<(), JoinError>;

    fn index_init(&mut self, index_no: usize);
    fn index_end(&mut self);
    /// Positions on the first row matching the key image; `false` when
    /// there is none.
    fn index_read(
        &mut self,
        index_no: usize,
        key_image: &[u8],
        row: &mut RowImage,
    ) -> Result<bool, JoinError>;
    /// Next row with the same key as the last `index_read`.
    fn index_next_same(&mut self, row: &mut RowImage) -> Result<bool, JoinError>;
    /// First row in index order.
    fn index_first(
        &mut self,
        index_no: usize,
        row: &mut RowImage,
    ) -> Result<bool, JoinError>;
    /// Next row in index order.
    fn index_next(&mut self, row: &mut RowImage) -> Result<bool, JoinError>;

    /// Rowid of the last row read.
    fn position(&self) -> u64;
    /// Width of a stored rowid.
    fn ref_length(&self) -> usize {
        8
    }
    /// Average number of rows per distinct full key of the index.
    fn rec_per_key(&self, index_no: usize) -> f64;
    /// Per-row overhead the engine reports for MRR buffer sizing.
    fn mrr_length_per_rec(&self) -> usize;

    fn multi_range_read_init(
        &mut self,
        mode: MrrMode,
        index_no: usize,
        n_ranges: usize,
        buf_size: usize,
    ) -> Result<(), JoinError>;
    /// Fetches the next row of the multi-range read into `row` and
    /// returns its association tag, or `None` at the end.
    fn multi_range_read_next(
        &mut self,
        seq: &mut dyn RangeSequence,
        row: &mut RowImage,
    ) -> Result<Option<RangeTag>, JoinError>;

    /// Writes a row into a temp table, reporting unique-key violations
    /// as `Duplicate` rather than an error.
    fn write_tmp_row(&mut self, row: &RowImage) -> Result<WriteOutcome, JoinError>;
    /// Removes all rows, keeping the schema and index definitions.
    fn delete_all_rows(&mut self);
}

/// Index definition over a table's own columns.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub columns: Vec<usize>,
    pub unique: bool,
}

#[derive(Debug)]
struct Index {
    def: IndexDef,
    key: KeyDef,
    /// Normalized key image -> rowids in insertion order
    map: BTreeMap<Vec<u8>, Vec<u64>>,
}

#[derive(Debug)]
struct MrrState {
    index_no: usize,
    posting: VecDeque<(u64, RangeTag)>,
    done: bool,
}

#[derive(Debug, Default)]
struct Cursors {
    scan_pos: usize,
    index_no: usize,
    same_key: Vec<u64>,
    same_pos: usize,
    ordered: Vec<u64>,
    ordered_pos: usize,
}

/// In-memory table engine.
#[derive(Debug)]
pub struct MemTable {
    schema: Rc<TableSchema>,
    rows: Vec<Vec<u8>>,
    indexes: Vec<Index>,
    /// Whole-row unique constraint, used by temp tables whose tuple
    /// exceeds what a key could cover
    unique_rows: Option<HashSet<Vec<u8>>>,
    cursors: Cursors,
    mrr: Option<MrrState>,
    last_position: u64,
}

impl MemTable {
    pub fn new(schema: Rc<TableSchema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            indexes: Vec::new(),
            unique_rows: None,
            cursors: Cursors::default(),
            mrr: None,
            last_position: 0,
        }
    }

    /// Adds an index; valid only while the table is empty.
    pub fn add_index(&mut self, def: IndexDef) -> usize {
        assert!(self.rows.is_empty(), "indexes must be added before rows");
        let columns: Vec<(usize, usize)> =
            def.columns.iter().map(|&c| (0, c)).collect();
        let key = KeyDef::for_columns(
            std::slice::from_ref(&self.schema),
            &columns,
        );
        self.indexes.push(Index {
            def,
            key,
            map: BTreeMap::new(),
        });
        self.indexes.len() - 1
    }

    /// Enables the whole-row unique constraint used by temp tables.
    pub fn with_unique_rows(mut self) -> Self {
        self.unique_rows = Some(HashSet::new());
        self
    }

    pub fn index_key(&self, index_no: usize) -> &KeyDef {
        &self.indexes[index_no].key
    }

    pub fn index_def(&self, index_no: usize) -> &IndexDef {
        &self.indexes[index_no].def
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Inserts a row built from values; test fixtures and the
    /// materialization path use this. Unique violations are errors here.
    pub fn push_values(&mut self, values: &[Value]) -> Result<u64, JoinError> {
        let mut scratch = RowImage::new(self.schema.clone());
        for (col, value) in values.iter().enumerate() {
            scratch.set_value(col, value)?;
        }
        match self.write_row(&scratch, false)? {
            WriteOutcome::Inserted => Ok(self.rows.len() as u64 - 1),
            WriteOutcome::Duplicate => Err(JoinError::TempTableWrite(format!(
                "duplicate key in table '{}'",
                self.schema.name
            ))),
        }
    }

    fn write_row(
        &mut self,
        row: &RowImage,
        _tmp: bool,
    ) -> Result<WriteOutcome, JoinError> {
        let packed = row.pack();
        if let Some(unique) = &self.unique_rows {
            if unique.contains(&packed) {
                return Ok(WriteOutcome::Duplicate);
            }
        }
        let mut images = Vec::with_capacity(self.indexes.len());
        for index in &self.indexes {
            let image = index.key.normalize_image(&index.key.image_from_row(row));
            if index.def.unique {
                if let Some(existing) = index.map.get(&image) {
                    if !existing.is_empty() {
                        return Ok(WriteOutcome::Duplicate);
                    }
                }
            }
            images.push(image);
        }
        let rowid = self.rows.len() as u64;
        self.rows.push(packed.clone());
        if let Some(unique) = &mut self.unique_rows {
            unique.insert(packed);
        }
        for (index, image) in self.indexes.iter_mut().zip(images) {
            index.map.entry(image).or_default().push(rowid);
        }
        Ok(WriteOutcome::Inserted)
    }

    fn unpack_into(&mut self, rowid: u64, row: &mut RowImage) -> Result<(), JoinError> {
        let packed = self
            .rows
            .get(rowid as usize)
            .ok_or_else(|| {
                JoinError::Storage(format!(
                    "rowid {} out of range in table '{}'",
                    rowid, self.schema.name
                ))
            })?;
        row.unpack(packed);
        self.last_position = rowid;
        Ok(())
    }
}

impl Handler for MemTable {
    fn schema(&self) -> &Rc<TableSchema> {
        &self.schema
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn rnd_init(&mut self) {
        self.cursors.scan_pos = 0;
    }

    fn rnd_next(&mut self, row: &mut RowImage) -> Result<bool, JoinError> {
        if self.cursors.scan_pos >= self.rows.len() {
            return Ok(false);
        }
        let rowid = self.cursors.scan_pos as u64;
        self.cursors.scan_pos += 1;
        self.unpack_into(rowid, row)?;
        Ok(true)
    }

    fn rnd_end(&mut self) {
        self.cursors.scan_pos = 0;
    }

    fn read_row(&mut self, rowid: u64, row: &mut RowImage) -> Result<(), JoinError> {
        self.unpack_into(rowid, row)
    }

    fn index_init(&mut self, index_no: usize) {
        self.cursors.index_no = index_no;
        self.cursors.same_key.clear();
        self.cursors.same_pos = 0;
        self.cursors.ordered.clear();
        self.cursors.ordered_pos = 0;
    }

    fn index_end(&mut self) {
        self.cursors.same_key.clear();
        self.cursors.ordered.clear();
    }

    fn index_read(
        &mut self,
        index_no: usize,
        key_image: &[u8],
        row: &mut RowImage,
    ) -> Result<bool, JoinError> {
        let index = &self.indexes[index_no];
        let norm = index.key.normalize_image(key_image);
        let rowids = index.map.get(&norm).cloned().unwrap_or_default();
        self.cursors.index_no = index_no;
        self.cursors.same_key = rowids;
        self.cursors.same_pos = 0;
        self.index_next_same(row)
    }

    fn index_next_same(&mut self, row: &mut RowImage) -> Result<bool, JoinError> {
        if self.cursors.same_pos >= self.cursors.same_key.len() {
            return Ok(false);
        }
        let rowid = self.cursors.same_key[self.cursors.same_pos];
        self.cursors.same_pos += 1;
        self.unpack_into(rowid, row)?;
        Ok(true)
    }

    fn index_first(
        &mut self,
        index_no: usize,
        row: &mut RowImage,
    ) -> Result<bool, JoinError> {
        let index = &self.indexes[index_no];
        self.cursors.index_no = index_no;
        self.cursors.ordered = index
            .map
            .values()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        self.cursors.ordered_pos = 0;
        self.index_next(row)
    }

    fn index_next(&mut self, row: &mut RowImage) -> Result<bool, JoinError> {
        if self.cursors.ordered_pos >= self.cursors.ordered.len() {
            return Ok(false);
        }
        let rowid = self.cursors.ordered[self.cursors.ordered_pos];
        self.cursors.ordered_pos += 1;
        self.unpack_into(rowid, row)?;
        Ok(true)
    }

    fn position(&self) -> u64 {
        self.last_position
    }

    fn rec_per_key(&self, index_no: usize) -> f64 {
        let index = &self.indexes[index_no];
        let keys = index.map.len();
        if keys == 0 {
            1.0
        } else {
            (self.rows.len() as f64 / keys as f64).max(1.0)
        }
    }

    fn mrr_length_per_rec(&self) -> usize {
        self.ref_length() + std::mem::size_of::<usize>()
    }

    fn multi_range_read_init(
        &mut self,
        mode: MrrMode,
        index_no: usize,
        _n_ranges: usize,
        buf_size: usize,
    ) -> Result<(), JoinError> {
        if mode == MrrMode::NoAssociation {
            return Err(JoinError::MrrInit(
                "no-association mode is not supported".to_string(),
            ));
        }
        if buf_size == 0 {
            return Err(JoinError::MrrInit("zero MRR buffer".to_string()));
        }
        if index_no >= self.indexes.len() {
            return Err(JoinError::MrrInit(format!(
                "index {} does not exist on table '{}'",
                index_no, self.schema.name
            )));
        }
        self.mrr = Some(MrrState {
            index_no,
            posting: VecDeque::new(),
            done: false,
        });
        Ok(())
    }

    fn multi_range_read_next(
        &mut self,
        seq: &mut dyn RangeSequence,
        row: &mut RowImage,
    ) -> Result<Option<RangeTag>, JoinError> {
        loop {
            let front = match &mut self.mrr {
                Some(state) => state.posting.pop_front(),
                None => {
                    return Err(JoinError::Storage(
                        "multi_range_read_next without init".to_string(),
                    ))
                }
            };
            if let Some((rowid, tag)) = front {
                self.unpack_into(rowid, row)?;
                if seq.skip_index_tuple(tag, row)? {
                    continue;
                }
                return Ok(Some(tag));
            }
            if self.mrr.as_ref().map(|s| s.done).unwrap_or(true) {
                self.mrr = None;
                return Ok(None);
            }
            match seq.next()? {
                None => {
                    if let Some(state) = &mut self.mrr {
                        state.done = true;
                    }
                }
                Some(range) => {
                    if seq.skip_record(range.tag) {
                        continue;
                    }
                    let index_no = self.mrr.as_ref().unwrap().index_no;
                    let index = &self.indexes[index_no];
                    let norm = index.key.normalize_image(&range.key);
                    let rowids =
                        index.map.get(&norm).cloned().unwrap_or_default();
                    let state = self.mrr.as_mut().unwrap();
                    for rowid in rowids {
                        state.posting.push_back((rowid, range.tag));
                    }
                }
            }
        }
    }

    fn write_tmp_row(&mut self, row: &RowImage) -> Result<WriteOutcome, JoinError> {
        self.write_row(row, true)
    }

    fn delete_all_rows(&mut self) {
        self.rows.clear();
        for index in &mut self.indexes {
            index.map.clear();
        }
        if let Some(unique) = &mut self.unique_rows {
            unique.clear();
        }
        self.cursors = Cursors::default();
        self.mrr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};
    use ntest::timeout;

    fn table() -> MemTable {
        let schema = TableSchema::new(
            "t",
            vec![
                Column::new("a", ColumnType::BigInt, false),
                Column::new("b", ColumnType::BigInt, true),
            ],
        )
        .unwrap();
        MemTable::new(schema)
    }

    #[test]
    #[timeout(1000)]
    fn test_scan() {
        let mut t = table();
        for i in 0..5 {
            t.push_values(&[Value::Int(i), Value::Int(i * 10)]).unwrap();
        }
        let mut row = RowImage::new(t.schema().clone());
        t.rnd_init();
        let mut seen = Vec::new();
        while t.rnd_next(&mut row).unwrap() {
            seen.push(row.value(0));
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(t.position(), 4);
    }

    #[test]
    #[timeout(1000)]
    fn test_index_lookup() {
        let mut t = table();
        let idx = t.add_index(IndexDef {
            columns: vec![0],
            unique: false,
        });
        for v in [1i64, 2, 2, 3] {
            t.push_values(&[Value::Int(v), Value::Null]).unwrap();
        }
        let key = t.index_key(idx).clone();
        let mut probe = RowImage::new(t.schema().clone());
        probe.set_value(0, &Value::Int(2)).unwrap();
        let image = key.image_from_row(&probe);

        let mut row = RowImage::new(t.schema().clone());
        assert!(t.index_read(idx, &image, &mut row).unwrap());
        assert_eq!(row.value(0), Value::Int(2));
        assert!(t.index_next_same(&mut row).unwrap());
        assert!(!t.index_next_same(&mut row).unwrap());

        assert_eq!(t.rec_per_key(idx) > 1.0, true);
    }

    #[test]
    #[timeout(1000)]
    fn test_unique_index_duplicate() {
        let mut t = table();
        t.add_index(IndexDef {
            columns: vec![0],
            unique: true,
        });
        t.push_values(&[Value::Int(1), Value::Null]).unwrap();
        let mut row = RowImage::new(t.schema().clone());
        row.set_value(0, &Value::Int(1)).unwrap();
        assert_eq!(t.write_tmp_row(&row).unwrap(), WriteOutcome::Duplicate);
        row.set_value(0, &Value::Int(2)).unwrap();
        assert_eq!(t.write_tmp_row(&row).unwrap(), WriteOutcome::Inserted);
    }

    #[test]
    #[timeout(1000)]
    fn test_delete_all_rows() {
        let mut t = table().with_unique_rows();
        t.push_values(&[Value::Int(1), Value::Null]).unwrap();
        t.delete_all_rows();
        assert_eq!(t.row_count(), 0);
        // The same tuple inserts again after truncation
        t.push_values(&[Value::Int(1), Value::Null]).unwrap();
        assert_eq!(t.row_count(), 1);
    }
}
