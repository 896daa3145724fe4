//! The join buffer: a contiguous arena of packed driving-row records.
//!
//! Records are appended during the fill phase and read back while the
//! right-hand table is scanned. Every record carries, in order: an
//! optional length prefix, an optional back-reference into the previous
//! chained buffer, the flag fields, the packed data fields and a
//! trailing table of offsets for fields referenced by later buffers.
//! All width constants are fixed per buffer.

use std::rc::Rc;

use crate::cache::hashed::HashIndex;
use crate::cache::layout::{FieldKind, FieldSource, Layout};
use crate::cache::{offset_size, read_offset, store_offset, MatchFlag};
use crate::error::JoinError;
use crate::keys::{Rows, RowsMut};

/// Offset 0 is the null reference, so records start at 1.
pub(crate) const REC_BASE: usize = 1;

/// Result of appending one driving row.
#[derive(Debug, Clone, Copy)]
pub struct AppendResult {
    /// Bytes written; 0 when the record did not fit at all
    pub written: usize,
    /// The buffer cannot take another record after this one
    pub is_full: bool,
}

/// Construction parameters of a join buffer.
pub struct BufferParams {
    pub layout: Layout,
    /// Executor tab index of the table this buffer feeds, for logs
    pub feeds_table: String,
    /// Previous buffer in the chain: (cache index, its record-offset width)
    pub prev: Option<(usize, usize)>,
    /// The right-hand access builds keys from buffered records
    pub is_key_access: bool,
    /// Preferred buffer size from configuration
    pub preferred_size: usize,
    /// Optional per-table cap (0 = none)
    pub size_limit: usize,
    /// Auxiliary (MRR) buffer increment of the first record
    pub aux_first: usize,
    /// Hash section configuration, present for the hashed variants
    pub hash: Option<crate::cache::hashed::HashConfig>,
}

/// A join buffer over one segment of the join order.
#[derive(Debug)]
pub struct JoinBuffer {
    pub(crate) layout: Layout,
    pub(crate) feeds_table: String,
    pub(crate) buff: Vec<u8>,
    pub(crate) buff_size: usize,

    pub(crate) size_of_rec_ofs: usize,
    pub(crate) size_of_rec_len: usize,
    pub(crate) size_of_fld_ofs: usize,
    pub(crate) with_length: bool,

    pub(crate) prev: Option<usize>,
    prev_rec_ofs_size: usize,

    pub(crate) pack_length: usize,
    pub(crate) pack_length_with_blob_ptrs: usize,
    pub(crate) avg_record_length: usize,
    pub(crate) avg_aux_buffer_incr: usize,
    min_buff_size: usize,
    max_buff_size: usize,

    records: usize,
    pos: usize,
    end_pos: usize,
    pub(crate) curr_rec_pos: usize,
    last_rec_pos: usize,
    curr_rec_link: usize,
    last_written_is_impossible: bool,
    blob_data_in_rec_buff: bool,
    aux_buff_size: usize,
    pub(crate) referenced_fields: usize,
    write_offsets: Vec<usize>,

    pub(crate) hash: Option<HashIndex>,
}

impl JoinBuffer {
    pub fn new(params: BufferParams) -> Self {
        let prev_rec_ofs_size = params.prev.map(|(_, w)| w).unwrap_or(0);
        let fields = params.layout.descrs.len();
        let blobs = params.layout.blobs;
        let base_len = params.layout.base_len;
        let write_offsets = vec![0; fields];

        let mut buffer = Self {
            feeds_table: params.feeds_table,
            buff: Vec::new(),
            buff_size: 0,
            size_of_rec_ofs: 0,
            size_of_rec_len: 0,
            size_of_fld_ofs: 0,
            with_length: false,
            prev: params.prev.map(|(idx, _)| idx),
            prev_rec_ofs_size,
            pack_length: 0,
            pack_length_with_blob_ptrs: 0,
            avg_record_length: 0,
            avg_aux_buffer_incr: params.aux_first,
            min_buff_size: 0,
            max_buff_size: 0,
            records: 0,
            pos: REC_BASE,
            end_pos: REC_BASE,
            curr_rec_pos: REC_BASE,
            last_rec_pos: REC_BASE,
            curr_rec_link: 0,
            last_written_is_impossible: false,
            blob_data_in_rec_buff: false,
            aux_buff_size: 0,
            referenced_fields: 0,
            write_offsets,
            hash: None,
            layout: params.layout,
        };

        // Worst-case record estimate before the exact widths are known.
        let len_estimate = base_len
            + fields * std::mem::size_of::<u32>()
            + blobs * std::mem::size_of::<usize>()
            + prev_rec_ofs_size
            + std::mem::size_of::<u64>();
        buffer.buff_size = params.preferred_size.max(2 * len_estimate);
        buffer.with_length = params.is_key_access
            || buffer.layout.with_match_flag
            || params.hash.is_some();
        buffer.set_constants(len_estimate);

        if let Some(cfg) = params.hash {
            let hash = HashIndex::new(cfg, &buffer);
            buffer.pack_length += buffer.size_of_rec_ofs;
            buffer.pack_length_with_blob_ptrs += buffer.size_of_rec_ofs;
            buffer.hash = Some(hash);
        }

        let key_addon = buffer
            .hash
            .as_ref()
            .map(|h| h.max_key_addon_space_per_record(buffer.size_of_rec_ofs))
            .unwrap_or(0);
        let affix = buffer.prefix_length()
            + buffer.size_of_fld_ofs * buffer.layout.data_fields();
        buffer.avg_record_length = base_len + affix;
        buffer.min_buff_size = REC_BASE
            + buffer.avg_record_length
            + key_addon
            + buffer.avg_aux_buffer_incr
            + buffer.pack_length_with_blob_ptrs;
        let mut limit = buffer.buff_size;
        if params.size_limit > 0 {
            limit = limit.min(params.size_limit);
        }
        buffer.max_buff_size = limit.max(buffer.min_buff_size);
        buffer
    }

    /// Chooses the width constants for a buffer of the current
    /// `buff_size` and recomputes the packed-length bounds.
    fn set_constants(&mut self, len_estimate: usize) {
        self.size_of_rec_ofs = offset_size(self.buff_size);
        self.size_of_rec_len = if self.layout.blobs > 0 {
            self.size_of_rec_ofs
        } else {
            offset_size(len_estimate)
        };
        self.size_of_fld_ofs = self.size_of_rec_len;
        self.recompute_pack_length();
    }

    fn recompute_pack_length(&mut self) {
        let hashed_link = if self.hash.is_some() {
            self.size_of_rec_ofs
        } else {
            0
        };
        self.pack_length = hashed_link
            + if self.with_length { self.size_of_rec_len } else { 0 }
            + self.prev_rec_ofs_size
            + self.layout.base_len
            + self.size_of_fld_ofs * self.referenced_fields;
        self.pack_length_with_blob_ptrs =
            self.pack_length + self.layout.blobs * std::mem::size_of::<usize>();
    }

    /// Registers a column of this buffer as referenced by a later
    /// buffer; returns the descriptor index. The first registration of a
    /// field assigns its `referenced_field_no`, and the first
    /// registration overall turns on the length prefix.
    pub fn register_referenced_column(
        &mut self,
        table: usize,
        column: usize,
    ) -> Option<usize> {
        let idx = self.layout.descr_of_column(table, column)?;
        if self.layout.descrs[idx].referenced_field_no == 0 {
            self.referenced_fields += 1;
            self.layout.descrs[idx].referenced_field_no = self.referenced_fields;
            self.with_length = true;
            self.recompute_pack_length();
        }
        Some(idx)
    }

    /// Allocates the arena. The final size comes from the space-budget
    /// fitting pass and must lie between the buffer's floor and cap.
    pub fn allocate(&mut self, size: usize) -> Result<(), JoinError> {
        if size < self.min_buff_size {
            return Err(JoinError::BufferFloorExceeded {
                table: self.feeds_table.clone(),
                required: self.min_buff_size,
                available: size,
            });
        }
        self.buff_size = size;
        if offset_size(size) > self.size_of_rec_ofs {
            self.set_constants(size);
        }
        self.buff = vec![0u8; size];
        tracing::debug!(
            "allocated {} byte join buffer for table '{}'",
            size,
            self.feeds_table
        );
        if self.hash.is_some() {
            HashIndex::init_table(self);
        }
        self.reset(true);
        Ok(())
    }

    pub fn min_buffer_size(&self) -> usize {
        self.min_buff_size
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buff_size
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn blob_data_in_rec_buff(&self) -> bool {
        self.blob_data_in_rec_buff
    }

    pub fn last_rec_pos(&self) -> Option<usize> {
        if self.records > 0 {
            Some(self.last_rec_pos)
        } else {
            None
        }
    }

    /// Fixed number of prefix bytes before a record's field region.
    pub(crate) fn prefix_length(&self) -> usize {
        let hashed_link = if self.hash.is_some() {
            self.size_of_rec_ofs
        } else {
            0
        };
        hashed_link
            + if self.with_length { self.size_of_rec_len } else { 0 }
            + self.prev_rec_ofs_size
    }

    /// Remaining writable space, accounting for the auxiliary buffer
    /// reservation and, in the hashed variant, the key-entry region.
    pub(crate) fn rem_space(&self) -> usize {
        let top = match &self.hash {
            Some(h) => h.last_key_entry,
            None => self.buff_size,
        };
        top.saturating_sub(self.end_pos + self.aux_buff_size)
    }

    /// Appends the current driving-row combination.
    ///
    /// `prev_link` is the field-region offset of the referenced record
    /// in the previous chained buffer. `aux_incr` is the scanner's MRR
    /// buffer increment for this record. `precond_is_false` reports the
    /// parent ON-precondition outcome when this buffer feeds the first
    /// inner table of an outer or semi join.
    pub fn append(
        &mut self,
        rows: &dyn Rows,
        prev_link: usize,
        aux_incr: usize,
        precond_is_false: Option<bool>,
    ) -> AppendResult {
        let key_extra = self
            .hash
            .as_ref()
            .map(|h| h.key_entry_length + h.size_of_key_ofs)
            .unwrap_or(0);

        // Dynamic blob payload total for this row.
        let mut blob_total = 0;
        for descr in &self.layout.descrs[self.layout.flag_fields..] {
            if descr.kind == FieldKind::Blob {
                if let FieldSource::Column { table, column } = descr.source {
                    let row = rows.row(table);
                    if !row.is_null(column) {
                        blob_total += row.blob_len(column);
                    }
                }
            }
        }

        // Hard guard: the record must physically fit below the key
        // region. A correctly sized buffer never trips this for the
        // first record of a fill.
        let worst_write = self.prefix_length()
            + self.layout.base_len
            + blob_total
            + self.size_of_fld_ofs * self.referenced_fields;
        let writable_limit = match &self.hash {
            Some(h) => h.last_key_entry.saturating_sub(h.key_entry_length),
            None => self.buff_size,
        };
        if self.pos + worst_write > writable_limit {
            return AppendResult {
                written: 0,
                is_full: true,
            };
        }

        self.records += 1;

        let len = self.pack_length + key_extra + blob_total;
        let rem = self.rem_space();
        self.aux_buff_size += if len + aux_incr < rem { aux_incr } else { rem };
        let is_full =
            len + self.pack_length_with_blob_ptrs + key_extra > self.rem_space();

        let init_pos = self.pos;
        let mut cp = self.pos;
        let rec_start = cp;

        if self.hash.is_some() {
            // Reserved for the next-record-in-chain link.
            store_offset(&mut self.buff, cp, self.size_of_rec_ofs, 0);
            cp += self.size_of_rec_ofs;
        }
        let rec_len_ptr = if self.with_length {
            let p = cp;
            cp += self.size_of_rec_len;
            Some(p)
        } else {
            None
        };
        if self.prev.is_some() {
            store_offset(&mut self.buff, cp, self.prev_rec_ofs_size, prev_link);
            cp += self.prev_rec_ofs_size;
        }
        self.curr_rec_pos = cp;

        // Flag fields.
        for descr in &self.layout.descrs[..self.layout.flag_fields] {
            match descr.source {
                FieldSource::MatchFlag => {
                    self.buff[cp] = MatchFlag::NotFound as u8;
                    cp += 1;
                }
                FieldSource::NullBits { table } => {
                    let bits = rows.row(table).null_bits();
                    self.buff[cp..cp + bits.len()].copy_from_slice(bits);
                    cp += bits.len();
                }
                FieldSource::NullRow { table } => {
                    self.buff[cp] = u8::from(rows.row(table).null_row);
                    cp += 1;
                }
                FieldSource::Rowid { table } => {
                    let rowid = rows.rowid(table).to_le_bytes();
                    self.buff[cp..cp + 8].copy_from_slice(&rowid);
                    cp += 8;
                }
                FieldSource::Column { .. } => unreachable!(),
            }
        }

        // Data fields, skipping NULL columns.
        let mut left_blob_in_rec_buff = false;
        for i in self.layout.flag_fields..self.layout.descrs.len() {
            let descr = &self.layout.descrs[i];
            let (table, column) = match descr.source {
                FieldSource::Column { table, column } => (table, column),
                _ => unreachable!(),
            };
            let row = rows.row(table);
            if row.is_null(column) {
                self.write_offsets[i] = 0;
                continue;
            }
            self.write_offsets[i] = cp - self.curr_rec_pos;
            let slot = row.slot_bytes(column);
            match descr.kind {
                FieldKind::Fixed => {
                    self.buff[cp..cp + descr.length].copy_from_slice(slot);
                    cp += descr.length;
                }
                FieldKind::VarStr1 => {
                    let len = slot[0] as usize + 1;
                    self.buff[cp..cp + len].copy_from_slice(&slot[..len]);
                    cp += len;
                }
                FieldKind::VarStr2 => {
                    let len = u16::from_le_bytes(slot[..2].try_into().unwrap())
                        as usize
                        + 2;
                    self.buff[cp..cp + len].copy_from_slice(&slot[..len]);
                    cp += len;
                }
                FieldKind::StrippedString => {
                    let mut end = slot.len();
                    while end > 0 && slot[end - 1] == b' ' {
                        end -= 1;
                    }
                    self.buff[cp..cp + 2]
                        .copy_from_slice(&(end as u16).to_le_bytes());
                    self.buff[cp + 2..cp + 2 + end].copy_from_slice(&slot[..end]);
                    cp += 2 + end;
                }
                FieldKind::Blob => {
                    self.buff[cp..cp + 4].copy_from_slice(&slot[..4]);
                    cp += 4;
                    if is_full {
                        // Last record of the fill: the payload stays in
                        // the driving row's image.
                        left_blob_in_rec_buff = true;
                    } else {
                        let payload = row.blob_payload(column);
                        self.buff[cp..cp + payload.len()]
                            .copy_from_slice(payload);
                        cp += payload.len();
                    }
                }
            }
        }

        // Trailing offsets of fields referenced by later buffers.
        if self.referenced_fields > 0 {
            let mut cnt = 0;
            for i in self.layout.flag_fields..self.layout.descrs.len() {
                let no = self.layout.descrs[i].referenced_field_no;
                if no > 0 {
                    store_offset(
                        &mut self.buff,
                        cp + self.size_of_fld_ofs * (no - 1),
                        self.size_of_fld_ofs,
                        self.write_offsets[i],
                    );
                    cnt += 1;
                }
            }
            cp += self.size_of_fld_ofs * cnt;
        }

        if let Some(ptr) = rec_len_ptr {
            let rec_len = cp - ptr - self.size_of_rec_len;
            store_offset(&mut self.buff, ptr, self.size_of_rec_len, rec_len);
        }
        if left_blob_in_rec_buff {
            self.blob_data_in_rec_buff = true;
        }
        self.last_rec_pos = self.curr_rec_pos;
        self.end_pos = cp;
        self.pos = cp;

        self.last_written_is_impossible = false;
        if precond_is_false == Some(true) {
            self.buff[self.curr_rec_pos] = MatchFlag::Impossible as u8;
            self.last_written_is_impossible = true;
        }

        if self.hash.is_some() && !self.last_written_is_impossible {
            let key = if self.hash.as_ref().unwrap().use_emb_key {
                self.embedded_key_at(self.curr_rec_pos).to_vec()
            } else {
                let build_key: Rc<crate::keys::KeyDef> =
                    self.hash.as_ref().unwrap().build_key.clone();
                build_key.image_from_rows(rows)
            };
            self.hash_put_key(&key, rec_start);
        }

        AppendResult {
            written: cp - init_pos,
            is_full,
        }
    }

    /// Byte range of the embedded key inside a record.
    pub(crate) fn embedded_key_at(&self, fields_pos: usize) -> &[u8] {
        let hash = self.hash.as_ref().expect("embedded key needs hash section");
        let start = fields_pos + self.layout.flag_fields_len();
        &self.buff[start..start + hash.key_length]
    }

    /// Rewinds the read cursor; `for_writing` also clears the record
    /// area, the auxiliary reservation and the blob-in-row flag.
    pub fn reset(&mut self, for_writing: bool) {
        self.pos = REC_BASE;
        self.curr_rec_link = 0;
        if for_writing {
            self.records = 0;
            self.end_pos = REC_BASE;
            self.last_rec_pos = REC_BASE;
            self.curr_rec_pos = REC_BASE;
            self.aux_buff_size = 0;
            self.blob_data_in_rec_buff = false;
            self.last_written_is_impossible = false;
            if self.hash.is_some() {
                HashIndex::cleanup_table(self);
            }
        }
        if let Some(hash) = &mut self.hash {
            hash.curr_key_entry = hash.hash_table_off;
        }
    }

    /// Advances the read cursor past the next record and returns its
    /// field-region offset, or `None` at the end of the buffer.
    pub fn next_read(&mut self) -> Result<Option<usize>, JoinError> {
        if self.pos >= self.end_pos {
            return Ok(None);
        }
        let (fields_pos, next_pos) = self.parse_record(self.pos)?;
        self.pos = next_pos;
        self.curr_rec_pos = fields_pos;
        Ok(Some(fields_pos))
    }

    /// Field-region offset and end offset of the record starting at
    /// `rec_start`.
    pub(crate) fn parse_record(
        &self,
        rec_start: usize,
    ) -> Result<(usize, usize), JoinError> {
        if rec_start >= self.end_pos {
            return Err(JoinError::InvalidRecordOffset {
                offset: rec_start,
                end: self.end_pos,
            });
        }
        let hashed_link = if self.hash.is_some() {
            self.size_of_rec_ofs
        } else {
            0
        };
        let fields_pos = rec_start + self.prefix_length();
        let next_pos = if self.with_length {
            let len_ptr = rec_start + hashed_link;
            let rec_len = read_offset(&self.buff, len_ptr, self.size_of_rec_len);
            len_ptr + self.size_of_rec_len + rec_len
        } else {
            fields_pos + self.walk_record(fields_pos, None)?
        };
        Ok((fields_pos, next_pos))
    }

    /// Walks the fields of a record. With `rows` present the values are
    /// copied back into the row images; otherwise the walk only measures.
    /// Returns the byte length of the field region including the
    /// trailing offset table.
    pub(crate) fn walk_record(
        &self,
        fields_pos: usize,
        mut rows: Option<&mut dyn RowsMut>,
    ) -> Result<usize, JoinError> {
        let mut cp = fields_pos;
        // Flag fields; remember where each table's null bits live.
        let mut null_bits_at: Vec<(usize, usize)> = Vec::new();
        for descr in &self.layout.descrs[..self.layout.flag_fields] {
            match descr.source {
                FieldSource::MatchFlag => {
                    cp += 1;
                }
                FieldSource::NullBits { table } => {
                    null_bits_at.push((table, cp));
                    if let Some(rows) = rows.as_mut() {
                        let row = rows.row_mut(table);
                        let n = row.null_bits().len();
                        let bits = self.buff[cp..cp + n].to_vec();
                        row.null_bits_mut().copy_from_slice(&bits);
                    }
                    cp += descr.length;
                }
                FieldSource::NullRow { table } => {
                    if let Some(rows) = rows.as_mut() {
                        rows.row_mut(table).null_row = self.buff[cp] != 0;
                    }
                    cp += 1;
                }
                FieldSource::Rowid { table } => {
                    if let Some(rows) = rows.as_mut() {
                        let rowid = u64::from_le_bytes(
                            self.buff[cp..cp + 8].try_into().unwrap(),
                        );
                        rows.set_rowid(table, rowid);
                    }
                    cp += 8;
                }
                FieldSource::Column { .. } => unreachable!(),
            }
        }

        let is_null = |table: usize, column: usize| -> bool {
            let schema_bit = match null_bits_at.iter().find(|(t, _)| *t == table) {
                Some((_, at)) => *at,
                None => return false,
            };
            // Resolve the column's bit through its home table layout.
            let bt = self
                .layout
                .tables
                .iter()
                .find(|bt| bt.table == table)
                .expect("table not in buffer");
            match bt.schema.slots[column].null_bit {
                Some(bit) => {
                    self.buff[schema_bit + bit / 8] & (1 << (bit % 8)) != 0
                }
                None => false,
            }
        };

        let last_record_in_rec_buff =
            self.blob_data_in_rec_buff && fields_pos == self.last_rec_pos;

        for descr in &self.layout.descrs[self.layout.flag_fields..] {
            let (table, column) = match descr.source {
                FieldSource::Column { table, column } => (table, column),
                _ => unreachable!(),
            };
            if is_null(table, column) {
                if let Some(rows) = rows.as_mut() {
                    let row = rows.row_mut(table);
                    if row.schema().slots[column].blob_idx.is_some() {
                        row.set_blob_payload(column, Vec::new());
                    }
                }
                continue;
            }
            match descr.kind {
                FieldKind::Fixed => {
                    if let Some(rows) = rows.as_mut() {
                        let src =
                            self.buff[cp..cp + descr.length].to_vec();
                        rows.row_mut(table)
                            .slot_bytes_mut(column)
                            .copy_from_slice(&src);
                    }
                    cp += descr.length;
                }
                FieldKind::VarStr1 | FieldKind::VarStr2 => {
                    let prefix = if descr.kind == FieldKind::VarStr1 { 1 } else { 2 };
                    let len = if prefix == 1 {
                        self.buff[cp] as usize
                    } else {
                        u16::from_le_bytes(
                            self.buff[cp..cp + 2].try_into().unwrap(),
                        ) as usize
                    };
                    if let Some(rows) = rows.as_mut() {
                        let src = self.buff[cp..cp + prefix + len].to_vec();
                        let slot = rows.row_mut(table).slot_bytes_mut(column);
                        slot[..prefix + len].copy_from_slice(&src);
                        slot[prefix + len..].fill(0);
                    }
                    cp += prefix + len;
                }
                FieldKind::StrippedString => {
                    let len = u16::from_le_bytes(
                        self.buff[cp..cp + 2].try_into().unwrap(),
                    ) as usize;
                    if let Some(rows) = rows.as_mut() {
                        let src = self.buff[cp + 2..cp + 2 + len].to_vec();
                        let slot = rows.row_mut(table).slot_bytes_mut(column);
                        slot[..len].copy_from_slice(&src);
                        slot[len..].fill(b' ');
                    }
                    cp += 2 + len;
                }
                FieldKind::Blob => {
                    let blob_len = u32::from_le_bytes(
                        self.buff[cp..cp + 4].try_into().unwrap(),
                    ) as usize;
                    if let Some(rows) = rows.as_mut() {
                        let src = self.buff[cp..cp + 4].to_vec();
                        rows.row_mut(table).slot_bytes_mut(column)[..4]
                            .copy_from_slice(&src);
                    }
                    cp += 4;
                    if last_record_in_rec_buff {
                        // Payload still lives in the driving row.
                    } else {
                        if let Some(rows) = rows.as_mut() {
                            let payload =
                                self.buff[cp..cp + blob_len].to_vec();
                            rows.row_mut(table)
                                .set_blob_payload(column, payload);
                        }
                        cp += blob_len;
                    }
                }
            }
        }

        if self.referenced_fields > 0 {
            cp += self.size_of_fld_ofs * self.referenced_fields;
        }
        Ok(cp - fields_pos)
    }

    /// Copies all fields of the record at `fields_pos` back into the
    /// row images. Chained back-references are the caller's concern.
    pub fn read_fields_at(
        &self,
        fields_pos: usize,
        rows: &mut dyn RowsMut,
    ) -> Result<(), JoinError> {
        self.walk_record(fields_pos, Some(rows))?;
        Ok(())
    }

    /// Back-reference of the record at `fields_pos` into the previous
    /// chained buffer.
    pub fn get_rec_ref(&self, fields_pos: usize) -> usize {
        read_offset(
            &self.buff,
            fields_pos - self.prev_rec_ofs_size,
            self.prev_rec_ofs_size,
        )
    }

    /// Match flag of the record at `fields_pos`, chasing the chain into
    /// earlier buffers when the flag lives there.
    pub fn match_flag_at(
        &self,
        prevs: &[JoinBuffer],
        fields_pos: usize,
    ) -> MatchFlag {
        if self.layout.with_match_flag {
            return MatchFlag::from_byte(self.buff[fields_pos]);
        }
        match self.prev {
            Some(prev) => {
                let ref_pos = self.get_rec_ref(fields_pos);
                prevs[prev].match_flag_at(&prevs[..prev], ref_pos)
            }
            None => MatchFlag::NotFound,
        }
    }

    /// Writes the match flag of the record at `fields_pos` in this
    /// buffer. Only meaningful when the buffer carries match flags.
    pub fn set_match_flag_at(&mut self, fields_pos: usize, flag: MatchFlag) {
        debug_assert!(self.layout.with_match_flag);
        self.buff[fields_pos] = flag as u8;
    }

    /// Reads one referenced field of the record at `fields_pos` into the
    /// row image. Returns `false` when the field is NULL in this record.
    pub fn read_referenced_field(
        &self,
        descr_idx: usize,
        fields_pos: usize,
        rows: &mut dyn RowsMut,
    ) -> Result<bool, JoinError> {
        let descr = &self.layout.descrs[descr_idx];
        let no = descr.referenced_field_no;
        debug_assert!(no > 0);
        let (fields_pos_rec, next_pos) = {
            // fields_pos is the field-region offset; recover the record
            // end through the stored length.
            let hashed_link = if self.hash.is_some() {
                self.size_of_rec_ofs
            } else {
                0
            };
            let rec_start = fields_pos - self.prefix_length();
            let len_ptr = rec_start + hashed_link;
            let rec_len = read_offset(&self.buff, len_ptr, self.size_of_rec_len);
            (fields_pos, len_ptr + self.size_of_rec_len + rec_len)
        };
        let offsets_start =
            next_pos - self.size_of_fld_ofs * self.referenced_fields;
        let offset = read_offset(
            &self.buff,
            offsets_start + self.size_of_fld_ofs * (no - 1),
            self.size_of_fld_ofs,
        );
        let (table, column) = match descr.source {
            FieldSource::Column { table, column } => (table, column),
            _ => unreachable!(),
        };
        if offset == 0 && self.layout.flag_fields > 0 {
            let row = rows.row_mut(table);
            row.set_null(column, true);
            return Ok(false);
        }
        let cp = fields_pos_rec + offset;
        let row = rows.row_mut(table);
        row.set_null(column, false);
        match descr.kind {
            FieldKind::Fixed => {
                let src = self.buff[cp..cp + descr.length].to_vec();
                row.slot_bytes_mut(column).copy_from_slice(&src);
            }
            FieldKind::VarStr1 | FieldKind::VarStr2 => {
                let prefix = if descr.kind == FieldKind::VarStr1 { 1 } else { 2 };
                let len = if prefix == 1 {
                    self.buff[cp] as usize
                } else {
                    u16::from_le_bytes(self.buff[cp..cp + 2].try_into().unwrap())
                        as usize
                };
                let src = self.buff[cp..cp + prefix + len].to_vec();
                let slot = row.slot_bytes_mut(column);
                slot[..prefix + len].copy_from_slice(&src);
                slot[prefix + len..].fill(0);
            }
            FieldKind::StrippedString => {
                let len =
                    u16::from_le_bytes(self.buff[cp..cp + 2].try_into().unwrap())
                        as usize;
                let src = self.buff[cp + 2..cp + 2 + len].to_vec();
                let slot = row.slot_bytes_mut(column);
                slot[..len].copy_from_slice(&src);
                slot[len..].fill(b' ');
            }
            FieldKind::Blob => {
                let blob_len =
                    u32::from_le_bytes(self.buff[cp..cp + 4].try_into().unwrap())
                        as usize;
                let src = self.buff[cp..cp + 4].to_vec();
                row.slot_bytes_mut(column)[..4].copy_from_slice(&src);
                let in_rec_buff = self.blob_data_in_rec_buff
                    && fields_pos == self.last_rec_pos;
                if !in_rec_buff {
                    let payload = self.buff[cp + 4..cp + 4 + blob_len].to_vec();
                    row.set_blob_payload(column, payload);
                }
            }
        }
        Ok(true)
    }

    /// Skips the record under the read cursor when its match flag is
    /// `Found`. Used while generating null complements for first-inner
    /// tables.
    pub fn skip_if_matched(&mut self, prevs: &[JoinBuffer]) -> Result<bool, JoinError> {
        if self.pos >= self.end_pos {
            return Ok(false);
        }
        let (fields_pos, next_pos) = self.parse_record(self.pos)?;
        if self.match_flag_at(prevs, fields_pos) == MatchFlag::Found {
            self.pos = next_pos;
            return Ok(true);
        }
        Ok(false)
    }

    /// Skips the record under the read cursor when its flag says no
    /// match is needed: `Found` under first-match semantics, or the
    /// terminal `Impossible`.
    pub fn skip_if_not_needed_match(
        &mut self,
        prevs: &[JoinBuffer],
        only_first_match: bool,
    ) -> Result<bool, JoinError> {
        if self.pos >= self.end_pos {
            return Ok(false);
        }
        let (fields_pos, next_pos) = self.parse_record(self.pos)?;
        let flag = self.match_flag_at(prevs, fields_pos);
        if flag == MatchFlag::Impossible
            || (flag == MatchFlag::Found && only_first_match)
        {
            self.pos = next_pos;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record link used by the next chained buffer: the record made
    /// current during matching, or the last written one.
    pub fn get_curr_rec_link(&self) -> usize {
        if self.curr_rec_link != 0 {
            self.curr_rec_link
        } else {
            self.curr_rec_pos
        }
    }

    pub fn set_curr_rec_link(&mut self, fields_pos: usize) {
        self.curr_rec_link = fields_pos;
    }

    pub fn curr_rec_pos(&self) -> usize {
        self.curr_rec_pos
    }
}

/// Reads the record at `fields_pos` of `caches[idx]` and, recursively,
/// every record it references in earlier chained buffers.
pub fn read_record_chain(
    caches: &[JoinBuffer],
    idx: usize,
    fields_pos: usize,
    rows: &mut dyn RowsMut,
) -> Result<(), JoinError> {
    let cache = &caches[idx];
    cache.read_fields_at(fields_pos, rows)?;
    if let Some(prev) = cache.prev {
        let ref_pos = cache.get_rec_ref(fields_pos);
        read_record_chain(&caches[..idx], prev, ref_pos, rows)?;
    }
    Ok(())
}
