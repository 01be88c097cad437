//! Per-(file, field) index tables: ordered rows keyed `(value ∥
//! segment)` carrying a posting-list reference, plus the iteration
//! primitives the cursor and recordset layers build on.
//!
//! Grounded on the teacher crate's `storage::index::btree::BTree` — the
//! row format and page-lifecycle bookkeeping here play the role its
//! `insert_into_page`/`split_page` play for a B-tree leaf, simplified
//! because a segment's size is capped by construction (the codec itself
//! promotes/demotes) rather than needing page splits.
//!
//! Key encoding is the literal `value ∥ segment` concatenation; callers are
//! expected to supply value encodings (fixed-width or length-prefixed)
//! under which no value is a byte-prefix of another, as the original
//! DPT-derived design assumes (see DESIGN.md).

use bincode::{Decode, Encode};

use crate::backend::{Cursor, KvTable};
use crate::config::DatabaseConfig;
use crate::error::{Context, Error, Result};
use crate::segment::{Form, Segment};
use crate::segment_table::SegmentTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum RowReference {
    Int(u32),
    List(u64),
    Bits(u64),
}

#[derive(Debug, Clone, Encode, Decode)]
struct RowPayload {
    count: u32,
    reference: RowReference,
}

pub(crate) fn make_key(value: &[u8], segment_number: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 4);
    key.extend_from_slice(value);
    key.extend_from_slice(&segment_number.to_be_bytes());
    key
}

pub(crate) fn split_key(key: &[u8]) -> Option<(&[u8], u32)> {
    if key.len() < 4 {
        return None;
    }
    let (value, seg_bytes) = key.split_at(key.len() - 4);
    let segment_number = u32::from_be_bytes(seg_bytes.try_into().ok()?);
    Some((value, segment_number))
}

fn decode_payload(bytes: &[u8]) -> Result<RowPayload> {
    let (payload, _): (RowPayload, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| Error::backend(format!("corrupt index row: {e}"), Context::new()))?;
    Ok(payload)
}

fn encode_payload(payload: &RowPayload) -> Result<Vec<u8>> {
    bincode::encode_to_vec(payload, bincode::config::standard()).map_err(|e| Error::backend(e.to_string(), Context::new()))
}

/// A decoded index row: the value it carries and its segment-local
/// posting list. `segment.count()` and `segment.form()` stand in for the
/// row's on-disk separate `count`/`reference` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub value: Vec<u8>,
    pub segment: Segment,
}

/// One field's posting-list store: an ordered row table plus the segment
/// table backing its out-of-line `List`/`Bits` pages.
pub struct IndexTable {
    rows: Box<dyn KvTable>,
    segments: SegmentTable,
    cfg: DatabaseConfig,
}

impl IndexTable {
    pub fn open(rows: Box<dyn KvTable>, segments: SegmentTable, cfg: DatabaseConfig) -> Self {
        IndexTable { rows, segments, cfg }
    }

    /// A fresh cursor over this table's raw rows, for the cursor module's
    /// use; `decode_segment` below lets it turn a raw row into a
    /// `Segment` without knowing the row encoding.
    pub(crate) fn raw_cursor(&self) -> Box<dyn Cursor> {
        self.rows.cursor()
    }

    pub(crate) fn decode_row(&self, bytes: &[u8], segment_number: u32) -> Result<Segment> {
        self.decode_segment(segment_number, &decode_payload(bytes)?)
    }

    fn decode_segment(&self, segment_number: u32, payload: &RowPayload) -> Result<Segment> {
        match payload.reference {
            RowReference::Int(offset) => Ok(Segment::single(segment_number, offset)),
            RowReference::List(page_id) => {
                let bytes = self.segments.get(Form::List, page_id)?;
                Segment::decode(Form::List, &bytes, segment_number, &self.cfg)
            }
            RowReference::Bits(page_id) => {
                let bytes = self.segments.get(Form::Bits, page_id)?;
                Segment::decode(Form::Bits, &bytes, segment_number, &self.cfg)
            }
        }
    }

    fn free_page(&mut self, reference: Option<RowReference>) -> Result<()> {
        match reference {
            Some(RowReference::List(page_id)) => self.segments.free(Form::List, page_id),
            Some(RowReference::Bits(page_id)) => self.segments.free(Form::Bits, page_id),
            _ => Ok(()),
        }
    }

    fn write_segment(&mut self, value: &[u8], segment: &Segment, previous: Option<RowPayload>) -> Result<()> {
        let key = make_key(value, segment.segment_number());
        let old_reference = previous.as_ref().map(|p| p.reference);
        let reference = match segment.form() {
            Form::Int => {
                self.free_page(old_reference)?;
                let offset = segment.first().expect("Int segment always has one member");
                RowReference::Int(offset)
            }
            form @ (Form::List | Form::Bits) => {
                let bytes = segment.encode_page().expect("List/Bits segments always have a page payload");
                match old_reference {
                    Some(RowReference::List(page_id)) if form == Form::List => {
                        self.segments.put(Form::List, page_id, &bytes)?;
                        RowReference::List(page_id)
                    }
                    Some(RowReference::Bits(page_id)) if form == Form::Bits => {
                        self.segments.put(Form::Bits, page_id, &bytes)?;
                        RowReference::Bits(page_id)
                    }
                    _ => {
                        self.free_page(old_reference)?;
                        let page_id = self.segments.alloc(form, &bytes)?;
                        match form {
                            Form::List => RowReference::List(page_id),
                            Form::Bits => RowReference::Bits(page_id),
                            Form::Int => unreachable!(),
                        }
                    }
                }
            }
        };
        let payload = RowPayload { count: segment.count(), reference };
        self.rows.put(&key, &encode_payload(&payload)?)
    }

    /// Add `record` to the posting list for `value`. Idempotent.
    pub fn add_posting(&mut self, value: &[u8], record: u64) -> Result<()> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let key = make_key(value, segment_number);
        let existing = self.rows.get(&key)?;
        let previous = match &existing {
            Some(bytes) => Some(decode_payload(bytes)?),
            None => {
                self.write_segment(value, &Segment::single(segment_number, offset), None)?;
                return Ok(());
            }
        };
        let mut segment =
            self.decode_segment(segment_number, previous.as_ref().expect("existing row was just matched above"))?;
        let old_form = segment.form();
        segment.insert(offset, &self.cfg);
        if segment.form() != old_form {
            tracing::debug!(segment = segment_number, from = ?old_form, to = ?segment.form(), "posting list promoted");
        }
        self.write_segment(value, &segment, previous)
    }

    /// Remove `record` from the posting list for `value`. Idempotent; a
    /// no-op if the row or member is absent.
    pub fn remove_posting(&mut self, value: &[u8], record: u64) -> Result<()> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let key = make_key(value, segment_number);
        let Some(bytes) = self.rows.get(&key)? else {
            return Ok(());
        };
        let previous = decode_payload(&bytes)?;
        let mut segment = self.decode_segment(segment_number, &previous)?;
        let old_form = segment.form();
        segment.remove(offset, &self.cfg);
        if segment.count() == 0 {
            tracing::debug!(segment = segment_number, "posting list emptied, dropping row");
            self.free_page(Some(previous.reference))?;
            self.rows.delete(&key)
        } else {
            if segment.form() != old_form {
                tracing::debug!(segment = segment_number, from = ?old_form, to = ?segment.form(), "posting list demoted");
            }
            self.write_segment(value, &segment, Some(previous))
        }
    }

    pub fn lookup_segment(&self, value: &[u8], segment_number: u32) -> Result<Option<Segment>> {
        let key = make_key(value, segment_number);
        match self.rows.get(&key)? {
            Some(bytes) => Ok(Some(self.decode_segment(segment_number, &decode_payload(&bytes)?)?)),
            None => Ok(None),
        }
    }

    /// Bulk-install `segment` for `value`, unioning it with whatever row
    /// already occupies that `(value, segment_number)` slot. Used by the
    /// deferred loader's merge pass, where one staged generation's postings
    /// must be combined with postings the live index already holds rather
    /// than overwriting them.
    pub fn merge_segment(&mut self, value: &[u8], segment: Segment) -> Result<()> {
        let segment_number = segment.segment_number();
        let key = make_key(value, segment_number);
        match self.rows.get(&key)? {
            Some(bytes) => {
                let previous = decode_payload(&bytes)?;
                let existing = self.decode_segment(segment_number, &previous)?;
                let merged = existing.union(&segment, &self.cfg)?;
                self.write_segment(value, &merged, Some(previous))
            }
            None => self.write_segment(value, &segment, None),
        }
    }

    /// Remove every row from this table, freeing any out-of-line pages, and
    /// return each `(value, segment)` pair that was stored. Used by the
    /// deferred loader to empty a staging table once its contents have been
    /// folded into the live index.
    pub fn drain(&mut self) -> Result<Vec<(Vec<u8>, Segment)>> {
        let mut out = Vec::new();
        let mut cursor = self.rows.cursor();
        let mut row = cursor.first()?;
        while let Some((key, bytes)) = row {
            if let Some((value, segment_number)) = split_key(&key) {
                let payload = decode_payload(&bytes)?;
                let segment = self.decode_segment(segment_number, &payload)?;
                self.free_page(Some(payload.reference))?;
                self.rows.delete(&key)?;
                out.push((value.to_vec(), segment));
            }
            row = cursor.next()?;
        }
        Ok(out)
    }

    /// All segments carrying `value`, in ascending segment order.
    pub fn iter_field_value(&self, value: &[u8]) -> Result<ValueSegments<'_>> {
        let mut cursor = self.rows.cursor();
        let start = make_key(value, 0);
        let pending = cursor.seek(&start)?;
        Ok(ValueSegments { table: self, cursor, value: value.to_vec(), pending })
    }

    /// All rows across all values, bounded by an optional `[from_value,
    /// to_value]` range, walked in the requested direction.
    pub fn iter_field(&self, from_value: Option<&[u8]>, to_value: Option<&[u8]>, ascending: bool) -> Result<RowIterator<'_>> {
        let mut cursor = self.rows.cursor();
        let pending = if ascending {
            match from_value {
                Some(v) => cursor.seek(&make_key(v, 0))?,
                None => cursor.first()?,
            }
        } else {
            match to_value {
                Some(v) => {
                    let mut upper = v.to_vec();
                    upper.extend_from_slice(&u32::MAX.to_be_bytes());
                    match cursor.seek(&upper)? {
                        Some((k, val)) if k == upper => Some((k, val)),
                        Some(_) => cursor.prev()?,
                        None => cursor.last()?,
                    }
                }
                None => cursor.last()?,
            }
        };
        Ok(RowIterator {
            table: self,
            cursor,
            from_value: from_value.map(|v| v.to_vec()),
            to_value: to_value.map(|v| v.to_vec()),
            ascending,
            pending,
        })
    }
}

/// Lazily decoded segments for a single field value, in ascending segment
/// order.
pub struct ValueSegments<'a> {
    table: &'a IndexTable,
    cursor: Box<dyn Cursor>,
    value: Vec<u8>,
    pending: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a> Iterator for ValueSegments<'a> {
    type Item = Result<(u32, Segment)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, val) = self.pending.take()?;
        if key.len() != self.value.len() + 4 || key[..self.value.len()] != self.value[..] {
            return None;
        }
        let segment_number = match split_key(&key) {
            Some((_, s)) => s,
            None => return Some(Err(Error::backend("malformed index row key", Context::new()))),
        };
        self.pending = match self.cursor.next() {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        let payload = match decode_payload(&val) {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        Some(self.table.decode_segment(segment_number, &payload).map(|seg| (segment_number, seg)))
    }
}

/// Lazily decoded rows across a field's whole value range.
pub struct RowIterator<'a> {
    table: &'a IndexTable,
    cursor: Box<dyn Cursor>,
    from_value: Option<Vec<u8>>,
    to_value: Option<Vec<u8>>,
    ascending: bool,
    pending: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a> Iterator for RowIterator<'a> {
    type Item = Result<IndexRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, val) = self.pending.take()?;
        let (value, segment_number) = match split_key(&key) {
            Some(vs) => vs,
            None => return Some(Err(Error::backend("malformed index row key", Context::new()))),
        };
        if let Some(to) = &self.to_value {
            if self.ascending && value > to.as_slice() {
                return None;
            }
        }
        if let Some(from) = &self.from_value {
            if !self.ascending && value < from.as_slice() {
                return None;
            }
        }
        let value = value.to_vec();
        let step = if self.ascending { self.cursor.next() } else { self.cursor.prev() };
        self.pending = match step {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        let payload = match decode_payload(&val) {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        Some(self.table.decode_segment(segment_number, &payload).map(|segment| IndexRow { value, segment }))
    }
}
