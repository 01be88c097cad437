//! Ordered traversal of a single index table.
//!
//! Grounded on the teacher crate's `storage::index::btree::BTree` range
//! scan (`range_scan_page`/`full_scan`), generalised from fixed-width keys
//! to the `(value ∥ segment)` rows of [`crate::index_table::IndexTable`].
//! The `Location` marker is carried over from the original
//! implementation's cursor tests (`current_segment`,
//! `current_position_in_segment`), which this module's internal state
//! mirrors directly rather than reinventing a fresh position
//! representation.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::index_table::{IndexTable, make_key, split_key};
use crate::segment::Segment;

/// Where a cursor currently sits, independent of the live data — a value
/// obtained from [`Cursor::location`] can be handed to a different
/// `Cursor` over the same field (or the same cursor after it has moved
/// on) to reposition it via [`Cursor::restore`], without touching the
/// underlying recordset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub value: Option<Vec<u8>>,
    pub current_segment: Option<u32>,
    pub current_position_in_segment: Option<u32>,
}

impl Location {
    pub fn clear(&mut self) {
        self.value = None;
        self.current_segment = None;
        self.current_position_in_segment = None;
    }
}

/// A stateful cursor over one field's index rows, optionally restricted to
/// values starting with a `partial` prefix.
pub struct Cursor<'a> {
    index: &'a IndexTable,
    cfg: DatabaseConfig,
    partial: Option<Vec<u8>>,
    underlying: Box<dyn crate::backend::Cursor>,
    current_value: Option<Vec<u8>>,
    current_segment: Option<Segment>,
    /// The last position boundary within the current segment: either the
    /// raw local offset of the member the cursor sits on, or (after a
    /// `setat` miss) the offset that was requested, used as the boundary
    /// for the next `next`/`prev` step.
    current_offset: Option<u32>,
}

impl<'a> Cursor<'a> {
    pub fn new(index: &'a IndexTable, cfg: DatabaseConfig, partial: Option<Vec<u8>>) -> Self {
        Cursor {
            index,
            cfg,
            partial,
            underlying: index.raw_cursor(),
            current_value: None,
            current_segment: None,
            current_offset: None,
        }
    }

    fn matches_partial(&self, value: &[u8]) -> bool {
        match &self.partial {
            Some(p) => value.starts_with(p.as_slice()),
            None => true,
        }
    }

    fn decode_row(&self, key: &[u8], bytes: &[u8]) -> Result<Option<(Vec<u8>, u32, Segment)>> {
        let Some((value, segment_number)) = split_key(key) else {
            return Ok(None);
        };
        if !self.matches_partial(value) {
            return Ok(None);
        }
        let segment = self.index.decode_row(bytes, segment_number)?;
        Ok(Some((value.to_vec(), segment_number, segment)))
    }

    fn absolute(&self) -> Option<(Vec<u8>, u64)> {
        let value = self.current_value.clone()?;
        let segment = self.current_segment.as_ref()?;
        let offset = self.current_offset?;
        Some((value, self.cfg.absolute(segment.segment_number(), offset)))
    }

    fn clear_position(&mut self) {
        self.current_value = None;
        self.current_segment = None;
        self.current_offset = None;
    }

    /// Position at the first row (respecting `partial`); `None` if the
    /// scan is empty.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let row = match &self.partial {
            Some(p) => self.underlying.seek(&make_key(p, 0))?,
            None => self.underlying.first()?,
        };
        self.settle(row, true)
    }

    /// Position at the last row (respecting `partial`); `None` if the
    /// scan is empty.
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let row = match &self.partial {
            Some(p) => {
                let mut upper = p.clone();
                upper.extend_from_slice(&u32::MAX.to_be_bytes());
                match self.underlying.seek(&upper)? {
                    Some((k, v)) if k == upper => Some((k, v)),
                    Some(_) => self.underlying.prev()?,
                    None => self.underlying.last()?,
                }
            }
            None => self.underlying.last()?,
        };
        self.settle(row, false)
    }

    fn settle(&mut self, row: Option<(Vec<u8>, Vec<u8>)>, from_start: bool) -> Result<Option<(Vec<u8>, u64)>> {
        let Some((key, bytes)) = row else {
            self.clear_position();
            return Ok(None);
        };
        match self.decode_row(&key, &bytes)? {
            Some((value, _segment_number, segment)) => {
                self.current_offset = if from_start { segment.first() } else { segment.last() };
                self.current_value = Some(value);
                self.current_segment = Some(segment);
                Ok(self.absolute())
            }
            None => {
                self.clear_position();
                Ok(None)
            }
        }
    }

    /// Advance to the next `(value, record)` pair, or `None` if exhausted.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        if let (Some(segment), Some(offset)) = (&self.current_segment, self.current_offset) {
            if let Some(next_offset) = segment.next_after(offset) {
                self.current_offset = Some(next_offset);
                return Ok(self.absolute());
            }
        }
        let row = self.underlying.next()?;
        self.settle(row, true)
    }

    /// Retreat to the previous `(value, record)` pair, or `None` if
    /// exhausted.
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        if let (Some(segment), Some(offset)) = (&self.current_segment, self.current_offset) {
            if let Some(prev_offset) = segment.prev_before(offset) {
                self.current_offset = Some(prev_offset);
                return Ok(self.absolute());
            }
        }
        let row = self.underlying.prev()?;
        self.settle(row, false)
    }

    /// Position at the first row with value ≥ `value` (respecting
    /// `partial`).
    pub fn nearest(&mut self, value: &[u8]) -> Result<Option<(Vec<u8>, u64)>> {
        let row = self.underlying.seek(&make_key(value, 0))?;
        self.settle(row, true)
    }

    /// Position exactly at `(value, record)`. Returns `None` if the
    /// record is not a member of that value's segment, but leaves the
    /// cursor positioned so the next `next`/`prev` call continues in
    /// order from where `record` would have sorted.
    pub fn setat(&mut self, value: &[u8], record: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let key = make_key(value, segment_number);
        let row = self.underlying.seek_exact(&key)?;
        let Some((_, bytes)) = row else {
            self.clear_position();
            return Ok(None);
        };
        let segment = self.index.decode_row(&bytes, segment_number)?;
        self.current_value = Some(value.to_vec());
        let contains = segment.contains(offset);
        self.current_offset = Some(offset);
        self.current_segment = Some(segment);
        if contains { Ok(self.absolute()) } else { Ok(None) }
    }

    /// Sum of `count` over every row the cursor's scope covers.
    pub fn count_records(&self) -> Result<u64> {
        let mut total = 0u64;
        for row in self.index.iter_field(self.partial.as_deref(), None, true)? {
            let row = row?;
            if !self.matches_partial(&row.value) {
                break;
            }
            total += row.segment.count() as u64;
        }
        Ok(total)
    }

    /// The 0-based ordinal of `(value, record)` within this cursor's
    /// sequence, or `None` if it is not present.
    pub fn position_of(&self, value: &[u8], record: u64) -> Result<Option<u64>> {
        let mut scan = Cursor::new(self.index, self.cfg, self.partial.clone());
        let mut position = 0u64;
        let mut row = scan.first()?;
        while let Some((v, r)) = row {
            if v == value && r == record {
                return Ok(Some(position));
            }
            position += 1;
            row = scan.next()?;
        }
        Ok(None)
    }

    /// The `(value, record)` at ordinal `position`; negative values count
    /// from the end (`-1` is the last entry).
    pub fn record_at_position(&self, position: i64) -> Result<Option<(Vec<u8>, u64)>> {
        let mut scan = Cursor::new(self.index, self.cfg, self.partial.clone());
        if position >= 0 {
            let mut row = scan.first()?;
            let mut i = 0i64;
            while let Some(entry) = row {
                if i == position {
                    return Ok(Some(entry));
                }
                i += 1;
                row = scan.next()?;
            }
        } else {
            let mut row = scan.last()?;
            let mut i = -1i64;
            while let Some(entry) = row {
                if i == position {
                    return Ok(Some(entry));
                }
                i -= 1;
                row = scan.prev()?;
            }
        }
        Ok(None)
    }

    /// A snapshot of the cursor's current position.
    pub fn location(&self) -> Location {
        Location {
            value: self.current_value.clone(),
            current_segment: self.current_segment.as_ref().map(|s| s.segment_number()),
            current_position_in_segment: self.current_offset,
        }
    }

    /// Reposition the cursor at a [`Location`] previously captured by
    /// [`Cursor::location`], re-reading the underlying row rather than
    /// trusting it to still describe the segment's current contents.
    /// Returns `None` (clearing the cursor's position) if the location is
    /// empty, its row is gone, or the member it pointed at is no longer in
    /// the segment — mirroring [`Cursor::setat`]'s miss behaviour.
    pub fn restore(&mut self, location: &Location) -> Result<Option<(Vec<u8>, u64)>> {
        let (Some(value), Some(segment_number), Some(offset)) =
            (&location.value, location.current_segment, location.current_position_in_segment)
        else {
            self.clear_position();
            return Ok(None);
        };
        let key = make_key(value, segment_number);
        let row = self.underlying.seek_exact(&key)?;
        let Some((_, bytes)) = row else {
            self.clear_position();
            return Ok(None);
        };
        let segment = self.index.decode_row(&bytes, segment_number)?;
        self.current_value = Some(value.clone());
        let contains = segment.contains(offset);
        self.current_offset = Some(offset);
        self.current_segment = Some(segment);
        if contains { Ok(self.absolute()) } else { Ok(None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, memory::MemoryBackend};
    use crate::index_table::IndexTable;
    use crate::segment_table::SegmentTable;

    fn cfg() -> DatabaseConfig {
        DatabaseConfig::new(16).with_threshold(6)
    }

    fn index_with(postings: &[(&[u8], u64)]) -> IndexTable {
        let mut backend = MemoryBackend::new();
        let rows = backend.open_table("rows").unwrap();
        let lt = backend.open_table("list").unwrap();
        let bt = backend.open_table("bits").unwrap();
        let mut idx = IndexTable::open(rows, SegmentTable::open(lt, bt).unwrap(), cfg());
        for (value, record) in postings {
            idx.add_posting(value, *record).unwrap();
        }
        idx
    }

    #[test]
    fn first_and_next_walk_all_rows_in_order() {
        let idx = index_with(&[(b"blue", 1), (b"green", 2), (b"red", 3)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let mut seen = Vec::new();
        let mut row = cursor.first().unwrap();
        while let Some((v, r)) = row {
            seen.push((v, r));
            row = cursor.next().unwrap();
        }
        assert_eq!(seen, vec![(b"blue".to_vec(), 1), (b"green".to_vec(), 2), (b"red".to_vec(), 3)]);
    }

    #[test]
    fn last_and_prev_walk_all_rows_in_reverse() {
        let idx = index_with(&[(b"blue", 1), (b"green", 2), (b"red", 3)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let mut seen = Vec::new();
        let mut row = cursor.last().unwrap();
        while let Some((v, r)) = row {
            seen.push((v, r));
            row = cursor.prev().unwrap();
        }
        assert_eq!(seen, vec![(b"red".to_vec(), 3), (b"green".to_vec(), 2), (b"blue".to_vec(), 1)]);
    }

    #[test]
    fn next_crosses_segment_boundaries_within_a_value() {
        let idx = index_with(&[(b"red", 1), (b"red", 20), (b"red", 40)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let mut records = Vec::new();
        let mut row = cursor.first().unwrap();
        while let Some((_, r)) = row {
            records.push(r);
            row = cursor.next().unwrap();
        }
        assert_eq!(records, vec![1, 20, 40]);
    }

    #[test]
    fn partial_restricts_iteration_to_matching_prefix() {
        let idx = index_with(&[(b"apple", 1), (b"apricot", 2), (b"banana", 3)]);
        let mut cursor = Cursor::new(&idx, cfg(), Some(b"ap".to_vec()));
        let mut seen = Vec::new();
        let mut row = cursor.first().unwrap();
        while let Some((v, _)) = row {
            seen.push(v);
            row = cursor.next().unwrap();
        }
        assert_eq!(seen, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }

    #[test]
    fn setat_hit_positions_exactly() {
        let idx = index_with(&[(b"red", 1), (b"red", 2)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let found = cursor.setat(b"red", 2).unwrap();
        assert_eq!(found, Some((b"red".to_vec(), 2)));
    }

    #[test]
    fn setat_miss_returns_none_but_next_continues_in_order() {
        let idx = index_with(&[(b"red", 1), (b"red", 2), (b"red", 5)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let found = cursor.setat(b"red", 3).unwrap();
        assert_eq!(found, None);
        let next = cursor.next().unwrap();
        assert_eq!(next, Some((b"red".to_vec(), 5)));
    }

    #[test]
    fn nearest_finds_first_value_at_or_above() {
        let idx = index_with(&[(b"apple", 1), (b"cherry", 2)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        let found = cursor.nearest(b"banana").unwrap();
        assert_eq!(found, Some((b"cherry".to_vec(), 2)));
    }

    #[test]
    fn count_records_sums_across_segments() {
        let idx = index_with(&[(b"red", 1), (b"red", 20), (b"blue", 2)]);
        let cursor = Cursor::new(&idx, cfg(), Some(b"red".to_vec()));
        assert_eq!(cursor.count_records().unwrap(), 2);
    }

    #[test]
    fn position_of_and_record_at_position_are_inverse() {
        let idx = index_with(&[(b"blue", 1), (b"green", 2), (b"red", 3)]);
        let cursor = Cursor::new(&idx, cfg(), None);
        let position = cursor.position_of(b"green", 2).unwrap().unwrap();
        assert_eq!(position, 1);
        let entry = cursor.record_at_position(position as i64).unwrap().unwrap();
        assert_eq!(entry, (b"green".to_vec(), 2));
    }

    #[test]
    fn location_saves_and_restores_a_position_after_the_cursor_moves_on() {
        let idx = index_with(&[(b"blue", 1), (b"green", 2), (b"red", 3)]);
        let mut cursor = Cursor::new(&idx, cfg(), None);
        cursor.first().unwrap();
        let at_green = cursor.next().unwrap();
        assert_eq!(at_green, Some((b"green".to_vec(), 2)));
        let saved = cursor.location();

        // Move the cursor elsewhere entirely.
        cursor.last().unwrap();
        assert_eq!(cursor.current_value, Some(b"red".to_vec()));

        let restored = cursor.restore(&saved).unwrap();
        assert_eq!(restored, Some((b"green".to_vec(), 2)));
        // And the restored cursor resumes traversal from that point.
        let after = cursor.next().unwrap();
        assert_eq!(after, Some((b"red".to_vec(), 3)));
    }

    #[test]
    fn record_at_negative_position_counts_from_the_end() {
        let idx = index_with(&[(b"blue", 1), (b"green", 2), (b"red", 3)]);
        let cursor = Cursor::new(&idx, cfg(), None);
        let entry = cursor.record_at_position(-1).unwrap().unwrap();
        assert_eq!(entry, (b"red".to_vec(), 3));
    }
}
