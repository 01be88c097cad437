//! The existence bitmap: the set of live record numbers for one
//! file.
//!
//! Grounded on the teacher crate's `storage::base::SegmentHeader`
//! free-bitmap (`block_free_bitmap`, `mark_block_used`, `mark_block_free`)
//! generalised from a single block to an unbounded, segment-sparse run of
//! bitmaps, one per `DatabaseConfig::segment_size` records. The freed-hint
//! plus freed-segment-stack reuse strategy is carried over from the
//! original implementation's record-number allocator (see DESIGN.md).

use std::collections::HashMap;

use bincode::{Decode, Encode};

use crate::backend::{KvTable, encode_key_u32};
use crate::config::DatabaseConfig;
use crate::control;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
struct EbmControl {
    high_water: u64,
    hint: u64,
    count: u64,
    /// Segment numbers that are currently entirely free and below the
    /// highest segment in use. Top of stack is the next whole segment a
    /// fresh run of `set` calls should fill.
    freed_segments: Vec<u32>,
}

/// The existence bitmap for one file: which record numbers are currently
/// live, plus the bookkeeping needed to hand out reused numbers before
/// extending the high-water mark.
pub struct ExistenceBitmap {
    table: Box<dyn KvTable>,
    cfg: DatabaseConfig,
    control: EbmControl,
    /// Per-segment bitmap cache. Written through to `table` on every
    /// mutation, so this never needs an explicit flush.
    segments: HashMap<u32, Vec<u8>>,
}

impl ExistenceBitmap {
    pub fn open(table: Box<dyn KvTable>, cfg: DatabaseConfig) -> Result<Self> {
        let control = control::load::<EbmControl>(table.as_ref())?.unwrap_or_default();
        Ok(ExistenceBitmap { table, cfg, control, segments: HashMap::new() })
    }

    pub fn high_water(&self) -> u64 {
        self.control.high_water
    }

    pub fn count(&self) -> u64 {
        self.control.count
    }

    fn load_segment(&mut self, segment_number: u32) -> Result<&mut Vec<u8>> {
        if !self.segments.contains_key(&segment_number) {
            let bytes = self
                .table
                .get(&encode_key_u32(segment_number))?
                .unwrap_or_else(|| vec![0u8; self.cfg.bitmap_bytes()]);
            self.segments.insert(segment_number, bytes);
        }
        Ok(self.segments.get_mut(&segment_number).expect("just inserted"))
    }

    fn store_segment(&mut self, segment_number: u32) -> Result<()> {
        let bytes = self.segments.get(&segment_number).expect("segment loaded").clone();
        self.table.put(&encode_key_u32(segment_number), &bytes)
    }

    fn persist_control(&mut self) -> Result<()> {
        let control = self.control.clone();
        control::save(self.table.as_mut(), &control)
    }

    pub fn contains(&mut self, record: u64) -> Result<bool> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let bitmap = self.load_segment(segment_number)?;
        Ok(bit_get(bitmap, offset))
    }

    /// Mark `record` live. Idempotent. Returns `(segment, offset)`.
    pub fn set(&mut self, record: u64) -> Result<(u32, u32)> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let bitmap = self.load_segment(segment_number)?;
        let was_set = bit_get(bitmap, offset);
        if !was_set {
            bit_set(bitmap, offset);
            self.store_segment(segment_number)?;
            self.control.count += 1;
            // The segment is no longer entirely free, wherever it sits in
            // the stack (first_free always hands out the top, but this
            // keeps the invariant intact even for direct `set` calls).
            self.control.freed_segments.retain(|&s| s != segment_number);
        }
        if record + 1 > self.control.high_water {
            self.control.high_water = record + 1;
        }
        self.persist_control()?;
        Ok((segment_number, offset))
    }

    /// Clear `record`. Idempotent. Returns `(segment, offset)`. If the
    /// record's segment becomes entirely empty and is not the highest
    /// segment currently in use, its number is pushed onto the
    /// freed-segment stack.
    pub fn clear(&mut self, record: u64) -> Result<(u32, u32)> {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let highest_segment = self.cfg.segment_of(self.control.high_water.saturating_sub(1));
        let bitmap = self.load_segment(segment_number)?;
        let was_set = bit_get(bitmap, offset);
        if was_set {
            bit_clear(bitmap, offset);
            let now_empty = bitmap.iter().all(|&b| b == 0);
            self.store_segment(segment_number)?;
            self.control.count -= 1;
            if now_empty
                && segment_number < highest_segment
                && !self.control.freed_segments.contains(&segment_number)
            {
                self.control.freed_segments.push(segment_number);
            }
        }
        if record < self.control.hint {
            self.control.hint = record;
        }
        self.persist_control()?;
        Ok((segment_number, offset))
    }

    /// The lowest record number available for reuse, or `None` if every
    /// record below the high-water mark is live (the caller should append
    /// a fresh record at `high_water()` instead).
    pub fn first_free(&mut self) -> Result<Option<u64>> {
        loop {
            if self.control.hint >= self.control.high_water {
                return Ok(None);
            }
            if !self.contains(self.control.hint)? {
                return Ok(Some(self.control.hint));
            }
            // Hint was stale; advance it by scanning forward within the
            // current segment, then re-check against the next segment.
            let segment_number = self.cfg.segment_of(self.control.hint);
            let bitmap = self.load_segment(segment_number)?.clone();
            let start_offset = self.cfg.offset_in_segment(self.control.hint);
            match first_clear_bit(&bitmap, start_offset) {
                Some(offset) => {
                    self.control.hint = self.cfg.absolute(segment_number, offset);
                }
                None => {
                    // The hinted segment is exhausted. Jump straight to the
                    // lowest freed segment ahead of it, if one is on the
                    // stack, instead of walking every fully-occupied
                    // segment in between.
                    let next_freed =
                        self.control.freed_segments.iter().copied().filter(|&s| s > segment_number).min();
                    match next_freed {
                        Some(freed) => {
                            self.control.hint = self.cfg.absolute(freed, 0);
                        }
                        None => {
                            self.control.hint = self.cfg.absolute(segment_number + 1, 0);
                        }
                    }
                }
            }
        }
    }

    /// The highest segment number touched by any record ever set, or `0`
    /// for a fresh bitmap.
    pub fn highest_segment(&self) -> u32 {
        if self.control.high_water == 0 { 0 } else { self.cfg.segment_of(self.control.high_water - 1) }
    }

    /// A clone of one segment's raw bitmap bytes, for building recordsets
    /// directly from the existence bitmap, without walking an index table.
    pub fn segment_bitmap(&mut self, segment_number: u32) -> Result<Vec<u8>> {
        Ok(self.load_segment(segment_number)?.clone())
    }

    #[cfg(test)]
    fn freed_segments(&self) -> &[u32] {
        &self.control.freed_segments
    }
}

fn bit_get(bitmap: &[u8], offset: u32) -> bool {
    let byte = offset as usize / 8;
    let bit = offset % 8;
    byte < bitmap.len() && (bitmap[byte] & (1 << bit)) != 0
}

fn bit_set(bitmap: &mut [u8], offset: u32) {
    let byte = offset as usize / 8;
    let bit = offset % 8;
    bitmap[byte] |= 1 << bit;
}

fn bit_clear(bitmap: &mut [u8], offset: u32) {
    let byte = offset as usize / 8;
    let bit = offset % 8;
    bitmap[byte] &= !(1 << bit);
}

fn first_clear_bit(bitmap: &[u8], from: u32) -> Option<u32> {
    let total_bits = bitmap.len() as u32 * 8;
    for offset in from..total_bits {
        if !bit_get(bitmap, offset) {
            return Some(offset);
        }
    }
    None
}
