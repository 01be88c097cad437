//! The three-form posting-list segment codec.
//!
//! A [`Segment`] holds the set of record-number *offsets within one
//! segment* (i.e. values in `[0, S)`) that carry a particular (field,
//! value). It is a tagged sum of the three on-disk forms — `Int`, `List`,
//! `Bits` — rather than a mixin hierarchy, per the design notes'
//! re-architecture of the source's multiple-inheritance layout.

use crate::config::DatabaseConfig;
use crate::error::{Context, Error, Result};

/// Which of the three forms a posting list is currently stored as. `Int`
/// never has a page payload; `List`/`Bits` reference a page in the segment
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Int,
    List,
    Bits,
}

/// A decoded posting list for one (value, segment) pair.
///
/// Offsets are always segment-local (`< S`); absolute record numbers are
/// `segment_number * S + offset`, computed by the caller (recordset/cursor
/// layer) via [`DatabaseConfig::absolute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Int { segment_number: u32, offset: u32 },
    /// Sorted, deduplicated, segment-local offsets. Encoded on disk as
    /// big-endian `u16`s, so `S` must not exceed 65536.
    List { segment_number: u32, offsets: Vec<u16> },
    Bits { segment_number: u32, bitmap: Vec<u8> },
}

impl Segment {
    pub fn single(segment_number: u32, offset: u32) -> Self {
        Segment::Int { segment_number, offset }
    }

    pub fn segment_number(&self) -> u32 {
        match self {
            Segment::Int { segment_number, .. }
            | Segment::List { segment_number, .. }
            | Segment::Bits { segment_number, .. } => *segment_number,
        }
    }

    pub fn form(&self) -> Form {
        match self {
            Segment::Int { .. } => Form::Int,
            Segment::List { .. } => Form::List,
            Segment::Bits { .. } => Form::Bits,
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            Segment::Int { .. } => 1,
            Segment::List { offsets, .. } => offsets.len() as u32,
            Segment::Bits { bitmap, .. } => bitmap.iter().map(|b| b.count_ones()).sum(),
        }
    }

    pub fn contains(&self, offset: u32) -> bool {
        match self {
            Segment::Int { offset: o, .. } => *o == offset,
            Segment::List { offsets, .. } => {
                let offset = offset as u16;
                offsets.binary_search(&offset).is_ok()
            }
            Segment::Bits { bitmap, .. } => bit_get(bitmap, offset),
        }
    }

    pub fn first(&self) -> Option<u32> {
        match self {
            Segment::Int { offset, .. } => Some(*offset),
            Segment::List { offsets, .. } => offsets.first().map(|&o| o as u32),
            Segment::Bits { bitmap, .. } => first_set_bit(bitmap, 0),
        }
    }

    pub fn last(&self) -> Option<u32> {
        match self {
            Segment::Int { offset, .. } => Some(*offset),
            Segment::List { offsets, .. } => offsets.last().map(|&o| o as u32),
            Segment::Bits { bitmap, .. } => last_set_bit(bitmap),
        }
    }

    /// Smallest offset strictly greater than `after`, if any.
    pub fn next_after(&self, after: u32) -> Option<u32> {
        match self {
            Segment::Int { offset, .. } => (*offset > after).then_some(*offset),
            Segment::List { offsets, .. } => {
                let target = after.saturating_add(1) as u16;
                let idx = offsets.partition_point(|&o| o < target);
                offsets.get(idx).map(|&o| o as u32)
            }
            Segment::Bits { bitmap, .. } => first_set_bit(bitmap, after + 1),
        }
    }

    /// Largest offset strictly less than `before`, if any.
    pub fn prev_before(&self, before: u32) -> Option<u32> {
        match self {
            Segment::Int { offset, .. } => (*offset < before).then_some(*offset),
            Segment::List { offsets, .. } => {
                if before == 0 {
                    return None;
                }
                let target = (before - 1) as u16;
                let idx = offsets.partition_point(|&o| o <= target);
                if idx == 0 { None } else { Some(offsets[idx - 1] as u32) }
            }
            Segment::Bits { bitmap, .. } => {
                if before == 0 {
                    return None;
                }
                last_set_bit_before(bitmap, before - 1)
            }
        }
    }

    pub fn iter(&self) -> SegmentIter<'_> {
        SegmentIter { segment: self, cursor: None }
    }

    /// Insert `offset`, idempotently. Returns `true` if the count changed.
    /// May promote `Int` → `List` → `Bits` as the count crosses `cfg`'s
    /// promotion threshold.
    pub fn insert(&mut self, offset: u32, cfg: &DatabaseConfig) -> bool {
        match self {
            Segment::Int { segment_number, offset: existing } => {
                if *existing == offset {
                    return false;
                }
                let mut offsets = vec![*existing as u16, offset as u16];
                offsets.sort_unstable();
                *self = Segment::List { segment_number: *segment_number, offsets };
                true
            }
            Segment::List { segment_number, offsets } => {
                let o = offset as u16;
                match offsets.binary_search(&o) {
                    Ok(_) => false,
                    Err(idx) => {
                        offsets.insert(idx, o);
                        if offsets.len() as u32 > cfg.list_bitmap_threshold() {
                            let segment_number = *segment_number;
                            let mut bitmap = vec![0u8; cfg.bitmap_bytes()];
                            for &o in offsets.iter() {
                                bit_set(&mut bitmap, o as u32);
                            }
                            *self = Segment::Bits { segment_number, bitmap };
                        }
                        true
                    }
                }
            }
            Segment::Bits { bitmap, .. } => {
                if bit_get(bitmap, offset) {
                    false
                } else {
                    bit_set(bitmap, offset);
                    true
                }
            }
        }
    }

    /// Remove `offset`, idempotently. Returns `true` if the count changed.
    /// May demote `Bits` → `List` → `Int` as the count falls below `cfg`'s
    /// demotion thresholds. A count reaching zero is left as an empty
    /// `List`; the caller (the index table) is responsible for deleting
    /// the row and freeing the backing page in that case.
    pub fn remove(&mut self, offset: u32, cfg: &DatabaseConfig) -> bool {
        match self {
            Segment::Int { offset: existing, segment_number } => {
                if *existing == offset {
                    *self = Segment::List { segment_number: *segment_number, offsets: Vec::new() };
                    true
                } else {
                    false
                }
            }
            Segment::List { segment_number, offsets } => {
                let o = offset as u16;
                match offsets.binary_search(&o) {
                    Err(_) => false,
                    Ok(idx) => {
                        offsets.remove(idx);
                        if offsets.len() == 1 {
                            *self = Segment::Int { segment_number: *segment_number, offset: offsets[0] as u32 };
                        }
                        true
                    }
                }
            }
            Segment::Bits { segment_number, bitmap } => {
                if !bit_get(bitmap, offset) {
                    return false;
                }
                bit_clear(bitmap, offset);
                let count = bitmap.iter().map(|b| b.count_ones()).sum::<u32>();
                if count < cfg.bitmap_demote_threshold() {
                    let mut offsets: Vec<u16> = Vec::with_capacity(count as usize);
                    collect_bits(bitmap, &mut offsets);
                    let segment_number = *segment_number;
                    if offsets.len() == 1 {
                        *self = Segment::Int { segment_number, offset: offsets[0] as u32 };
                    } else {
                        *self = Segment::List { segment_number, offsets };
                    }
                }
                true
            }
        }
    }

    /// Decode a `List` or `Bits` page payload. `Int` segments never come
    /// from a page; construct them with [`Segment::single`].
    pub fn decode(form: Form, bytes: &[u8], segment_number: u32, cfg: &DatabaseConfig) -> Result<Segment> {
        match form {
            Form::Int => Err(Error::CorruptSegment {
                expected_one_of: "Int form has no page payload",
                got: bytes.len(),
                ctx: Context::new().with_segment(segment_number),
            }),
            Form::List => {
                if bytes.len() % 2 != 0 {
                    return Err(Error::CorruptSegment {
                        expected_one_of: "multiple of 2",
                        got: bytes.len(),
                        ctx: Context::new().with_segment(segment_number),
                    });
                }
                let offsets = bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
                Ok(Segment::List { segment_number, offsets })
            }
            Form::Bits => {
                if bytes.len() != cfg.bitmap_bytes() {
                    return Err(Error::CorruptSegment {
                        expected_one_of: "S/8 bytes",
                        got: bytes.len(),
                        ctx: Context::new().with_segment(segment_number),
                    });
                }
                Ok(Segment::Bits { segment_number, bitmap: bytes.to_vec() })
            }
        }
    }

    /// Encode this segment's page payload, if it has one (`Int` segments
    /// store their record number inline in the index row instead).
    pub fn encode_page(&self) -> Option<Vec<u8>> {
        match self {
            Segment::Int { .. } => None,
            Segment::List { offsets, .. } => {
                let mut out = Vec::with_capacity(offsets.len() * 2);
                for &o in offsets {
                    out.extend_from_slice(&o.to_be_bytes());
                }
                Some(out)
            }
            Segment::Bits { bitmap, .. } => Some(bitmap.clone()),
        }
    }

    fn offsets_owned(&self) -> Vec<u32> {
        self.iter().collect()
    }

    fn from_offsets(segment_number: u32, mut offsets: Vec<u32>, cfg: &DatabaseConfig) -> Segment {
        offsets.sort_unstable();
        offsets.dedup();
        match offsets.len() {
            0 => Segment::List { segment_number, offsets: Vec::new() },
            1 => Segment::Int { segment_number, offset: offsets[0] },
            n if (n as u32) <= cfg.list_bitmap_threshold() => {
                Segment::List { segment_number, offsets: offsets.into_iter().map(|o| o as u16).collect() }
            }
            _ => {
                let mut bitmap = vec![0u8; cfg.bitmap_bytes()];
                for o in offsets {
                    bit_set(&mut bitmap, o);
                }
                Segment::Bits { segment_number, bitmap }
            }
        }
    }

    fn check_same_segment(&self, other: &Segment) -> Result<u32> {
        if self.segment_number() != other.segment_number() {
            return Err(Error::backend(
                format!(
                    "cannot combine segments from different segment numbers ({} vs {})",
                    self.segment_number(),
                    other.segment_number()
                ),
                Context::new(),
            ));
        }
        Ok(self.segment_number())
    }

    pub fn union(&self, other: &Segment, cfg: &DatabaseConfig) -> Result<Segment> {
        let seg = self.check_same_segment(other)?;
        let mut a = self.offsets_owned();
        a.extend(other.offsets_owned());
        Ok(Segment::from_offsets(seg, a, cfg))
    }

    /// Returns `None` if the intersection is empty (per the algebra table:
    /// the caller drops the row in that case).
    pub fn intersection(&self, other: &Segment, cfg: &DatabaseConfig) -> Result<Option<Segment>> {
        let seg = self.check_same_segment(other)?;
        let a = self.offsets_owned();
        let result: Vec<u32> = a.into_iter().filter(|o| other.contains(*o)).collect();
        if result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Segment::from_offsets(seg, result, cfg)))
        }
    }

    /// `self - other`. `None` if empty.
    pub fn difference(&self, other: &Segment, cfg: &DatabaseConfig) -> Result<Option<Segment>> {
        let seg = self.check_same_segment(other)?;
        let a = self.offsets_owned();
        let result: Vec<u32> = a.into_iter().filter(|o| !other.contains(*o)).collect();
        if result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Segment::from_offsets(seg, result, cfg)))
        }
    }

    pub fn symmetric_difference(&self, other: &Segment, cfg: &DatabaseConfig) -> Result<Option<Segment>> {
        let seg = self.check_same_segment(other)?;
        let a = self.offsets_owned();
        let b = other.offsets_owned();
        let mut result: Vec<u32> = a.iter().copied().filter(|o| !other.contains(*o)).collect();
        result.extend(b.into_iter().filter(|o| !self.contains(*o)));
        if result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Segment::from_offsets(seg, result, cfg)))
        }
    }
}

pub struct SegmentIter<'a> {
    segment: &'a Segment,
    cursor: Option<u32>,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let next = match self.cursor {
            None => self.segment.first(),
            Some(c) => self.segment.next_after(c),
        };
        self.cursor = next;
        next
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

fn first_set_bit(bitmap: &[u8], from: u32) -> Option<u32> {
    let total_bits = bitmap.len() as u32 * 8;
    for offset in from..total_bits {
        if bit_get(bitmap, offset) {
            return Some(offset);
        }
    }
    None
}

fn last_set_bit(bitmap: &[u8]) -> Option<u32> {
    let total_bits = bitmap.len() as u32 * 8;
    if total_bits == 0 {
        return None;
    }
    last_set_bit_before(bitmap, total_bits - 1)
}

fn last_set_bit_before(bitmap: &[u8], at_or_before: u32) -> Option<u32> {
    let mut offset = at_or_before as i64;
    while offset >= 0 {
        if bit_get(bitmap, offset as u32) {
            return Some(offset as u32);
        }
        offset -= 1;
    }
    None
}

fn collect_bits(bitmap: &[u8], out: &mut Vec<u16>) {
    let total_bits = bitmap.len() as u32 * 8;
    for offset in 0..total_bits {
        if bit_get(bitmap, offset) {
            out.push(offset as u16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DatabaseConfig {
        DatabaseConfig::new(128).with_threshold(6)
    }

    #[test]
    fn int_promotes_to_list_on_second_insert() {
        let mut seg = Segment::single(0, 5);
        assert!(seg.insert(7, &cfg()));
        assert_eq!(seg.form(), Form::List);
        assert_eq!(seg.count(), 2);
        assert!(seg.contains(5));
        assert!(seg.contains(7));
    }

    #[test]
    fn list_promotes_to_bits_past_threshold() {
        let mut seg = Segment::List { segment_number: 0, offsets: vec![] };
        let cfg = cfg();
        for i in 0..6u32 {
            assert!(seg.insert(i, &cfg));
        }
        assert_eq!(seg.form(), Form::List);
        assert!(seg.insert(6, &cfg));
        assert_eq!(seg.form(), Form::Bits);
        assert_eq!(seg.count(), 7);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut seg = Segment::single(0, 5);
        let cfg = cfg();
        assert!(!seg.insert(5, &cfg));
        assert_eq!(seg.count(), 1);
    }

    #[test]
    fn remove_demotes_bits_to_list_then_int() {
        let cfg = cfg();
        let mut seg = Segment::List { segment_number: 0, offsets: vec![] };
        for i in 0..20u32 {
            seg.insert(i, &cfg);
        }
        assert_eq!(seg.form(), Form::Bits);
        for i in 0..18u32 {
            seg.remove(i, &cfg);
        }
        // count is now 2 (18, 19), well below the demote threshold.
        assert_eq!(seg.form(), Form::List);
        seg.remove(18, &cfg);
        assert_eq!(seg.form(), Form::Int);
        assert_eq!(seg.count(), 1);
    }

    #[test]
    fn remove_is_idempotent_on_absent() {
        let cfg = cfg();
        let mut seg = Segment::single(0, 5);
        assert!(!seg.remove(9, &cfg));
        assert_eq!(seg.count(), 1);
    }

    #[test]
    fn round_trip_list_encoding() {
        let cfg = cfg();
        let seg = Segment::List { segment_number: 3, offsets: vec![1, 2, 100] };
        let bytes = seg.encode_page().unwrap();
        let decoded = Segment::decode(Form::List, &bytes, 3, &cfg).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn round_trip_bits_encoding() {
        let cfg = cfg();
        let mut seg = Segment::List { segment_number: 1, offsets: vec![] };
        for i in 0..40u32 {
            seg.insert(i, &cfg);
        }
        assert_eq!(seg.form(), Form::Bits);
        let bytes = seg.encode_page().unwrap();
        let decoded = Segment::decode(Form::Bits, &bytes, 1, &cfg).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn corrupt_bits_length_is_rejected() {
        let cfg = cfg();
        let bad = vec![0u8; cfg.bitmap_bytes() - 1];
        assert!(Segment::decode(Form::Bits, &bad, 0, &cfg).is_err());
    }

    #[test]
    fn union_intersection_difference_symmetric_difference() {
        let cfg = cfg();
        let a = Segment::from_offsets(0, vec![0, 1, 5], &cfg);
        let b = Segment::from_offsets(0, vec![2], &cfg);
        assert_eq!(a.union(&b, &cfg).unwrap().offsets_owned(), vec![0, 1, 2, 5]);
        assert!(a.intersection(&b, &cfg).unwrap().is_none());
        assert_eq!(a.difference(&b, &cfg).unwrap().unwrap().offsets_owned(), vec![0, 1, 5]);
        assert_eq!(a.symmetric_difference(&b, &cfg).unwrap().unwrap().offsets_owned(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn intersection_of_disjoint_is_none() {
        let cfg = cfg();
        let a = Segment::from_offsets(0, vec![1], &cfg);
        let b = Segment::from_offsets(0, vec![2], &cfg);
        assert!(a.intersection(&b, &cfg).unwrap().is_none());
    }

    #[test]
    fn combine_across_different_segments_errors() {
        let cfg = cfg();
        let a = Segment::from_offsets(0, vec![1], &cfg);
        let b = Segment::from_offsets(1, vec![1], &cfg);
        assert!(a.union(&b, &cfg).is_err());
    }

    #[test]
    fn iterator_visits_all_members_in_order() {
        let cfg = cfg();
        let seg = Segment::from_offsets(0, vec![40, 1, 20, 0], &cfg);
        let collected: Vec<u32> = seg.iter().collect();
        assert_eq!(collected, vec![0, 1, 20, 40]);
    }

    #[test]
    fn prev_before_and_next_after_bound_correctly() {
        let cfg = cfg();
        let seg = Segment::from_offsets(0, vec![5, 10, 15], &cfg);
        assert_eq!(seg.next_after(5), Some(10));
        assert_eq!(seg.next_after(15), None);
        assert_eq!(seg.prev_before(10), Some(5));
        assert_eq!(seg.prev_before(5), None);
    }
}
